//! MediaTek BROM / Preloader client.
//!
//! BROM speaks a byte-echo protocol: the host writes a command byte, the
//! device echoes it back, then big-endian arguments and a `u16` status word
//! follow. The same command set (minus `SEND_CERT`) is answered by the
//! Preloader after its `READY` greeting.

use std::time::Duration;

use crate::{
  transport::{CancelToken, SharedTransport, Transport},
  Error, Result, COMMAND_TIMEOUT, DATA_TIMEOUT, HANDSHAKE_TIMEOUT, STREAM_BLOCK_SIZE,
};

use super::{
  chips,
  chips::ChipRecord,
  wire::{recv_exact, recv_u16_be, recv_u32_be},
  TargetConfig, STATUS_OK, WATCHDOG_DISABLE,
};

pub const CMD_GET_HW_SW_VER: u8 = 0xfc;
pub const CMD_GET_HW_CODE: u8 = 0xfd;
pub const CMD_GET_BL_VER: u8 = 0xfe;
pub const CMD_READ32: u8 = 0xd1;
pub const CMD_WRITE32: u8 = 0xd4;
pub const CMD_JUMP_DA: u8 = 0xd5;
pub const CMD_SEND_DA: u8 = 0xd7;
pub const CMD_GET_TARGET_CONFIG: u8 = 0xd8;
pub const CMD_SEND_CERT: u8 = 0xe0;
pub const CMD_GET_ME_ID: u8 = 0xe1;
pub const CMD_GET_SOC_ID: u8 = 0xe7;

const HANDSHAKE_TX: [u8; 4] = [0xa0, 0x0a, 0x50, 0x05];
const HANDSHAKE_RX: [u8; 4] = [0x5f, 0xf5, 0xaf, 0xfa];
pub const DEFAULT_HANDSHAKE_ATTEMPTS: usize = 100;

/// Which boot stage is answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BromMode {
  Brom,
  Preloader,
}

/// Identification read during [`BromClient::identify`].
#[derive(Debug, Clone)]
pub struct ChipIdentity {
  pub hw_code: u16,
  pub hw_subcode: u16,
  pub hw_version: u16,
  pub sw_version: u16,
  pub target_config: TargetConfig,
  pub me_id: Vec<u8>,
  pub soc_id: Vec<u8>,
  /// False when the chip is absent from the chip table and defaults are in
  /// play.
  pub verified: bool,
}

pub struct BromClient {
  port: SharedTransport,
  cancel: CancelToken,
  mode: Option<BromMode>,
  connected: bool,
}

fn check_status(port: &mut dyn Transport, timeout: Duration) -> Result<()> {
  let status = recv_u16_be(port, timeout)?;
  if status != STATUS_OK {
    return Err(Error::DaRejected(status as u32));
  }
  Ok(())
}

/// Write a command byte and consume the device's echo of it.
fn echo_cmd(port: &mut dyn Transport, cmd: u8) -> Result<()> {
  port.send(&[cmd], COMMAND_TIMEOUT)?;
  let echo = recv_exact(port, 1, COMMAND_TIMEOUT)?;
  if echo[0] != cmd {
    return Err(Error::UnexpectedPrefix(format!(
      "command {cmd:#04x} echoed as {:#04x}",
      echo[0]
    )));
  }
  Ok(())
}

fn send_u32(port: &mut dyn Transport, value: u32) -> Result<()> {
  port.send(&value.to_be_bytes(), COMMAND_TIMEOUT)
}

/// XOR of the buffer folded into 16-bit little-endian words; a trailing odd
/// byte lands in the low half.
pub fn xor16(buf: &[u8]) -> u16 {
  let mut checksum: u16 = 0;
  let mut words = buf.chunks_exact(2);
  for word in &mut words {
    checksum ^= u16::from_le_bytes([word[0], word[1]]);
  }
  if let [tail] = words.remainder() {
    checksum ^= *tail as u16;
  }
  checksum
}

impl BromClient {
  pub fn new(port: SharedTransport, cancel: CancelToken) -> Self {
    Self {
      port,
      cancel,
      mode: None,
      connected: false,
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn Transport>>> {
    self.port.lock().map_err(|_| Error::IoClosed)
  }

  pub fn is_connected(&self) -> bool {
    self.connected
  }

  /// Boot stage detected during the handshake, if it completed.
  pub fn mode(&self) -> Option<BromMode> {
    self.mode
  }

  pub fn is_brom_mode(&self) -> bool {
    self.mode == Some(BromMode::Brom)
  }

  /// Run the start-byte handshake, retrying up to `attempts` times.
  ///
  /// The Preloader announces itself with a `READY` greeting before the
  /// handshake bytes; raw BROM stays silent, which is how the mode is told
  /// apart.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self)))]
  pub fn handshake(&mut self, attempts: usize) -> Result<()> {
    let mut port = self.lock()?;

    // drain any greeting; its presence marks Preloader mode
    let greeting = port.receive(64, Duration::from_millis(100)).unwrap_or_default();
    let mode = if greeting.windows(5).any(|w| w == b"READY") {
      BromMode::Preloader
    } else {
      BromMode::Brom
    };

    for attempt in 0..attempts.max(1) {
      self.cancel.check()?;

      let result = (|| -> Result<()> {
        for (tx, rx) in HANDSHAKE_TX.iter().zip(HANDSHAKE_RX.iter()) {
          port.send(&[*tx], HANDSHAKE_TIMEOUT)?;
          let reply = recv_exact(port.as_mut(), 1, HANDSHAKE_TIMEOUT)?;
          if reply[0] != *rx {
            return Err(Error::UnexpectedPrefix(format!(
              "handshake byte {tx:#04x} answered {:#04x}",
              reply[0]
            )));
          }
        }
        Ok(())
      })();

      match result {
        Ok(()) => {
          tracing::info!("handshake complete after {} attempt(s), mode {:?}", attempt + 1, mode);
          drop(port);
          self.mode = Some(mode);
          self.connected = true;
          return Ok(());
        }
        Err(err) => {
          tracing::trace!("handshake attempt {} failed: {}", attempt + 1, err);
          std::thread::sleep(Duration::from_millis(20));
        }
      }
    }

    Err(Error::HandshakeFailed(attempts))
  }

  /// Read `hw_code` and resolve the chip record.
  pub fn get_hw_code(&mut self) -> Result<u16> {
    let mut port = self.lock()?;
    echo_cmd(port.as_mut(), CMD_GET_HW_CODE)?;
    let hw_code = recv_u16_be(port.as_mut(), COMMAND_TIMEOUT)?;
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    tracing::debug!("hw_code {:#06x}", hw_code);
    Ok(hw_code)
  }

  /// Read `(hw_subcode, hw_version, sw_version)`.
  pub fn get_hw_sw_ver(&mut self) -> Result<(u16, u16, u16)> {
    let mut port = self.lock()?;
    echo_cmd(port.as_mut(), CMD_GET_HW_SW_VER)?;
    let hw_subcode = recv_u16_be(port.as_mut(), COMMAND_TIMEOUT)?;
    let hw_version = recv_u16_be(port.as_mut(), COMMAND_TIMEOUT)?;
    let sw_version = recv_u16_be(port.as_mut(), COMMAND_TIMEOUT)?;
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    Ok((hw_subcode, hw_version, sw_version))
  }

  /// Boot-loader version byte. Replies without a status word.
  pub fn get_bl_ver(&mut self) -> Result<u8> {
    let mut port = self.lock()?;
    port.send(&[CMD_GET_BL_VER], COMMAND_TIMEOUT)?;
    let reply = recv_exact(port.as_mut(), 1, COMMAND_TIMEOUT)?;
    Ok(reply[0])
  }

  pub fn get_target_config(&mut self) -> Result<TargetConfig> {
    let mut port = self.lock()?;
    echo_cmd(port.as_mut(), CMD_GET_TARGET_CONFIG)?;
    let config = recv_u32_be(port.as_mut(), COMMAND_TIMEOUT)?;
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    tracing::debug!("target config {}", TargetConfig(config));
    Ok(TargetConfig(config))
  }

  /// 16-byte mobile equipment id.
  pub fn get_me_id(&mut self) -> Result<Vec<u8>> {
    self.read_id(CMD_GET_ME_ID)
  }

  /// 32-byte SoC id.
  pub fn get_soc_id(&mut self) -> Result<Vec<u8>> {
    self.read_id(CMD_GET_SOC_ID)
  }

  fn read_id(&mut self, cmd: u8) -> Result<Vec<u8>> {
    let mut port = self.lock()?;
    echo_cmd(port.as_mut(), cmd)?;
    let length = recv_u32_be(port.as_mut(), COMMAND_TIMEOUT)? as usize;
    if length > 0x100 {
      return Err(Error::UnexpectedPrefix(format!("id length {length} out of range")));
    }
    let id = recv_exact(port.as_mut(), length, COMMAND_TIMEOUT)?;
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    Ok(id)
  }

  /// Full identification pass: hw code, versions, target config, ids, chip
  /// table lookup (alias-aware).
  pub fn identify(&mut self) -> Result<(ChipIdentity, ChipRecord)> {
    let hw_code = self.get_hw_code()?;
    let (hw_subcode, hw_version, sw_version) = self.get_hw_sw_ver()?;
    let target_config = self.get_target_config()?;
    let me_id = self.get_me_id().unwrap_or_default();
    let soc_id = self.get_soc_id().unwrap_or_default();

    let (record, verified) = match chips::lookup_chip(hw_code) {
      Some(record) => (record.clone(), true),
      None => {
        tracing::warn!("unknown chip {:#06x}, continuing with best-effort defaults", hw_code);
        (ChipRecord::best_effort(hw_code), false)
      }
    };

    tracing::info!(
      "chip {} ({:#06x}), me_id {}, soc_id {}",
      record.name,
      hw_code,
      hex::encode(&me_id),
      hex::encode(&soc_id)
    );

    Ok((
      ChipIdentity {
        hw_code,
        hw_subcode,
        hw_version,
        sw_version,
        target_config,
        me_id,
        soc_id,
        verified,
      },
      record,
    ))
  }

  /// `MEM_READ32`: read `count` words from `addr`.
  pub fn read32(&mut self, addr: u32, count: u32) -> Result<Vec<u32>> {
    let mut port = self.lock()?;
    echo_cmd(port.as_mut(), CMD_READ32)?;
    send_u32(port.as_mut(), addr)?;
    send_u32(port.as_mut(), count)?;
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
      values.push(recv_u32_be(port.as_mut(), COMMAND_TIMEOUT)?);
    }
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    Ok(values)
  }

  /// `MEM_WRITE32`: write words starting at `addr`.
  pub fn write32(&mut self, addr: u32, values: &[u32]) -> Result<()> {
    let mut port = self.lock()?;
    echo_cmd(port.as_mut(), CMD_WRITE32)?;
    send_u32(port.as_mut(), addr)?;
    send_u32(port.as_mut(), values.len() as u32)?;
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    for value in values {
      send_u32(port.as_mut(), *value)?;
    }
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    Ok(())
  }

  /// Park the watchdog before a DA load.
  pub fn disable_watchdog(&mut self, watchdog_addr: u32) -> Result<()> {
    tracing::debug!("disabling watchdog at {:#010x}", watchdog_addr);
    self.write32(watchdog_addr, &[WATCHDOG_DISABLE])
  }

  /// `SEND_DA`: upload a DA stage.
  ///
  /// `declared_len` is the length field sent to the device; the full
  /// `data` buffer is transmitted even when it is longer, because signed
  /// DAs carry a metadata tail the device checksums but does not count.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self, data)))]
  pub fn send_da(&mut self, load_addr: u32, declared_len: u32, sig_len: u32, data: &[u8]) -> Result<()> {
    let mut port = self.lock()?;
    echo_cmd(port.as_mut(), CMD_SEND_DA)?;
    send_u32(port.as_mut(), load_addr)?;
    send_u32(port.as_mut(), declared_len)?;
    send_u32(port.as_mut(), sig_len)?;
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    for block in data.chunks(STREAM_BLOCK_SIZE) {
      self.cancel.check()?;
      port.send(block, DATA_TIMEOUT)?;
    }

    let device_checksum = recv_u16_be(port.as_mut(), DATA_TIMEOUT)?;
    let host_checksum = xor16(data);
    if device_checksum != host_checksum {
      return Err(Error::DaSignatureMismatch {
        host: host_checksum,
        device: device_checksum,
      });
    }
    check_status(port.as_mut(), DATA_TIMEOUT)?;

    tracing::info!("DA stage uploaded: {} bytes to {:#010x}", data.len(), load_addr);
    Ok(())
  }

  /// `SEND_CERT`: push a chip-specific bypass image. BROM mode only.
  pub fn send_cert(&mut self, payload: &[u8]) -> Result<()> {
    if !self.is_brom_mode() {
      return Err(Error::ExploitNotApplicable("SEND_CERT requires BROM mode".into()));
    }

    let mut port = self.lock()?;
    echo_cmd(port.as_mut(), CMD_SEND_CERT)?;
    send_u32(port.as_mut(), payload.len() as u32)?;
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    for block in payload.chunks(STREAM_BLOCK_SIZE) {
      self.cancel.check()?;
      port.send(block, DATA_TIMEOUT)?;
    }
    check_status(port.as_mut(), DATA_TIMEOUT)?;

    tracing::info!("certificate payload sent ({} bytes)", payload.len());
    Ok(())
  }

  /// `JUMP_DA`: transfer control to the uploaded stage. The port drops and
  /// comes back under a new identity afterwards.
  pub fn jump_da(&mut self, load_addr: u32) -> Result<()> {
    let mut port = self.lock()?;
    echo_cmd(port.as_mut(), CMD_JUMP_DA)?;
    send_u32(port.as_mut(), load_addr)?;
    check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    drop(port);
    tracing::info!("jumped to DA at {:#010x}", load_addr);
    self.connected = false;
    Ok(())
  }

  /// Identity of the underlying port, for re-enumeration exclusion.
  pub fn port_identity(&self) -> Result<String> {
    Ok(self.lock()?.identity())
  }

  /// Drop the transport, e.g. ahead of a re-enumeration wait.
  pub fn release(&mut self) -> Result<()> {
    self.connected = false;
    self.lock()?.disconnect()
  }
}
