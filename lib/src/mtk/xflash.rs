//! XFlash (V5) Download-Agent client.
//!
//! Every exchange is a 12-byte little-endian frame header (magic, data
//! type, payload length) followed by the payload. Commands and status
//! words travel as 4-byte ProtocolFlow payloads. Bulk data rides the same
//! framing, optionally trailed by a CRC32 when the host enabled the
//! integrity mode during the runtime-parameter exchange.

use std::time::Duration;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::{
  transport::{CancelToken, SharedTransport, Transport},
  Error, Result, COMMAND_TIMEOUT, DATA_TIMEOUT, STREAM_BLOCK_SIZE,
};

use super::{
  da::{DaPartition, DaProtocol, RuntimeParams},
  wire::recv_exact,
  ConnAgent, StorageType,
};

pub const FRAME_MAGIC: u32 = 0xfeee_eeef;

/// Frame payload kinds.
pub const DT_PROTOCOL_FLOW: u32 = 1;
pub const DT_MESSAGE: u32 = 2;

pub const CMD_DOWNLOAD: u32 = 0x01_0001;
pub const CMD_UPLOAD: u32 = 0x01_0002;
pub const CMD_FORMAT: u32 = 0x01_0003;
pub const CMD_WRITE_DATA: u32 = 0x01_0004;
pub const CMD_READ_DATA: u32 = 0x01_0005;
pub const CMD_FORMAT_PARTITION: u32 = 0x01_0006;
pub const CMD_SHUTDOWN: u32 = 0x01_0007;
pub const CMD_BOOT_TO: u32 = 0x01_0008;
pub const CMD_DEVICE_CTRL: u32 = 0x01_0009;
pub const CMD_INIT_EXT_RAM: u32 = 0x01_000a;

pub const CTRL_GET_PACKET_LENGTH: u32 = 0x04_0001;
pub const CTRL_GET_CONNECTION_AGENT: u32 = 0x04_0002;
pub const CTRL_SET_RUNTIME_PARAMETER: u32 = 0x04_0003;
pub const CTRL_GET_PARTITION_TABLE: u32 = 0x04_0004;
pub const CTRL_GET_STORAGE_INFO: u32 = 0x04_0005;
pub const CTRL_READ32: u32 = 0x04_0006;
pub const CTRL_WRITE32: u32 = 0x04_0007;

/// Shutdown-command modes.
const MODE_POWER_OFF: u32 = 0;
const MODE_REBOOT: u32 = 1;

/// One partition-table row on the wire: 64-byte name, start, count, type,
/// attrs, padding.
const PT_RECORD_SIZE: usize = 96;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub struct XFlash {
  port: SharedTransport,
  cancel: CancelToken,
  storage: Option<StorageType>,
  write_packet_len: Option<usize>,
  /// Append a CRC32 to outgoing data frames (runtime checksum level 1).
  checksum_frames: bool,
}

impl XFlash {
  pub fn new(port: SharedTransport, cancel: CancelToken) -> Self {
    Self {
      port,
      cancel,
      storage: None,
      write_packet_len: None,
      checksum_frames: false,
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn Transport>>> {
    self.port.lock().map_err(|_| Error::IoClosed)
  }

  fn send_frame(port: &mut dyn Transport, dtype: u32, payload: &[u8], cancel: &CancelToken) -> Result<()> {
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&dtype.to_le_bytes());
    header[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    port.send(&header, COMMAND_TIMEOUT)?;

    for block in payload.chunks(STREAM_BLOCK_SIZE) {
      cancel.check()?;
      port.send(block, DATA_TIMEOUT)?;
    }
    Ok(())
  }

  fn read_frame(port: &mut dyn Transport, timeout: Duration) -> Result<(u32, Vec<u8>)> {
    let header = recv_exact(port, 12, timeout)?;
    let magic = u32::from_le_bytes(header[0..4].try_into()?);
    if magic != FRAME_MAGIC {
      return Err(Error::UnexpectedPrefix(format!("xflash frame magic {magic:#010x}")));
    }
    let dtype = u32::from_le_bytes(header[4..8].try_into()?);
    let length = u32::from_le_bytes(header[8..12].try_into()?) as usize;
    let payload = recv_exact(port, length, timeout)?;
    Ok((dtype, payload))
  }

  fn send_cmd(port: &mut dyn Transport, cmd: u32, cancel: &CancelToken) -> Result<()> {
    tracing::trace!("xflash cmd {:#010x}", cmd);
    Self::send_frame(port, DT_PROTOCOL_FLOW, &cmd.to_le_bytes(), cancel)
  }

  /// Outgoing bulk payload, CRC-trailed when the integrity mode is on.
  fn send_data(&self, port: &mut dyn Transport, data: &[u8]) -> Result<()> {
    if self.checksum_frames {
      let mut framed = Vec::with_capacity(data.len() + 4);
      framed.extend_from_slice(data);
      framed.extend_from_slice(&CRC32.checksum(data).to_le_bytes());
      Self::send_frame(port, DT_PROTOCOL_FLOW, &framed, &self.cancel)
    } else {
      Self::send_frame(port, DT_PROTOCOL_FLOW, data, &self.cancel)
    }
  }

  fn read_status(port: &mut dyn Transport, timeout: Duration) -> Result<u32> {
    let (_, payload) = Self::read_frame(port, timeout)?;
    if payload.len() < 4 {
      return Err(Error::UnexpectedPrefix(format!("status frame of {} bytes", payload.len())));
    }
    Ok(u32::from_le_bytes(payload[0..4].try_into()?))
  }

  fn check_status(port: &mut dyn Transport, timeout: Duration) -> Result<()> {
    let status = Self::read_status(port, timeout)?;
    if status != 0 {
      return Err(Error::DaRejected(status));
    }
    Ok(())
  }

  /// `DEVICE_CTRL` query: returns the result frame payload. `arg` rides
  /// appended to the control code when the query takes one.
  fn devctrl_query(&self, code: u32, arg: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut port = self.lock()?;
    Self::send_cmd(port.as_mut(), CMD_DEVICE_CTRL, &self.cancel)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    let mut request = code.to_le_bytes().to_vec();
    if let Some(arg) = arg {
      request.extend_from_slice(arg);
    }
    self.send_data(port.as_mut(), &request)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    let (_, result) = Self::read_frame(port.as_mut(), COMMAND_TIMEOUT)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    Ok(result)
  }

  /// `DEVICE_CTRL` setter: pushes a parameter payload.
  fn devctrl_set(&self, code: u32, payload: &[u8]) -> Result<()> {
    let mut port = self.lock()?;
    Self::send_cmd(port.as_mut(), CMD_DEVICE_CTRL, &self.cancel)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    self.send_data(port.as_mut(), &code.to_le_bytes())?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    self.send_data(port.as_mut(), payload)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)
  }

  /// Negotiated write-packet length, cached after the first query.
  fn write_packet_length(&mut self) -> Result<usize> {
    if let Some(len) = self.write_packet_len {
      return Ok(len);
    }
    let reply = self.devctrl_query(CTRL_GET_PACKET_LENGTH, None)?;
    if reply.len() < 8 {
      return Err(Error::UnexpectedPrefix("short packet-length reply".into()));
    }
    let write_len = (u32::from_le_bytes(reply[0..4].try_into()?) as usize).max(0x1000);
    tracing::debug!("xflash write packet length {:#x}", write_len);
    self.write_packet_len = Some(write_len);
    Ok(write_len)
  }

  fn sector_size(&mut self) -> Result<u64> {
    Ok(self.storage()?.sector_size())
  }
}

impl DaProtocol for XFlash {
  fn conn_agent(&mut self) -> Result<ConnAgent> {
    let reply = self.devctrl_query(CTRL_GET_CONNECTION_AGENT, None)?;
    let text = String::from_utf8_lossy(&reply);
    let agent = text.trim_end_matches('\0');
    match agent {
      "brom" => Ok(ConnAgent::Brom),
      "preloader" => Ok(ConnAgent::Preloader),
      other => Err(Error::UnexpectedPrefix(format!("connection agent {other:?}"))),
    }
  }

  fn set_runtime_parameters(&mut self, params: &RuntimeParams) -> Result<()> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&params.host_mtu.to_le_bytes());
    payload.extend_from_slice(&(params.verbose as u32).to_le_bytes());
    payload.extend_from_slice(&params.checksum_level.to_le_bytes());

    match self.devctrl_set(CTRL_SET_RUNTIME_PARAMETER, &payload) {
      Ok(()) => {
        self.checksum_frames = params.checksum_level > 0;
        tracing::info!("runtime parameters accepted (checksum level {})", params.checksum_level);
        Ok(())
      }
      Err(Error::DaRejected(status)) => Err(Error::RuntimeParametersRefused(status)),
      Err(err) => Err(err),
    }
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self, data)))]
  fn boot_to(&mut self, addr: u32, data: &[u8]) -> Result<()> {
    let mut port = self.lock()?;
    Self::send_cmd(port.as_mut(), CMD_BOOT_TO, &self.cancel)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    let mut param = Vec::with_capacity(16);
    param.extend_from_slice(&(addr as u64).to_le_bytes());
    param.extend_from_slice(&(data.len() as u64).to_le_bytes());
    self.send_data(port.as_mut(), &param)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    self.send_data(port.as_mut(), data)?;
    Self::check_status(port.as_mut(), DATA_TIMEOUT)?;

    tracing::info!("boot_to {:#010x} with {} bytes", addr, data.len());
    Ok(())
  }

  fn init_ext_ram(&mut self, emi: &[u8]) -> Result<()> {
    let mut port = self.lock()?;
    Self::send_cmd(port.as_mut(), CMD_INIT_EXT_RAM, &self.cancel)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    self.send_data(port.as_mut(), emi)?;
    Self::check_status(port.as_mut(), DATA_TIMEOUT)?;
    tracing::info!("EMI configuration sent ({} bytes)", emi.len());
    Ok(())
  }

  fn storage(&mut self) -> Result<StorageType> {
    if let Some(storage) = self.storage {
      return Ok(storage);
    }
    let reply = self.devctrl_query(CTRL_GET_STORAGE_INFO, None)?;
    if reply.len() < 4 {
      return Err(Error::UnexpectedPrefix("short storage-info reply".into()));
    }
    let code = u32::from_le_bytes(reply[0..4].try_into()?);
    let storage = StorageType::from_code(code)
      .ok_or_else(|| Error::UnexpectedPrefix(format!("storage code {code}")))?;
    self.storage = Some(storage);
    Ok(storage)
  }

  fn read_partition_table(&mut self) -> Result<Vec<DaPartition>> {
    let sector_size = self.sector_size()?;
    let table = self.devctrl_query(CTRL_GET_PARTITION_TABLE, None)?;

    let mut partitions = vec![];
    for record in table.chunks_exact(PT_RECORD_SIZE) {
      let name_end = record[..64].iter().position(|&b| b == 0).unwrap_or(64);
      let name = String::from_utf8_lossy(&record[..name_end]).into_owned();
      if name.is_empty() {
        continue;
      }
      let start_sector = u64::from_le_bytes(record[64..72].try_into()?);
      let sector_count = u64::from_le_bytes(record[72..80].try_into()?);
      let type_code = u32::from_le_bytes(record[80..84].try_into()?);
      let attrs = u64::from_le_bytes(record[84..92].try_into()?);

      partitions.push(DaPartition {
        name,
        start_sector,
        sector_count,
        size: sector_count * sector_size,
        part_type: match type_code {
          0 => "gpt".into(),
          1 => "raw".into(),
          other => format!("type-{other}"),
        },
        attrs,
      });
    }

    tracing::info!("partition table: {} entries", partitions.len());
    Ok(partitions)
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self, progress)))]
  fn read_partition(
    &mut self,
    name: &str,
    size: Option<u64>,
    progress: &mut dyn FnMut(u64, u64),
  ) -> Result<Vec<u8>> {
    let mut port = self.lock()?;
    Self::send_cmd(port.as_mut(), CMD_UPLOAD, &self.cancel)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    self.send_data(port.as_mut(), name.as_bytes())?;
    self.send_data(port.as_mut(), &size.unwrap_or(0).to_le_bytes())?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    // device leads with the effective byte count
    let (_, total_frame) = Self::read_frame(port.as_mut(), COMMAND_TIMEOUT)?;
    if total_frame.len() < 8 {
      return Err(Error::UnexpectedPrefix("short upload length frame".into()));
    }
    let total = u64::from_le_bytes(total_frame[0..8].try_into()?);

    let mut buffer = Vec::with_capacity(total as usize);
    while (buffer.len() as u64) < total {
      self.cancel.check()?;
      let (_, chunk) = Self::read_frame(port.as_mut(), DATA_TIMEOUT)?;
      if chunk.is_empty() {
        break;
      }
      buffer.extend_from_slice(&chunk);

      // per-chunk acknowledgment keeps the DA's window moving
      self.send_data(port.as_mut(), &0u32.to_le_bytes())?;
      Self::check_status(port.as_mut(), DATA_TIMEOUT)?;
      progress(buffer.len() as u64, total);
    }

    Self::check_status(port.as_mut(), DATA_TIMEOUT)?;
    tracing::info!("read {} bytes from {}", buffer.len(), name);
    Ok(buffer)
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self, data, progress)))]
  fn write_partition(&mut self, name: &str, data: &[u8], progress: &mut dyn FnMut(u64, u64)) -> Result<()> {
    let packet_len = self.write_packet_length()?;

    let mut port = self.lock()?;
    Self::send_cmd(port.as_mut(), CMD_DOWNLOAD, &self.cancel)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    self.send_data(port.as_mut(), name.as_bytes())?;
    self.send_data(port.as_mut(), &(data.len() as u64).to_le_bytes())?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;

    let total = data.len() as u64;
    let mut written = 0u64;
    for chunk in data.chunks(packet_len) {
      self.cancel.check()?;

      // chunk preamble: flow word, additive 16-bit checksum, then the data
      self.send_data(port.as_mut(), &0u32.to_le_bytes())?;
      let checksum = chunk.iter().fold(0u32, |total, &byte| total + byte as u32) & 0xffff;
      self.send_data(port.as_mut(), &checksum.to_le_bytes())?;
      self.send_data(port.as_mut(), chunk)?;

      written += chunk.len() as u64;
      progress(written, total);
    }

    Self::check_status(port.as_mut(), DATA_TIMEOUT)?;
    tracing::info!("wrote {} bytes to {}", written, name);
    Ok(())
  }

  fn erase_partition(&mut self, name: &str) -> Result<()> {
    let mut port = self.lock()?;
    Self::send_cmd(port.as_mut(), CMD_FORMAT_PARTITION, &self.cancel)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    self.send_data(port.as_mut(), name.as_bytes())?;
    Self::check_status(port.as_mut(), DATA_TIMEOUT)?;
    tracing::info!("formatted {}", name);
    Ok(())
  }

  fn read32(&mut self, addr: u32) -> Result<u32> {
    let reply = self.devctrl_query(CTRL_READ32, Some(&addr.to_le_bytes()))?;
    if reply.len() < 4 {
      return Err(Error::UnexpectedPrefix("short read32 reply".into()));
    }
    Ok(u32::from_le_bytes(reply[0..4].try_into()?))
  }

  fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&addr.to_le_bytes());
    payload.extend_from_slice(&value.to_le_bytes());
    self.devctrl_set(CTRL_WRITE32, &payload)
  }

  fn reboot(&mut self) -> Result<()> {
    let mut port = self.lock()?;
    Self::send_cmd(port.as_mut(), CMD_SHUTDOWN, &self.cancel)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    self.send_data(port.as_mut(), &MODE_REBOOT.to_le_bytes())?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    port.disconnect()
  }

  fn shutdown(&mut self) -> Result<()> {
    let mut port = self.lock()?;
    Self::send_cmd(port.as_mut(), CMD_SHUTDOWN, &self.cancel)?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    self.send_data(port.as_mut(), &MODE_POWER_OFF.to_le_bytes())?;
    Self::check_status(port.as_mut(), COMMAND_TIMEOUT)?;
    port.disconnect()
  }
}
