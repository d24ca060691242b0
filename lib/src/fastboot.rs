//! Google Fastboot protocol engine.
//!
//! Commands are ASCII, at most 4096 bytes. Every reply is one 4-byte prefix
//! (`OKAY`, `FAIL`, `DATA`, `INFO`, `TEXT`) followed by up to 252 payload
//! bytes. `INFO`/`TEXT` may repeat; reading continues until a terminal
//! `OKAY`/`FAIL`. `DATA` opens a streaming phase of exactly the declared
//! length.
//!
//! Large images are split by [`crate::sparse::TransferChunker`] so every
//! `download:` stays under the device-reported `max-download-size`.

use std::{
  collections::HashMap,
  fs::File,
  io::{Read, Seek},
  path::Path,
  time::{Duration, Instant},
};

use crate::{
  device::{list_usb_devices, DeviceInfo},
  sparse::TransferChunker,
  transport::{
    usb::{InterfaceMatch, UsbTransport},
    CancelToken, Transport,
  },
  watchdog::Watchdog,
  Callback, Error, Event, Result, COMMAND_TIMEOUT, DATA_TIMEOUT, DEFAULT_MAX_DOWNLOAD, STREAM_BLOCK_SIZE,
};

/// Longest command the protocol permits.
const MAX_COMMAND_LEN: usize = 4096;
/// Prefix + payload bound of a single response.
const MAX_RESPONSE_LEN: usize = 4 + 252;
/// Minimum interval between speed recomputations.
const SPEED_INTERVAL: Duration = Duration::from_millis(200);
/// `getvar:all` result sets smaller than this trigger the fallback probe.
const FALLBACK_THRESHOLD: usize = 5;

/// Variables probed individually when `getvar:all` is unusable.
const FALLBACK_VARS: [&str; 12] = [
  "product",
  "serialno",
  "secure",
  "unlocked",
  "max-download-size",
  "current-slot",
  "slot-count",
  "is-userspace",
  "version-bootloader",
  "version-baseband",
  "hw-revision",
  "variant",
];

/// Phase of a flash operation, as seen by progress consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FlashPhase {
  Sending,
  Writing,
  Complete,
  Failed,
}

/// Externally observable progress record.
///
/// `percent` keeps the convention that sending occupies 0–95 and writing
/// 95–100, so it stays monotonic across chunk boundaries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FlashProgress {
  pub partition: String,
  pub phase: FlashPhase,
  pub bytes_sent: u64,
  pub total_bytes: u64,
  pub chunk_index: usize,
  pub chunk_count: usize,
  pub percent: f64,
  pub speed_bps: f64,
}

/// Partition view derived from `partition-size:` / `is-logical:` variables.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, serde::Serialize)]
pub struct PartitionVar {
  pub size: u64,
  pub is_logical: Option<bool>,
}

#[derive(Debug)]
enum Response {
  Okay(String),
  Fail(String),
  Data(u64),
  Info(String),
  Text(String),
}

/// An active fastboot connection plus a snapshot of the device's variables.
pub struct FastbootSession {
  transport: Box<dyn Transport>,
  variables: HashMap<String, String>,
  partitions: HashMap<String, PartitionVar>,
  slots: Vec<String>,
  max_download: u64,
  callback: Option<Callback>,
  cancel: CancelToken,
  watchdog: Watchdog,
}

impl FastbootSession {
  /// Connect to the first fastboot device on the bus and refresh variables.
  pub fn open_first(callback: Option<Callback>) -> Result<Self> {
    if let Some(callback) = &callback {
      callback(Event::FindingDevice);
    }

    let device = list_usb_devices()?
      .into_iter()
      .find(|d| d.fastboot)
      .ok_or(Error::NotFound)?;

    Self::open_device(&device, callback)
  }

  /// Connect to a specific enumerated device.
  pub fn open_device(device: &DeviceInfo, callback: Option<Callback>) -> Result<Self> {
    if let Some(callback) = &callback {
      callback(Event::DeviceFound(device.clone()));
      callback(Event::Connecting);
    }

    let transport = UsbTransport::open_at(device.bus, device.address, InterfaceMatch::fastboot())?;
    let mut session = Self::from_transport(Box::new(transport), callback);
    session.emit(Event::Connected);
    session.refresh_variables()?;
    Ok(session)
  }

  /// Wrap an already-open transport. Variables start empty; call
  /// [`FastbootSession::refresh_variables`] to populate them.
  pub fn from_transport(transport: Box<dyn Transport>, callback: Option<Callback>) -> Self {
    let cancel = CancelToken::new();
    let watchdog = Watchdog::spawn(cancel.clone());
    Self {
      transport,
      variables: HashMap::new(),
      partitions: HashMap::new(),
      slots: vec![],
      max_download: DEFAULT_MAX_DOWNLOAD,
      callback,
      cancel,
      watchdog,
    }
  }

  /// Token that aborts this session's operations when fired.
  pub fn cancel_token(&self) -> CancelToken {
    self.cancel.clone()
  }

  pub fn variables(&self) -> &HashMap<String, String> {
    &self.variables
  }

  pub fn partitions(&self) -> &HashMap<String, PartitionVar> {
    &self.partitions
  }

  pub fn slots(&self) -> &[String] {
    &self.slots
  }

  pub fn max_download_size(&self) -> u64 {
    self.max_download
  }

  /// Whether the device exposes A/B slots.
  pub fn has_ab_partition(&self) -> bool {
    if self.variables.get("current-slot").map(|s| !s.is_empty()).unwrap_or(false) {
      return true;
    }
    self
      .variables
      .get("slot-count")
      .and_then(|s| parse_numeric(s))
      .map(|n| n >= 2)
      .unwrap_or(false)
  }

  pub fn current_slot(&self) -> Option<&str> {
    self.variables.get("current-slot").map(String::as_str)
  }

  /// Whether the device is in userspace fastboot (fastbootd).
  pub fn is_userspace(&self) -> bool {
    self.variables.get("is-userspace").map(|v| v == "yes").unwrap_or(false)
  }

  fn emit(&self, event: Event) {
    if let Some(callback) = &self.callback {
      callback(event);
    }
  }

  fn read_response(&mut self, timeout: Duration) -> Result<Response> {
    self.watchdog.arm(timeout + Duration::from_secs(5));
    let raw = match self.transport.receive(MAX_RESPONSE_LEN, timeout) {
      Ok(raw) => raw,
      Err(Error::IoTimeout(t)) => {
        self.watchdog.strike();
        return Err(Error::IoTimeout(t));
      }
      Err(e) => return Err(e),
    };
    self.watchdog.feed();

    if raw.len() < 4 {
      return Err(Error::UnexpectedPrefix(String::from_utf8_lossy(&raw).into_owned()));
    }

    let prefix = &raw[0..4];
    let payload = String::from_utf8_lossy(&raw[4..]).into_owned();
    let response = match prefix {
      b"OKAY" => Response::Okay(payload),
      b"FAIL" => Response::Fail(payload),
      b"INFO" => Response::Info(payload),
      b"TEXT" => Response::Text(payload),
      b"DATA" => {
        let digits = payload.get(0..8).unwrap_or(&payload);
        let size =
          u64::from_str_radix(digits, 16).map_err(|_| Error::UnexpectedPrefix(format!("DATA {payload}")))?;
        Response::Data(size)
      }
      other => return Err(Error::UnexpectedPrefix(String::from_utf8_lossy(other).into_owned())),
    };

    tracing::trace!("fastboot <- {:?}", response);
    Ok(response)
  }

  fn send_command(&mut self, command: &str, timeout: Duration) -> Result<()> {
    if command.len() > MAX_COMMAND_LEN {
      return Err(Error::InvalidArgument(format!("command exceeds {MAX_COMMAND_LEN} bytes")));
    }
    self.cancel.check()?;
    tracing::debug!("fastboot -> {}", command);
    self.transport.send(command.as_bytes(), timeout)
  }

  /// Issue `command` and read until a terminal reply, logging `INFO` lines.
  fn command(&mut self, command: &str, timeout: Duration) -> Result<String> {
    self.send_command(command, timeout)?;
    loop {
      self.cancel.check()?;
      match self.read_response(timeout)? {
        Response::Okay(msg) => return Ok(msg),
        Response::Fail(msg) => return Err(Error::DeviceFail(msg)),
        Response::Info(msg) | Response::Text(msg) => {
          tracing::info!("device: {}", msg.trim_end());
          self.emit(Event::FastbootInfo(msg));
        }
        Response::Data(_) => return Err(Error::UnexpectedPrefix("DATA".into())),
      }
    }
  }

  /// Query one variable.
  pub fn getvar(&mut self, name: &str) -> Result<String> {
    let value = self.command(&format!("getvar:{name}"), COMMAND_TIMEOUT)?;
    Ok(value.trim().to_string())
  }

  /// Rebuild the variable snapshot and its derived views.
  ///
  /// Prefers `getvar:all`; falls back to probing a fixed list of well-known
  /// variables when the bulk query fails or yields suspiciously little.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip_all))]
  pub fn refresh_variables(&mut self) -> Result<()> {
    let mut variables = HashMap::new();

    let bulk = self.getvar_all(&mut variables);
    match bulk {
      Ok(()) if variables.len() >= FALLBACK_THRESHOLD => {}
      Ok(()) => {
        tracing::debug!("getvar:all returned only {} variables, probing known names", variables.len());
        self.probe_fallback_vars(&mut variables);
      }
      Err(err) => {
        tracing::debug!("getvar:all failed ({}), probing known names", err);
        self.probe_fallback_vars(&mut variables);
      }
    }

    // derived views are rebuilt wholesale, never patched
    let mut partitions: HashMap<String, PartitionVar> = HashMap::new();
    for (key, value) in &variables {
      if let Some(name) = key.strip_prefix("partition-size:") {
        if let Some(size) = parse_numeric(value) {
          partitions
            .entry(name.to_string())
            .and_modify(|p| p.size = size)
            .or_insert(PartitionVar {
              size,
              is_logical: None,
            });
        }
      } else if let Some(name) = key.strip_prefix("is-logical:") {
        let logical = value == "yes" || value == "true" || value == "1";
        partitions
          .entry(name.to_string())
          .and_modify(|p| p.is_logical = Some(logical))
          .or_insert(PartitionVar {
            size: 0,
            is_logical: Some(logical),
          });
      }
    }

    let mut slots = vec![];
    if let Some(count) = variables.get("slot-count").and_then(|v| parse_numeric(v)) {
      for i in 0..count.min(26) {
        slots.push(((b'a' + i as u8) as char).to_string());
      }
    }

    self.max_download = variables
      .get("max-download-size")
      .and_then(|v| parse_numeric(v))
      .filter(|&v| v >= 1)
      .unwrap_or(DEFAULT_MAX_DOWNLOAD);

    tracing::info!(
      "device variables: {} total, {} partitions, max-download-size {:#x}",
      variables.len(),
      partitions.len(),
      self.max_download
    );

    self.variables = variables;
    self.partitions = partitions;
    self.slots = slots;
    Ok(())
  }

  fn getvar_all(&mut self, variables: &mut HashMap<String, String>) -> Result<()> {
    self.send_command("getvar:all", COMMAND_TIMEOUT)?;
    loop {
      self.cancel.check()?;
      match self.read_response(COMMAND_TIMEOUT)? {
        Response::Info(line) | Response::Text(line) => {
          if let Some((key, value)) = parse_var_line(&line) {
            variables.insert(key, value);
          }
        }
        // some implementations put the last variable in the OKAY payload
        Response::Okay(line) => {
          if let Some((key, value)) = parse_var_line(&line) {
            variables.insert(key, value);
          }
          return Ok(());
        }
        Response::Fail(msg) => return Err(Error::DeviceFail(msg)),
        Response::Data(_) => return Err(Error::UnexpectedPrefix("DATA".into())),
      }
    }
  }

  fn probe_fallback_vars(&mut self, variables: &mut HashMap<String, String>) {
    for name in FALLBACK_VARS {
      match self.command(&format!("getvar:{name}"), COMMAND_TIMEOUT) {
        Ok(value) => {
          let value = value.trim();
          if !value.is_empty() {
            variables.insert(name.to_string(), value.to_string());
          }
        }
        Err(err) => tracing::trace!("getvar:{} probe failed: {}", name, err),
      }
    }
  }

  /// Flash an image file. Sparse or raw is detected from the file itself.
  pub fn flash_file(&mut self, partition: &str, path: &Path) -> Result<()> {
    let file = File::open(path)?;
    self.flash(partition, file)
  }

  /// Flash an image from any seekable reader.
  ///
  /// The image is split into transfer chunks no larger than the device's
  /// `max-download-size`; each chunk is one `download:`/`flash:` round trip.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self, image)))]
  pub fn flash<R: Read + Seek>(&mut self, partition: &str, image: R) -> Result<()> {
    let mut chunker = TransferChunker::new(image, self.max_download as usize)?;
    let chunk_count = chunker.total();
    let total_bytes = chunker.total_transfer_bytes();

    tracing::info!(
      "flashing {}: {} bytes in {} chunks (max-download-size {:#x})",
      partition,
      total_bytes,
      chunk_count,
      self.max_download
    );

    let mut tracker = ProgressTracker::new(partition, total_bytes, chunk_count);

    let outcome = (|| -> Result<()> {
      while let Some(chunk) = chunker.next_chunk()? {
        self.cancel.check()?;
        tracker.chunk_index = chunk.index;

        self.download_chunk(&chunk.data, &mut tracker)?;

        let reply = self.command(&format!("flash:{partition}"), DATA_TIMEOUT)?;
        tracing::debug!("flash:{} chunk {}/{} done: {}", partition, chunk.index + 1, chunk_count, reply);
        tracker.wrote_chunk();
        self.emit(Event::FlashProgress(tracker.record(FlashPhase::Writing)));
      }
      Ok(())
    })();

    match outcome {
      Ok(()) => {
        self.emit(Event::FlashProgress(tracker.complete()));
        Ok(())
      }
      Err(err) => {
        self.emit(Event::FlashProgress(tracker.failed()));
        Err(err)
      }
    }
  }

  /// One `download:` round trip streaming `data` to the device.
  fn download_chunk(&mut self, data: &[u8], tracker: &mut ProgressTracker) -> Result<()> {
    self.send_command(&format!("download:{:08x}", data.len()), COMMAND_TIMEOUT)?;

    let declared = loop {
      match self.read_response(COMMAND_TIMEOUT)? {
        Response::Data(size) => break size,
        Response::Info(msg) | Response::Text(msg) => self.emit(Event::FastbootInfo(msg)),
        Response::Fail(msg) => return Err(Error::DeviceFail(msg)),
        Response::Okay(_) => return Err(Error::UnexpectedPrefix("OKAY".into())),
      }
    };

    if declared != data.len() as u64 {
      return Err(Error::SizeMismatch {
        host: data.len() as u64,
        device: declared,
      });
    }

    for block in data.chunks(STREAM_BLOCK_SIZE) {
      self.cancel.check()?;
      self.transport.send(block, DATA_TIMEOUT)?;
      tracker.sent(block.len() as u64);
      if let Some(record) = tracker.tick(FlashPhase::Sending) {
        self.emit(Event::FlashProgress(record));
      }
    }

    loop {
      match self.read_response(DATA_TIMEOUT)? {
        Response::Okay(_) => return Ok(()),
        Response::Info(msg) | Response::Text(msg) => self.emit(Event::FastbootInfo(msg)),
        Response::Fail(msg) => return Err(Error::DeviceFail(msg)),
        Response::Data(_) => return Err(Error::UnexpectedPrefix("DATA".into())),
      }
    }
  }

  /// Erase a partition. Uses the data-phase budget: erases can be slow.
  pub fn erase(&mut self, partition: &str) -> Result<()> {
    self.command(&format!("erase:{partition}"), DATA_TIMEOUT)?;
    tracing::info!("erased {}", partition);
    Ok(())
  }

  /// Download `image` and boot it without writing to flash.
  pub fn boot<R: Read + Seek>(&mut self, image: R) -> Result<()> {
    let mut chunker = TransferChunker::new(image, self.max_download as usize)?;
    if chunker.total() != 1 {
      return Err(Error::InvalidArgument(
        "boot image exceeds max-download-size, cannot be staged".into(),
      ));
    }
    let chunk = chunker
      .next_chunk()?
      .ok_or_else(|| Error::SparseInvalid("empty boot image".into()))?;
    let mut tracker = ProgressTracker::new("boot-image", chunk.size as u64, 1);
    self.download_chunk(&chunk.data, &mut tracker)?;
    self.command("boot", DATA_TIMEOUT)?;
    self.emit(Event::Resetting);
    self.transport.disconnect()
  }

  /// Select the active slot (`a` or `b`).
  pub fn set_active(&mut self, slot: &str) -> Result<()> {
    if slot.len() != 1 || !slot.chars().all(|c| c.is_ascii_lowercase()) {
      return Err(Error::InvalidArgument(format!("bad slot name: {slot}")));
    }
    self.command(&format!("set_active:{slot}"), COMMAND_TIMEOUT)?;
    Ok(())
  }

  /// `flashing unlock`. Wipes userdata on most devices.
  pub fn unlock(&mut self) -> Result<()> {
    self.command("flashing unlock", DATA_TIMEOUT)?;
    Ok(())
  }

  /// `flashing lock`.
  pub fn lock(&mut self) -> Result<()> {
    self.command("flashing lock", DATA_TIMEOUT)?;
    Ok(())
  }

  /// Raw `oem` passthrough.
  pub fn oem(&mut self, args: &str) -> Result<String> {
    self.command(&format!("oem {args}"), DATA_TIMEOUT)
  }

  /// `continue` the normal boot flow and release the transport.
  pub fn continue_boot(&mut self) -> Result<()> {
    self.command("continue", COMMAND_TIMEOUT)?;
    self.emit(Event::Resetting);
    self.transport.disconnect()
  }

  pub fn reboot(&mut self) -> Result<()> {
    self.reboot_with("reboot")
  }

  pub fn reboot_bootloader(&mut self) -> Result<()> {
    self.reboot_with("reboot-bootloader")
  }

  pub fn reboot_fastboot(&mut self) -> Result<()> {
    self.reboot_with("reboot-fastboot")
  }

  pub fn reboot_recovery(&mut self) -> Result<()> {
    self.reboot_with("reboot-recovery")
  }

  fn reboot_with(&mut self, command: &str) -> Result<()> {
    // the device drops off the bus after acking; a lost reply is fine
    match self.command(command, COMMAND_TIMEOUT) {
      Ok(_) => {}
      Err(Error::IoTimeout(_)) | Err(Error::IoClosed) => {
        tracing::debug!("device went away before acking {}", command);
      }
      Err(err) => return Err(err),
    }
    self.emit(Event::Resetting);
    self.transport.disconnect()
  }

  /// Release the transport without rebooting the device.
  pub fn disconnect(&mut self) -> Result<()> {
    self.transport.disconnect()
  }
}

impl Drop for FastbootSession {
  fn drop(&mut self) {
    let _ = self.transport.disconnect();
  }
}

/// Parse one `getvar:all` output line into `(key, value)`.
///
/// Accepts `name: value`, composite `prefix:name: value`, and an optional
/// leading `(bootloader)` tag.
fn parse_var_line(line: &str) -> Option<(String, String)> {
  let line = line.trim();
  let line = line.strip_prefix("(bootloader)").map(str::trim_start).unwrap_or(line);
  let (key, value) = line.split_once(": ")?;
  let key = key.trim();
  if key.is_empty() || key.eq_ignore_ascii_case("all") {
    return None;
  }
  Some((key.to_string(), value.trim().to_string()))
}

/// Parse a decimal or `0x`-prefixed hexadecimal variable value.
fn parse_numeric(value: &str) -> Option<u64> {
  let value = value.trim();
  if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
    u64::from_str_radix(hex, 16).ok()
  } else {
    value.parse().ok()
  }
}

/// Per-flash progress accounting.
///
/// Sending maps to 0–95 percent by bytes; writing advances 95–100 by chunk.
struct ProgressTracker {
  partition: String,
  total_bytes: u64,
  chunk_count: usize,
  chunk_index: usize,
  bytes_sent: u64,
  chunks_written: usize,
  speed_bps: f64,
  window_start: Instant,
  window_bytes: u64,
}

impl ProgressTracker {
  fn new(partition: &str, total_bytes: u64, chunk_count: usize) -> Self {
    Self {
      partition: partition.to_string(),
      total_bytes,
      chunk_count,
      chunk_index: 0,
      bytes_sent: 0,
      chunks_written: 0,
      speed_bps: 0.0,
      window_start: Instant::now(),
      window_bytes: 0,
    }
  }

  fn sent(&mut self, bytes: u64) {
    self.bytes_sent += bytes;
    self.window_bytes += bytes;
  }

  fn wrote_chunk(&mut self) {
    self.chunks_written += 1;
  }

  /// Recompute speed if the window elapsed and produce a Sending record.
  fn tick(&mut self, phase: FlashPhase) -> Option<FlashProgress> {
    let elapsed = self.window_start.elapsed();
    if elapsed >= SPEED_INTERVAL {
      self.speed_bps = self.window_bytes as f64 / elapsed.as_secs_f64();
      self.window_start = Instant::now();
      self.window_bytes = 0;
    }
    Some(self.record(phase))
  }

  fn record(&self, phase: FlashPhase) -> FlashProgress {
    let percent = match phase {
      FlashPhase::Sending => {
        if self.total_bytes == 0 {
          0.0
        } else {
          self.bytes_sent as f64 * 95.0 / self.total_bytes as f64
        }
      }
      FlashPhase::Writing => {
        if self.chunk_count == 0 {
          95.0
        } else {
          95.0 + self.chunks_written as f64 * 5.0 / self.chunk_count as f64
        }
      }
      FlashPhase::Complete => 100.0,
      FlashPhase::Failed => self.bytes_sent as f64 * 95.0 / self.total_bytes.max(1) as f64,
    };

    FlashProgress {
      partition: self.partition.clone(),
      phase,
      bytes_sent: self.bytes_sent,
      total_bytes: self.total_bytes,
      chunk_index: self.chunk_index,
      chunk_count: self.chunk_count,
      percent: percent.min(100.0),
      speed_bps: self.speed_bps,
    }
  }

  fn complete(&self) -> FlashProgress {
    self.record(FlashPhase::Complete)
  }

  fn failed(&self) -> FlashProgress {
    self.record(FlashPhase::Failed)
  }
}

#[cfg(test)]
pub(crate) mod mock {
  //! Scripted transport for protocol tests.

  use std::collections::VecDeque;
  use std::sync::{Arc, Mutex};
  use std::time::Duration;

  use crate::transport::Transport;
  use crate::{Error, Result};

  #[derive(Default)]
  pub struct MockState {
    pub sent: Vec<Vec<u8>>,
    pub replies: VecDeque<Vec<u8>>,
  }

  pub struct MockTransport {
    pub state: Arc<Mutex<MockState>>,
    pub connected: bool,
  }

  impl MockTransport {
    pub fn scripted(replies: &[&[u8]]) -> (Self, Arc<Mutex<MockState>>) {
      let state = Arc::new(Mutex::new(MockState {
        sent: vec![],
        replies: replies.iter().map(|r| r.to_vec()).collect(),
      }));
      (
        Self {
          state: state.clone(),
          connected: true,
        },
        state,
      )
    }
  }

  impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
      self.connected
    }

    fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
      if !self.connected {
        return Err(Error::NotConnected);
      }
      self.state.lock().unwrap().sent.push(data.to_vec());
      Ok(())
    }

    fn receive(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
      if !self.connected {
        return Err(Error::NotConnected);
      }
      let mut state = self.state.lock().unwrap();
      match state.replies.pop_front() {
        Some(mut reply) => {
          reply.truncate(max);
          Ok(reply)
        }
        None => Err(Error::IoTimeout(timeout)),
      }
    }

    fn disconnect(&mut self) -> Result<()> {
      self.connected = false;
      Ok(())
    }

    fn identity(&self) -> String {
      "mock:000".into()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::mock::MockTransport;
  use super::*;
  use crate::sparse::{CHUNK_HEADER_SIZE, FILE_HEADER_SIZE};
  use std::io::Cursor;
  use std::sync::{Arc, Mutex};

  fn sent_strings(state: &Arc<Mutex<super::mock::MockState>>) -> Vec<String> {
    state
      .lock()
      .unwrap()
      .sent
      .iter()
      .map(|b| String::from_utf8_lossy(b).into_owned())
      .collect()
  }

  #[test]
  fn var_line_parsing_handles_composite_keys_and_tags() {
    assert_eq!(
      parse_var_line("partition-size:boot_a: 0x4000000"),
      Some(("partition-size:boot_a".into(), "0x4000000".into()))
    );
    assert_eq!(
      parse_var_line("(bootloader) variant: user"),
      Some(("variant".into(), "user".into()))
    );
    assert_eq!(parse_var_line("no-separator"), None);
  }

  #[test]
  fn numeric_values_parse_as_decimal_or_hex() {
    assert_eq!(parse_numeric("0x4000000"), Some(0x0400_0000));
    assert_eq!(parse_numeric("268435456"), Some(268_435_456));
    assert_eq!(parse_numeric("user"), None);
  }

  #[test]
  fn getvar_all_builds_variable_and_partition_views() {
    let (mock, _state) = MockTransport::scripted(&[
      b"INFOpartition-size:boot_a: 0x4000000",
      b"INFOis-logical:boot_a: no",
      b"INFO(bootloader) variant: user",
      b"INFOmax-download-size: 0x10000000",
      b"INFOcurrent-slot: a",
      b"INFOslot-count: 2",
      b"OKAY",
    ]);

    let mut session = FastbootSession::from_transport(Box::new(mock), None);
    session.refresh_variables().unwrap();

    assert_eq!(session.partitions()["boot_a"].size, 0x0400_0000);
    assert_eq!(session.partitions()["boot_a"].is_logical, Some(false));
    assert_eq!(session.variables()["variant"], "user");
    assert_eq!(session.max_download_size(), 0x1000_0000);
    assert!(session.has_ab_partition());
    assert_eq!(session.slots(), &["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn getvar_all_terminates_on_first_okay() {
    let (mock, state) = MockTransport::scripted(&[
      b"INFOproduct: sdm845",
      b"INFOserialno: 1234",
      b"INFOsecure: yes",
      b"INFOunlocked: no",
      b"INFOmax-download-size: 0x8000000",
      b"OKAY",
      // anything past the OKAY must never be consumed
      b"INFOphantom: value",
    ]);

    let mut session = FastbootSession::from_transport(Box::new(mock), None);
    session.refresh_variables().unwrap();

    assert_eq!(session.variables().len(), 5);
    assert!(!session.variables().contains_key("phantom"));
    assert_eq!(state.lock().unwrap().replies.len(), 1);
  }

  #[test]
  fn getvar_all_failure_probes_the_fallback_list() {
    let mut replies: Vec<Vec<u8>> = vec![b"FAILunknown command".to_vec()];
    // fallback order matches FALLBACK_VARS
    for name in FALLBACK_VARS {
      match name {
        "product" => replies.push(b"OKAYsdm845".to_vec()),
        "current-slot" => replies.push(b"OKAYa".to_vec()),
        _ => replies.push(b"FAILno such variable".to_vec()),
      }
    }
    let refs: Vec<&[u8]> = replies.iter().map(|r| r.as_slice()).collect();
    let (mock, state) = MockTransport::scripted(&refs);

    let mut session = FastbootSession::from_transport(Box::new(mock), None);
    session.refresh_variables().unwrap();

    assert_eq!(session.variables().len(), 2);
    assert_eq!(session.variables()["product"], "sdm845");
    assert!(session.has_ab_partition());

    let sent = sent_strings(&state);
    assert_eq!(sent[0], "getvar:all");
    assert_eq!(sent[1], "getvar:product");
    assert_eq!(sent.len(), 1 + FALLBACK_VARS.len());
  }

  #[test]
  fn flash_runs_one_download_flash_round_trip_per_chunk() {
    // 8 KiB raw image -> one transfer chunk with sparse wrapping
    let image = vec![0x5A; 8192];
    let wrapped = (FILE_HEADER_SIZE + CHUNK_HEADER_SIZE + 8192) as u64;

    let data_reply = format!("DATA{wrapped:08x}");
    let (mock, state) = MockTransport::scripted(&[data_reply.as_bytes(), b"OKAY", b"OKAY"]);

    let progress: Arc<Mutex<Vec<FlashProgress>>> = Arc::new(Mutex::new(vec![]));
    let sink = progress.clone();
    let callback: crate::Callback = Arc::new(move |event| {
      if let Event::FlashProgress(p) = event {
        sink.lock().unwrap().push(p);
      }
    });

    let mut session = FastbootSession::from_transport(Box::new(mock), Some(callback));
    session.flash("boot_a", Cursor::new(image)).unwrap();

    let sent = sent_strings(&state);
    assert_eq!(sent[0], format!("download:{wrapped:08x}"));
    assert_eq!(*sent.last().unwrap(), "flash:boot_a".to_string());

    let records = progress.lock().unwrap();
    let last = records.last().unwrap();
    assert_eq!(last.phase, FlashPhase::Complete);
    assert_eq!(last.percent, 100.0);

    // monotonicity of bytes_sent and percent
    let mut prev_bytes = 0;
    let mut prev_percent = 0.0;
    for record in records.iter() {
      assert!(record.bytes_sent >= prev_bytes);
      assert!(record.percent >= prev_percent);
      prev_bytes = record.bytes_sent;
      prev_percent = record.percent;
    }
  }

  #[test]
  fn data_length_disagreement_fails_with_size_mismatch() {
    let (mock, _state) = MockTransport::scripted(&[b"DATA00000100"]);

    let mut session = FastbootSession::from_transport(Box::new(mock), None);
    let res = session.flash("boot_a", Cursor::new(vec![0u8; 8192]));
    assert!(matches!(res, Err(Error::SizeMismatch { .. })));

    // session remains cleanly disconnectible
    session.disconnect().unwrap();
  }

  #[test]
  fn info_lines_during_erase_are_consumed() {
    let (mock, _state) = MockTransport::scripted(&[b"INFOerasing...", b"INFOstill erasing", b"OKAY"]);

    let mut session = FastbootSession::from_transport(Box::new(mock), None);
    session.erase("userdata").unwrap();
  }

  #[test]
  fn device_fail_payload_is_surfaced() {
    let (mock, _state) = MockTransport::scripted(&[b"FAILpartition does not exist"]);

    let mut session = FastbootSession::from_transport(Box::new(mock), None);
    let res = session.erase("nonexistent");
    assert!(matches!(res, Err(Error::DeviceFail(msg)) if msg.contains("does not exist")));
  }

  #[test]
  fn reboot_disconnects_the_transport() {
    let (mock, state) = MockTransport::scripted(&[b"OKAY"]);

    let mut session = FastbootSession::from_transport(Box::new(mock), None);
    session.reboot().unwrap();
    assert_eq!(sent_strings(&state)[0], "reboot");
  }

  #[test]
  fn cancelled_session_refuses_to_flash() {
    let (mock, _state) = MockTransport::scripted(&[]);

    let mut session = FastbootSession::from_transport(Box::new(mock), None);
    session.cancel_token().cancel();

    let res = session.flash("boot_a", Cursor::new(vec![0u8; 4096]));
    assert!(matches!(res, Err(Error::Cancelled)));
  }

  #[test]
  fn set_active_validates_the_slot_name() {
    let (mock, _state) = MockTransport::scripted(&[b"OKAY"]);
    let mut session = FastbootSession::from_transport(Box::new(mock), None);

    assert!(matches!(session.set_active("ab"), Err(Error::InvalidArgument(_))));
    session.set_active("b").unwrap();
  }
}
