//! XML (V6) Download-Agent client.
//!
//! V6 agents speak flat XML documents inside the same 12-byte frame header
//! the XFlash variant uses; bulk data rides in raw frames between the
//! request and its closing status document. The request grammar is
//! open-ended, but the verb set here is the one every V6 DA answers.

use std::time::Duration;

use crate::{
  transport::{CancelToken, SharedTransport, Transport},
  Error, Result, COMMAND_TIMEOUT, DATA_TIMEOUT,
};

use super::{
  da::{DaPartition, DaProtocol, RuntimeParams},
  wire::recv_exact,
  xflash::{DT_MESSAGE, DT_PROTOCOL_FLOW, FRAME_MAGIC},
  ConnAgent, StorageType,
};

pub const CMD_HELLO: &str = "CMD:HELLO";
pub const CMD_SET_RUNTIME_PARAMETER: &str = "CMD:SET-RUNTIME-PARAMETER";
pub const CMD_GET_HW_INFO: &str = "CMD:GET-HW-INFO";
pub const CMD_GET_CONNECTION_AGENT: &str = "CMD:GET-CONNECTION-AGENT";
pub const CMD_READ_PARTITION_TABLE: &str = "CMD:READ-PARTITION-TABLE";
pub const CMD_READ_PARTITION: &str = "CMD:READ-PARTITION";
pub const CMD_WRITE_PARTITION: &str = "CMD:WRITE-PARTITION";
pub const CMD_ERASE_PARTITION: &str = "CMD:ERASE-PARTITION";
pub const CMD_BOOT_TO: &str = "CMD:BOOT-TO";
pub const CMD_INIT_EXT_RAM: &str = "CMD:INIT-EXT-RAM";
pub const CMD_READ_REGISTER: &str = "CMD:READ-REGISTER";
pub const CMD_WRITE_REGISTER: &str = "CMD:WRITE-REGISTER";
pub const CMD_REBOOT: &str = "CMD:REBOOT";
pub const CMD_SHUTDOWN: &str = "CMD:SHUTDOWN";

const DATA_CHUNK: usize = 0x8000;

/// Render a flat request document.
fn xml_request(command: &str, args: &[(&str, String)]) -> String {
  let mut body = String::with_capacity(128);
  body.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?><da><version>1.0</version>");
  body.push_str(&format!("<command>{command}</command>"));
  for (key, value) in args {
    body.push_str(&format!("<{key}>{value}</{key}>"));
  }
  body.push_str("</da>");
  body
}

/// Extract the text of the first `<tag>…</tag>` pair.
fn xml_tag(body: &str, tag: &str) -> Option<String> {
  let open = format!("<{tag}>");
  let close = format!("</{tag}>");
  let start = body.find(&open)? + open.len();
  let end = body[start..].find(&close)? + start;
  Some(body[start..end].trim().to_string())
}

/// Parse a `<status>` value, decimal or `0x`-prefixed hex.
fn parse_status(body: &str) -> Result<u32> {
  let raw = xml_tag(body, "status")
    .ok_or_else(|| Error::UnexpectedPrefix(format!("DA response without status: {body}")))?;
  if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
    u32::from_str_radix(hex, 16)
  } else {
    raw.parse()
  }
  .map_err(|_| Error::UnexpectedPrefix(format!("unparsable DA status: {raw}")))
}

pub struct XmlDa {
  port: SharedTransport,
  cancel: CancelToken,
  storage: Option<StorageType>,
}

impl XmlDa {
  pub fn new(port: SharedTransport, cancel: CancelToken) -> Self {
    Self {
      port,
      cancel,
      storage: None,
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

    for block in payload.chunks(DATA_CHUNK) {
      cancel.check()?;
      port.send(block, DATA_TIMEOUT)?;
    }
    Ok(())
  }

  fn read_frame(port: &mut dyn Transport, timeout: Duration) -> Result<(u32, Vec<u8>)> {
    let header = recv_exact(port, 12, timeout)?;
    let magic = u32::from_le_bytes(header[0..4].try_into()?);
    if magic != FRAME_MAGIC {
      return Err(Error::UnexpectedPrefix(format!("xml frame magic {magic:#010x}")));
    }
    let dtype = u32::from_le_bytes(header[4..8].try_into()?);
    let length = u32::from_le_bytes(header[8..12].try_into()?) as usize;
    let payload = recv_exact(port, length, timeout)?;
    Ok((dtype, payload))
  }

  /// Read the next XML document frame.
  fn read_document(port: &mut dyn Transport, timeout: Duration) -> Result<String> {
    let (_, payload) = Self::read_frame(port, timeout)?;
    Ok(String::from_utf8_lossy(&payload).into_owned())
  }

  /// Send a request and return its (status-checked) response document.
  fn request(&self, command: &str, args: &[(&str, String)]) -> Result<String> {
    let mut port = self.lock()?;
    self.request_locked(port.as_mut(), command, args)
  }

  fn request_locked(&self, port: &mut dyn Transport, command: &str, args: &[(&str, String)]) -> Result<String> {
    self.cancel.check()?;
    let document = xml_request(command, args);
    tracing::trace!("xml -> {}", document);

    Self::send_frame(port, DT_MESSAGE, document.as_bytes(), &self.cancel)?;
    let response = Self::read_document(port, COMMAND_TIMEOUT)?;
    tracing::trace!("xml <- {}", response);

    let status = parse_status(&response)?;
    if status != 0 {
      return Err(Error::DaRejected(status));
    }
    Ok(response)
  }

  /// Final status document after a data phase.
  fn finish_data_phase(port: &mut dyn Transport) -> Result<()> {
    let response = Self::read_document(port, DATA_TIMEOUT)?;
    let status = parse_status(&response)?;
    if status != 0 {
      return Err(Error::DaRejected(status));
    }
    Ok(())
  }

  /// The `HELLO` probe most V6 agents expect right after readiness.
  pub fn hello(&mut self) -> Result<()> {
    self.request(CMD_HELLO, &[]).map(|_| ())
  }
}

impl DaProtocol for XmlDa {
  fn conn_agent(&mut self) -> Result<ConnAgent> {
    let response = self.request(CMD_GET_CONNECTION_AGENT, &[])?;
    match xml_tag(&response, "agent").as_deref() {
      Some("brom") => Ok(ConnAgent::Brom),
      Some("preloader") => Ok(ConnAgent::Preloader),
      other => Err(Error::UnexpectedPrefix(format!("connection agent {other:?}"))),
    }
  }

  fn set_runtime_parameters(&mut self, params: &RuntimeParams) -> Result<()> {
    let args = [
      ("host_mtu", format!("{:#x}", params.host_mtu)),
      ("verbose", (params.verbose as u32).to_string()),
      ("checksum_level", params.checksum_level.to_string()),
    ];
    match self.request(CMD_SET_RUNTIME_PARAMETER, &args) {
      Ok(_) => {
        tracing::info!("runtime parameters accepted");
        Ok(())
      }
      Err(Error::DaRejected(status)) => Err(Error::RuntimeParametersRefused(status)),
      Err(err) => Err(err),
    }
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self, data)))]
  fn boot_to(&mut self, addr: u32, data: &[u8]) -> Result<()> {
    let mut port = self.lock()?;
    self.request_locked(
      port.as_mut(),
      CMD_BOOT_TO,
      &[("at", format!("{addr:#x}")), ("size", data.len().to_string())],
    )?;

    for chunk in data.chunks(DATA_CHUNK) {
      self.cancel.check()?;
      Self::send_frame(port.as_mut(), DT_PROTOCOL_FLOW, chunk, &self.cancel)?;
    }

    Self::finish_data_phase(port.as_mut())?;
    tracing::info!("boot_to {:#010x} with {} bytes", addr, data.len());
    Ok(())
  }

  fn init_ext_ram(&mut self, emi: &[u8]) -> Result<()> {
    let mut port = self.lock()?;
    self.request_locked(port.as_mut(), CMD_INIT_EXT_RAM, &[("size", emi.len().to_string())])?;

    for chunk in emi.chunks(DATA_CHUNK) {
      self.cancel.check()?;
      Self::send_frame(port.as_mut(), DT_PROTOCOL_FLOW, chunk, &self.cancel)?;
    }

    Self::finish_data_phase(port.as_mut())?;
    tracing::info!("EMI configuration sent ({} bytes)", emi.len());
    Ok(())
  }

  fn storage(&mut self) -> Result<StorageType> {
    if let Some(storage) = self.storage {
      return Ok(storage);
    }
    let response = self.request(CMD_GET_HW_INFO, &[])?;
    let storage = match xml_tag(&response, "storage").as_deref() {
      Some("EMMC") | Some("emmc") => StorageType::Emmc,
      Some("UFS") | Some("ufs") => StorageType::Ufs,
      Some("NAND") | Some("nand") => StorageType::Nand,
      other => return Err(Error::UnexpectedPrefix(format!("storage {other:?}"))),
    };
    self.storage = Some(storage);
    Ok(storage)
  }

  fn read_partition_table(&mut self) -> Result<Vec<DaPartition>> {
    let sector_size = self.storage()?.sector_size();
    let response = self.request(CMD_READ_PARTITION_TABLE, &[])?;

    let mut partitions = vec![];
    let mut rest = response.as_str();
    while let Some(start) = rest.find("<entry>") {
      let Some(end) = rest[start..].find("</entry>") else {
        break;
      };
      let entry = &rest[start..start + end];
      rest = &rest[start + end + "</entry>".len()..];

      let Some(name) = xml_tag(entry, "name") else {
        continue;
      };
      let start_sector = xml_tag(entry, "start").and_then(|v| v.parse().ok()).unwrap_or(0);
      let sector_count = xml_tag(entry, "sectors").and_then(|v| v.parse().ok()).unwrap_or(0);

      partitions.push(DaPartition {
        name,
        start_sector,
        sector_count,
        size: sector_count * sector_size,
        part_type: xml_tag(entry, "type").unwrap_or_else(|| "gpt".into()),
        attrs: xml_tag(entry, "attrs").and_then(|v| v.parse().ok()).unwrap_or(0),
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
    let response = self.request_locked(
      port.as_mut(),
      CMD_READ_PARTITION,
      &[
        ("name", name.to_string()),
        ("size", size.map(|s| s.to_string()).unwrap_or_else(|| "0".into())),
      ],
    )?;

    let total: u64 = xml_tag(&response, "length")
      .and_then(|v| v.parse().ok())
      .ok_or_else(|| Error::UnexpectedPrefix("read response without length".into()))?;

    let mut buffer = Vec::with_capacity(total as usize);
    while (buffer.len() as u64) < total {
      self.cancel.check()?;
      let (_, chunk) = Self::read_frame(port.as_mut(), DATA_TIMEOUT)?;
      if chunk.is_empty() {
        break;
      }
      buffer.extend_from_slice(&chunk);
      progress(buffer.len() as u64, total);
    }

    Self::finish_data_phase(port.as_mut())?;
    tracing::info!("read {} bytes from {}", buffer.len(), name);
    Ok(buffer)
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self, data, progress)))]
  fn write_partition(&mut self, name: &str, data: &[u8], progress: &mut dyn FnMut(u64, u64)) -> Result<()> {
    let mut port = self.lock()?;
    self.request_locked(
      port.as_mut(),
      CMD_WRITE_PARTITION,
      &[("name", name.to_string()), ("size", data.len().to_string())],
    )?;

    let total = data.len() as u64;
    let mut written = 0u64;
    for chunk in data.chunks(DATA_CHUNK) {
      self.cancel.check()?;
      Self::send_frame(port.as_mut(), DT_PROTOCOL_FLOW, chunk, &self.cancel)?;
      written += chunk.len() as u64;
      progress(written, total);
    }

    Self::finish_data_phase(port.as_mut())?;
    tracing::info!("wrote {} bytes to {}", written, name);
    Ok(())
  }

  fn erase_partition(&mut self, name: &str) -> Result<()> {
    self
      .request(CMD_ERASE_PARTITION, &[("name", name.to_string())])
      .map(|_| ())
  }

  fn read32(&mut self, addr: u32) -> Result<u32> {
    let response = self.request(CMD_READ_REGISTER, &[("at", format!("{addr:#x}"))])?;
    let raw = xml_tag(&response, "value")
      .ok_or_else(|| Error::UnexpectedPrefix("read-register response without value".into()))?;
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
      u32::from_str_radix(hex, 16)
    } else {
      raw.parse()
    }
    .map_err(|_| Error::UnexpectedPrefix(format!("unparsable register value: {raw}")))
  }

  fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
    self
      .request(
        CMD_WRITE_REGISTER,
        &[("at", format!("{addr:#x}")), ("value", format!("{value:#x}"))],
      )
      .map(|_| ())
  }

  fn reboot(&mut self) -> Result<()> {
    self.request(CMD_REBOOT, &[])?;
    self.lock()?.disconnect()
  }

  fn shutdown(&mut self) -> Result<()> {
    self.request(CMD_SHUTDOWN, &[])?;
    self.lock()?.disconnect()
  }
}
