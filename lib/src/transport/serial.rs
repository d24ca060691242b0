//! Serial (USB-CDC) transport for MediaTek BROM and Preloader ports.

use std::{
  io::{Read, Write},
  time::Duration,
};

use serialport::{DataBits, Parity, SerialPort, StopBits};

use crate::{Error, Result};

use super::Transport;

/// Baud rate accepted by MediaTek BROM.
pub const DEFAULT_BAUD: u32 = 115_200;

pub struct SerialTransport {
  port: Option<Box<dyn SerialPort>>,
  name: String,
}

impl SerialTransport {
  /// Open `name` at 115200 8-N-1.
  pub fn open(name: &str) -> Result<Self> {
    Self::open_with_baud(name, DEFAULT_BAUD)
  }

  pub fn open_with_baud(name: &str, baud: u32) -> Result<Self> {
    let port = serialport::new(name, baud)
      .data_bits(DataBits::Eight)
      .parity(Parity::None)
      .stop_bits(StopBits::One)
      .timeout(Duration::from_millis(500))
      .open()?;

    tracing::info!("opened serial port {} at {} baud", name, baud);
    Ok(Self {
      port: Some(port),
      name: name.to_string(),
    })
  }

  /// Names of serial ports currently present on the host.
  pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
      Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
      Err(err) => {
        tracing::warn!("failed to enumerate serial ports: {}", err);
        vec![]
      }
    }
  }

  fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
    self.port.as_mut().ok_or(Error::NotConnected)
  }
}

impl Transport for SerialTransport {
  fn is_connected(&self) -> bool {
    self.port.is_some()
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
    let port = self.port()?;
    port.set_timeout(timeout)?;

    port.write_all(data).map_err(|e| match e.kind() {
      std::io::ErrorKind::TimedOut => Error::IoTimeout(timeout),
      std::io::ErrorKind::BrokenPipe => Error::IoClosed,
      _ => Error::Io(e),
    })?;
    port.flush().ok();

    tracing::trace!("serial sent {} bytes", data.len());
    Ok(())
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  fn receive(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
    let port = self.port()?;
    port.set_timeout(timeout)?;

    let mut buf = vec![0u8; max];
    let read = match port.read(&mut buf) {
      Ok(n) => n,
      // a timeout with nothing buffered is a short (empty) read
      Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
      Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Err(Error::IoClosed),
      Err(e) => return Err(Error::Io(e)),
    };
    buf.truncate(read);

    tracing::trace!("serial received {} bytes", read);
    Ok(buf)
  }

  fn disconnect(&mut self) -> Result<()> {
    if self.port.take().is_some() {
      tracing::trace!("closed serial port {}", self.name);
    }
    Ok(())
  }

  fn identity(&self) -> String {
    format!("serial:{}", self.name)
  }
}

impl Drop for SerialTransport {
  fn drop(&mut self) {
    let _ = self.disconnect();
  }
}
