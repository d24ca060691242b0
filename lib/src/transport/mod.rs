//! Byte-pipe capability shared by every protocol engine.
//!
//! A [`Transport`] is a bidirectional pipe with per-operation timeouts.
//! Short reads are legal; callers frame their own lengths. The two concrete
//! variants are a USB bulk endpoint pair ([`usb::UsbTransport`]) and a
//! USB-CDC serial port ([`serial::SerialTransport`]).

pub mod serial;
pub mod usb;
pub mod watch;

use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};

use crate::{Error, Result};

/// Which kind of pipe a descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
  Usb,
  Serial,
}

/// A bidirectional byte pipe with timeouts.
///
/// Every blocking call is bounded by its `timeout` argument. Cancellation is
/// cooperative: engines hold a [`CancelToken`] and check it between wire
/// operations, never inside one.
pub trait Transport: Send {
  /// Whether the underlying device handle is still usable.
  fn is_connected(&self) -> bool;

  /// Send all of `data`, failing with [`Error::IoTimeout`] on budget excess.
  fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

  /// Receive up to `max` bytes. A short (even empty) read is not an error.
  fn receive(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>>;

  /// Send `request` then read up to `max` reply bytes under one budget.
  fn transfer(&mut self, request: &[u8], max: usize, timeout: Duration) -> Result<Vec<u8>> {
    let start = std::time::Instant::now();
    self.send(request, timeout)?;
    let remaining = timeout.saturating_sub(start.elapsed());
    if remaining.is_zero() {
      return Err(Error::IoTimeout(timeout));
    }
    self.receive(max, remaining)
  }

  /// Release the device handle. Idempotent.
  fn disconnect(&mut self) -> Result<()>;

  /// Stable identity of the endpoint (USB address or port name), used to
  /// recognize the *same* device across a re-enumeration wait.
  fn identity(&self) -> String;
}

/// Shared handle to a transport, serializing access between the protocol
/// speakers of one session (the `port_lock`).
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Wrap a transport for sharing between clients of the same device.
pub fn share(transport: Box<dyn Transport>) -> SharedTransport {
  Arc::new(Mutex::new(transport))
}

/// Cooperative cancellation signal.
///
/// Cloned freely; all clones observe the same flag. Engines call
/// [`CancelToken::check`] at chunk boundaries and before each request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  flag: Arc<AtomicBool>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Request cancellation. All holders of clones observe it.
  pub fn cancel(&self) {
    self.flag.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::SeqCst)
  }

  /// Fail with [`Error::Cancelled`] if cancellation was requested.
  pub fn check(&self) -> Result<()> {
    if self.is_cancelled() {
      Err(Error::Cancelled)
    } else {
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cancel_token_is_shared_across_clones() {
    let token = CancelToken::new();
    let clone = token.clone();
    assert!(token.check().is_ok());

    clone.cancel();
    assert!(token.is_cancelled());
    assert!(matches!(token.check(), Err(Error::Cancelled)));
  }
}
