//! Low-level read helpers shared by the BROM and DA speakers.
//!
//! Transports permit short reads; everything here loops until the wanted
//! byte count arrives or the budget runs out.

use std::time::{Duration, Instant};

use crate::{transport::Transport, Error, Result};

/// Read exactly `n` bytes, tolerating short reads until the budget runs out.
pub(crate) fn recv_exact(port: &mut dyn Transport, n: usize, timeout: Duration) -> Result<Vec<u8>> {
  let start = Instant::now();
  let mut out = Vec::with_capacity(n);
  while out.len() < n {
    let remaining = timeout.saturating_sub(start.elapsed());
    if remaining.is_zero() {
      return Err(Error::IoTimeout(timeout));
    }
    let chunk = port.receive(n - out.len(), remaining)?;
    if chunk.is_empty() {
      continue;
    }
    out.extend_from_slice(&chunk);
  }
  Ok(out)
}

pub(crate) fn recv_u16_be(port: &mut dyn Transport, timeout: Duration) -> Result<u16> {
  let bytes = recv_exact(port, 2, timeout)?;
  Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn recv_u32_be(port: &mut dyn Transport, timeout: Duration) -> Result<u32> {
  let bytes = recv_exact(port, 4, timeout)?;
  Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
