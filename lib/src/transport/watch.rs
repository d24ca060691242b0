//! Device re-enumeration watcher.
//!
//! MediaTek DA activation makes the device drop off the bus and reappear
//! under a new identity (a different COM name or USB address). The helpers
//! here poll host enumeration until a *new* matching identity shows up,
//! excluding the identity the caller previously held.

use std::{
  collections::HashSet,
  time::{Duration, Instant},
};

use rusb::{Context, UsbContext};

use crate::{Error, Result};

use super::{serial::SerialTransport, CancelToken};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Wait for a serial port that is not `exclude` to appear, or for `exclude`
/// itself to vanish and come back (same-name re-enumeration).
#[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(cancel)))]
pub fn wait_for_new_serial(
  exclude: Option<&str>,
  deadline: Duration,
  cancel: &CancelToken,
) -> Result<String> {
  let start = Instant::now();
  let baseline: HashSet<String> = SerialTransport::available_ports().into_iter().collect();
  let mut excluded_vanished = exclude.map(|name| !baseline.contains(name)).unwrap_or(false);

  tracing::debug!(
    "waiting for new serial port (excluding {:?}, {} known)",
    exclude,
    baseline.len()
  );

  while start.elapsed() < deadline {
    cancel.check()?;

    let current = SerialTransport::available_ports();
    for name in &current {
      if Some(name.as_str()) == exclude {
        continue;
      }
      if !baseline.contains(name) {
        tracing::info!("new serial port appeared: {}", name);
        return Ok(name.clone());
      }
    }

    if let Some(excluded) = exclude {
      let present = current.iter().any(|n| n == excluded);
      if !present {
        excluded_vanished = true;
      } else if excluded_vanished {
        tracing::info!("serial port {} re-enumerated under the same name", excluded);
        return Ok(excluded.to_string());
      }
    }

    std::thread::sleep(POLL_INTERVAL);
  }

  Err(Error::ReenumerationFailed(deadline))
}

/// Wait for a USB device matching one of `vid_pids` at an address other than
/// `exclude_identity` (as reported by [`super::Transport::identity`]).
#[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(cancel)))]
pub fn wait_for_new_usb(
  vid_pids: &[(u16, u16)],
  exclude_identity: Option<&str>,
  deadline: Duration,
  cancel: &CancelToken,
) -> Result<(u8, u8)> {
  let start = Instant::now();

  while start.elapsed() < deadline {
    cancel.check()?;

    if let Ok(context) = Context::new() {
      if let Ok(devices) = context.devices() {
        for device in devices.iter() {
          let Ok(desc) = device.device_descriptor() else {
            continue;
          };
          let matched = vid_pids
            .iter()
            .any(|&(vid, pid)| desc.vendor_id() == vid && desc.product_id() == pid);
          if !matched {
            continue;
          }

          let identity = format!("usb:{:03}:{:03}", device.bus_number(), device.address());
          if Some(identity.as_str()) == exclude_identity {
            continue;
          }

          tracing::info!("new usb device appeared at {}", identity);
          return Ok((device.bus_number(), device.address()));
        }
      }
    }

    std::thread::sleep(POLL_INTERVAL);
  }

  Err(Error::ReenumerationFailed(deadline))
}
