//! USB bulk-endpoint transport on top of rusb.

use rusb::{Context, DeviceHandle, Direction, TransferType, UsbContext};
use std::time::Duration;

use crate::{Error, Result};

use super::Transport;

/// Interface class/subclass/protocol triple advertised by fastboot devices.
pub const FASTBOOT_CLASS: u8 = 0xff;
pub const FASTBOOT_SUBCLASS: u8 = 0x42;
pub const FASTBOOT_PROTOCOL: u8 = 0x03;

/// Selects which interface of a device to claim.
#[derive(Debug, Clone, Copy)]
pub enum InterfaceMatch {
  /// First interface exposing a bulk-in/bulk-out pair.
  AnyBulk,
  /// Interface whose descriptor matches a class/subclass/protocol triple.
  ClassTriple(u8, u8, u8),
}

impl InterfaceMatch {
  pub fn fastboot() -> Self {
    Self::ClassTriple(FASTBOOT_CLASS, FASTBOOT_SUBCLASS, FASTBOOT_PROTOCOL)
  }
}

pub struct UsbTransport {
  handle: Option<DeviceHandle<Context>>,
  interface_number: u8,
  endpoint_in: u8,
  endpoint_out: u8,
  identity: String,
}

impl UsbTransport {
  /// Open the first device matching `(vendor_id, product_id)` and claim the
  /// interface selected by `matcher`.
  pub fn open(vendor_id: u16, product_id: u16, matcher: InterfaceMatch) -> Result<Self> {
    let context = Context::new()?;
    let device = context
      .devices()?
      .iter()
      .find(|device| {
        if let Ok(desc) = device.device_descriptor() {
          desc.vendor_id() == vendor_id && desc.product_id() == product_id
        } else {
          false
        }
      })
      .ok_or(Error::NotFound)?;

    Self::claim(device, matcher)
  }

  /// Open a specific enumerated device by bus number and address.
  pub fn open_at(bus: u8, address: u8, matcher: InterfaceMatch) -> Result<Self> {
    let context = Context::new()?;
    let device = context
      .devices()?
      .iter()
      .find(|device| device.bus_number() == bus && device.address() == address)
      .ok_or(Error::NotFound)?;

    Self::claim(device, matcher)
  }

  fn claim(device: rusb::Device<Context>, matcher: InterfaceMatch) -> Result<Self> {
    let identity = format!("usb:{:03}:{:03}", device.bus_number(), device.address());
    let config_desc = device.active_config_descriptor()?;

    let mut selected = None;
    'outer: for interface in config_desc.interfaces() {
      for descriptor in interface.descriptors() {
        let matches = match matcher {
          InterfaceMatch::AnyBulk => true,
          InterfaceMatch::ClassTriple(class, subclass, protocol) => {
            descriptor.class_code() == class
              && descriptor.sub_class_code() == subclass
              && descriptor.protocol_code() == protocol
          }
        };
        if !matches {
          continue;
        }

        let mut endpoint_in = None;
        let mut endpoint_out = None;
        for ep in descriptor.endpoint_descriptors() {
          if ep.transfer_type() != TransferType::Bulk {
            continue;
          }
          match ep.direction() {
            Direction::In => endpoint_in = Some(ep.address()),
            Direction::Out => endpoint_out = Some(ep.address()),
          }
        }

        if let (Some(ep_in), Some(ep_out)) = (endpoint_in, endpoint_out) {
          selected = Some((interface.number(), ep_in, ep_out));
          break 'outer;
        }
      }
    }

    let (interface_number, endpoint_in, endpoint_out) = selected.ok_or(Error::NotFound)?;

    let handle = device.open()?;
    // Some bootloaders reject set_configuration while already configured.
    if handle.active_configuration().unwrap_or(0) != 1 {
      let _ = handle.set_active_configuration(1);
    }
    handle.claim_interface(interface_number)?;
    tracing::info!("claimed usb interface {} on {}", interface_number, identity);

    Ok(Self {
      handle: Some(handle),
      interface_number,
      endpoint_in,
      endpoint_out,
      identity,
    })
  }

  fn handle(&self) -> Result<&DeviceHandle<Context>> {
    self.handle.as_ref().ok_or(Error::NotConnected)
  }

  fn map_usb_err(err: rusb::Error, timeout: Duration) -> Error {
    match err {
      rusb::Error::Timeout => Error::IoTimeout(timeout),
      rusb::Error::NoDevice | rusb::Error::Pipe => Error::IoClosed,
      other => Error::Usb(other),
    }
  }
}

impl Transport for UsbTransport {
  fn is_connected(&self) -> bool {
    self.handle.is_some()
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
    let endpoint_out = self.endpoint_out;
    let handle = self.handle()?;
    let start = std::time::Instant::now();

    let mut offset = 0;
    while offset < data.len() {
      let remaining = timeout.saturating_sub(start.elapsed());
      if remaining.is_zero() {
        return Err(Error::IoTimeout(timeout));
      }
      let written = handle
        .write_bulk(endpoint_out, &data[offset..], remaining)
        .map_err(|e| Self::map_usb_err(e, timeout))?;
      if written == 0 {
        return Err(Error::IoClosed);
      }
      offset += written;
    }

    tracing::trace!("usb sent {} bytes", data.len());
    Ok(())
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  fn receive(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
    let endpoint_in = self.endpoint_in;
    let handle = self.handle()?;

    let mut buf = vec![0u8; max];
    let read = handle
      .read_bulk(endpoint_in, &mut buf, timeout)
      .map_err(|e| Self::map_usb_err(e, timeout))?;
    buf.truncate(read);

    tracing::trace!("usb received {} bytes", read);
    Ok(buf)
  }

  fn disconnect(&mut self) -> Result<()> {
    if let Some(handle) = self.handle.take() {
      match handle.release_interface(self.interface_number) {
        Ok(()) => tracing::trace!("released usb interface {}", self.interface_number),
        Err(err) => tracing::warn!("failed to release usb interface: {:?}", err),
      }
    }
    Ok(())
  }

  fn identity(&self) -> String {
    self.identity.clone()
  }
}

impl Drop for UsbTransport {
  fn drop(&mut self) {
    let _ = self.disconnect();
  }
}
