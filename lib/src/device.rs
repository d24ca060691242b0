//! Device descriptors and the informational vendor-ID table.

use rusb::{Context, UsbContext};

use crate::{
  transport::{
    usb::{FASTBOOT_CLASS, FASTBOOT_PROTOCOL, FASTBOOT_SUBCLASS},
    TransportKind,
  },
  Result,
};

/// MediaTek's USB vendor id (BROM and Preloader ports).
pub const MEDIATEK_VID: u16 = 0x0e8d;

/// Well-known Android-ecosystem USB vendor ids.
///
/// Informational only; matching a vendor never gates an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum UsbVendor {
  Google,
  Samsung,
  Xiaomi,
  Oppo,
  OnePlus,
  Motorola,
  Qualcomm,
  MediaTek,
  Unisoc,
  Huawei,
  Vivo,
  Lenovo,
  Asus,
  Sony,
  Amlogic,
  Other(u16),
}

impl UsbVendor {
  pub fn from_vid(vid: u16) -> Self {
    match vid {
      0x18d1 => Self::Google,
      0x04e8 => Self::Samsung,
      0x2717 => Self::Xiaomi,
      0x22d9 => Self::Oppo,
      0x2a70 => Self::OnePlus,
      0x22b8 => Self::Motorola,
      0x05c6 => Self::Qualcomm,
      MEDIATEK_VID => Self::MediaTek,
      0x1782 => Self::Unisoc,
      0x12d1 => Self::Huawei,
      0x2d95 => Self::Vivo,
      0x17ef => Self::Lenovo,
      0x0b05 => Self::Asus,
      0x0fce => Self::Sony,
      0x1b8e => Self::Amlogic,
      other => Self::Other(other),
    }
  }
}

/// Identifying tuple for an enumerated device.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceInfo {
  pub vendor_id: u16,
  pub product_id: u16,
  pub serial: Option<String>,
  pub kind: TransportKind,
  pub vendor: UsbVendor,
  /// `bus:address` handle for reopening the same device.
  pub bus: u8,
  pub address: u8,
  /// Whether an interface advertised the fastboot class triple.
  pub fastboot: bool,
}

/// Enumerate USB devices that look like flashing targets: anything exposing
/// a fastboot interface, plus everything from a known Android vendor.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "debug"))]
pub fn list_usb_devices() -> Result<Vec<DeviceInfo>> {
  let context = Context::new()?;
  let mut found = vec![];

  for device in context.devices()?.iter() {
    let Ok(desc) = device.device_descriptor() else {
      continue;
    };

    let fastboot = has_fastboot_interface(&device);
    let vendor = UsbVendor::from_vid(desc.vendor_id());
    if !fastboot && matches!(vendor, UsbVendor::Other(_)) {
      continue;
    }

    let serial = device.open().ok().and_then(|handle| {
      let lang = handle.read_languages(std::time::Duration::from_millis(100)).ok()?;
      let lang = lang.first().copied()?;
      handle
        .read_serial_number_string(lang, &desc, std::time::Duration::from_millis(100))
        .ok()
    });

    found.push(DeviceInfo {
      vendor_id: desc.vendor_id(),
      product_id: desc.product_id(),
      serial,
      kind: TransportKind::Usb,
      vendor,
      bus: device.bus_number(),
      address: device.address(),
      fastboot,
    });
  }

  tracing::debug!("enumerated {} candidate devices", found.len());
  Ok(found)
}

fn has_fastboot_interface(device: &rusb::Device<Context>) -> bool {
  let Ok(config) = device.active_config_descriptor() else {
    return false;
  };
  config.interfaces().any(|interface| {
    interface.descriptors().any(|d| {
      d.class_code() == FASTBOOT_CLASS
        && d.sub_class_code() == FASTBOOT_SUBCLASS
        && d.protocol_code() == FASTBOOT_PROTOCOL
    })
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn vendor_table_resolves_known_vids() {
    assert_eq!(UsbVendor::from_vid(0x18d1), UsbVendor::Google);
    assert_eq!(UsbVendor::from_vid(0x0e8d), UsbVendor::MediaTek);
    assert_eq!(UsbVendor::from_vid(0x1782), UsbVendor::Unisoc);
    assert_eq!(UsbVendor::from_vid(0xdead), UsbVendor::Other(0xdead));
  }
}
