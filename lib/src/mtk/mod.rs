//! MediaTek BROM and Download Agent stack.
//!
//! The layering mirrors the on-device boot flow: [`brom`] speaks to the
//! boot ROM (or Preloader), [`loader`] pushes a two-stage Download Agent
//! through it, and [`xflash`]/[`xml`] speak to the resident DA over the V5
//! binary and V6 XML wire variants behind the [`da::DaProtocol`] seam.

pub mod brom;
pub mod chips;
pub mod da;
pub mod dafile;
pub mod exploit;
pub mod loader;
pub(crate) mod wire;
pub mod xflash;
pub mod xml;

/// Success status word.
pub const STATUS_OK: u16 = 0x0000;
/// Positive acknowledge byte of the ACK/NACK reply pair.
pub const ACK: u8 = 0x5a;
/// Negative acknowledge byte.
pub const NACK: u8 = 0xa5;
/// Status marker for a data checksum mismatch.
pub const STATUS_CHECKSUM_MISMATCH: u16 = 0x1d0c;

/// Value written to the watchdog register to hold the dog off.
pub const WATCHDOG_DISABLE: u32 = 0x2200_0064;

/// Security-gate bits reported by `GET_TARGET_CONFIG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TargetConfig(pub u32);

impl TargetConfig {
  pub const SBC: u32 = 0x0001;
  pub const SLA: u32 = 0x0002;
  pub const DAA: u32 = 0x0004;
  pub const SW_JTAG: u32 = 0x0008;
  pub const EPP: u32 = 0x0010;
  pub const CERT_REQUIRED: u32 = 0x0020;
  pub const MEM_READ_AUTH: u32 = 0x0040;
  pub const MEM_WRITE_AUTH: u32 = 0x0080;
  pub const CMD_C8_BLOCKED: u32 = 0x0100;

  pub fn sbc(&self) -> bool {
    self.0 & Self::SBC != 0
  }

  pub fn sla(&self) -> bool {
    self.0 & Self::SLA != 0
  }

  pub fn daa(&self) -> bool {
    self.0 & Self::DAA != 0
  }

  pub fn cert_required(&self) -> bool {
    self.0 & Self::CERT_REQUIRED != 0
  }

  /// Whether any gate that blocks an unsigned DA is raised.
  pub fn is_secure(&self) -> bool {
    self.0 & (Self::SBC | Self::SLA | Self::DAA) != 0
  }
}

impl std::fmt::Display for TargetConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut gates = vec![];
    for (bit, name) in [
      (Self::SBC, "SBC"),
      (Self::SLA, "SLA"),
      (Self::DAA, "DAA"),
      (Self::SW_JTAG, "SW_JTAG"),
      (Self::EPP, "EPP"),
      (Self::CERT_REQUIRED, "CERT_REQUIRED"),
      (Self::MEM_READ_AUTH, "MEM_READ_AUTH"),
      (Self::MEM_WRITE_AUTH, "MEM_WRITE_AUTH"),
      (Self::CMD_C8_BLOCKED, "CMD_C8_BLOCKED"),
    ] {
      if self.0 & bit != 0 {
        gates.push(name);
      }
    }
    if gates.is_empty() {
      write!(f, "{:#010x} (open)", self.0)
    } else {
      write!(f, "{:#010x} ({})", self.0, gates.join("|"))
    }
  }
}

/// Which wire variant the resident DA speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DaMode {
  Legacy,
  XFlash,
  Xml,
}

/// Exploit family applicable to a chip, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ExploitType {
  None,
  Carbonara,
  AllinoneSignature,
}

/// Which stage answered the DA handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnAgent {
  Brom,
  Preloader,
}

/// Storage backing the partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
  Emmc,
  Ufs,
  Nand,
}

impl StorageType {
  /// Sector size the DA addresses this storage with.
  pub fn sector_size(&self) -> u64 {
    match self {
      StorageType::Emmc | StorageType::Nand => 512,
      StorageType::Ufs => 4096,
    }
  }

  pub fn from_code(code: u32) -> Option<Self> {
    match code {
      1 => Some(StorageType::Emmc),
      2 => Some(StorageType::Ufs),
      3 => Some(StorageType::Nand),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn target_config_bit_views() {
    let open = TargetConfig(0);
    assert!(!open.is_secure());

    let secure = TargetConfig(TargetConfig::SBC | TargetConfig::DAA);
    assert!(secure.sbc());
    assert!(secure.daa());
    assert!(!secure.sla());
    assert!(secure.is_secure());
    assert!(format!("{secure}").contains("SBC|DAA"));
  }

  #[test]
  fn storage_sector_sizes() {
    assert_eq!(StorageType::Emmc.sector_size(), 512);
    assert_eq!(StorageType::Ufs.sector_size(), 4096);
    assert_eq!(StorageType::from_code(2), Some(StorageType::Ufs));
    assert_eq!(StorageType::from_code(9), None);
  }
}
