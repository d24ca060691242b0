//! MediaTek chip database.
//!
//! Process-wide, read-only. Lookups consult the primary table first and
//! then the preloader-alias table, because several chips advertise a
//! different `hw_code` in Preloader mode than in BROM mode.
//!
//! The individual records are best effort: addresses and exploit
//! assignments come from public research and are not authoritative for
//! every stepping. Unknown chips degrade to [`ChipRecord::best_effort`].

use lazy_static::lazy_static;
use std::collections::HashMap;

use super::{DaMode, ExploitType};

/// Static description of one SoC as seen from BROM.
#[derive(Debug, Clone)]
pub struct ChipRecord {
  pub hw_code: u16,
  pub name: &'static str,
  pub watchdog_addr: u32,
  pub uart_addr: u32,
  pub brom_payload_addr: u32,
  pub da_payload_addr: u32,
  pub cq_dma_base: Option<u32>,
  pub da_mode: DaMode,
  pub is_64bit: bool,
  pub brom_patched: bool,
  pub requires_loader: bool,
  pub exploit: ExploitType,
  pub codename: &'static str,
}

impl ChipRecord {
  /// Defaults used when a chip is absent from the table. The session is
  /// flagged unverified by the caller.
  pub fn best_effort(hw_code: u16) -> Self {
    Self {
      hw_code,
      name: "unknown",
      watchdog_addr: 0x1000_7000,
      uart_addr: 0x1100_2000,
      brom_payload_addr: 0x0010_0a00,
      da_payload_addr: 0x0020_0000,
      cq_dma_base: None,
      da_mode: DaMode::XFlash,
      is_64bit: true,
      brom_patched: false,
      requires_loader: false,
      exploit: ExploitType::None,
      codename: "unknown",
    }
  }
}

macro_rules! chip {
  ($map:ident, $hw:expr, $name:expr, $wdt:expr, $uart:expr, $brom:expr, $da:expr,
   $cqdma:expr, $mode:expr, $is64:expr, $patched:expr, $loader:expr, $exploit:expr, $code:expr) => {
    $map.insert(
      $hw,
      ChipRecord {
        hw_code: $hw,
        name: $name,
        watchdog_addr: $wdt,
        uart_addr: $uart,
        brom_payload_addr: $brom,
        da_payload_addr: $da,
        cq_dma_base: $cqdma,
        da_mode: $mode,
        is_64bit: $is64,
        brom_patched: $patched,
        requires_loader: $loader,
        exploit: $exploit,
        codename: $code,
      },
    );
  };
}

lazy_static! {
  /// hw_code -> chip record, keyed by the BROM-mode code.
  pub static ref CHIP_TABLE: HashMap<u16, ChipRecord> = {
    use DaMode::*;
    use ExploitType::*;
    let mut m = HashMap::new();

    chip!(m, 0x0279, "MT6797", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212c00), XFlash, true, false, false, None, "helio x20");
    chip!(m, 0x0321, "MT6735", 0x10212000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Option::None, XFlash, true, false, false, None, "");
    chip!(m, 0x0335, "MT6737M", 0x10212000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Option::None, XFlash, true, false, false, None, "");
    chip!(m, 0x0571, "MT6580", 0x10007000, 0x11005000, 0x0010_0a00, 0x0020_0000,
      Option::None, Legacy, false, false, true, None, "");
    chip!(m, 0x0598, "MT6771", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), XFlash, true, false, false, Carbonara, "helio p60");
    chip!(m, 0x0699, "MT6739", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), XFlash, true, false, false, Carbonara, "");
    chip!(m, 0x0707, "MT6768", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), Xml, true, false, false, Carbonara, "helio g85");
    chip!(m, 0x0717, "MT6761", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), Xml, true, false, false, Carbonara, "helio a22");
    chip!(m, 0x0766, "MT6765", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), Xml, true, false, false, Carbonara, "helio p35");
    chip!(m, 0x0788, "MT6771V", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), Xml, true, false, false, Carbonara, "helio p70");
    chip!(m, 0x0813, "MT6785", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), Xml, true, false, false, AllinoneSignature, "helio g90");
    chip!(m, 0x0886, "MT6873", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), Xml, true, true, false, AllinoneSignature, "dimensity 800");
    chip!(m, 0x0959, "MT6893", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), Xml, true, true, false, AllinoneSignature, "dimensity 1200");
    chip!(m, 0x0989, "MT6833", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), Xml, true, true, false, AllinoneSignature, "dimensity 700");
    chip!(m, 0x0996, "MT6853", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Some(0x10212000), Xml, true, true, false, AllinoneSignature, "dimensity 720");
    chip!(m, 0x8163, "MT8163", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Option::None, Legacy, true, false, true, None, "");
    chip!(m, 0x8167, "MT8167", 0x10007000, 0x11005000, 0x0010_0a00, 0x0020_0000,
      Option::None, XFlash, true, false, false, None, "");
    chip!(m, 0x8173, "MT8173", 0x10007000, 0x11002000, 0x0010_0a00, 0x0020_0000,
      Option::None, XFlash, true, false, false, None, "");

    m
  };

  /// Preloader-mode hw_code -> BROM-mode hw_code.
  ///
  /// Preloader reports the marketing number; BROM reports the die code.
  pub static ref PRELOADER_ALIAS: HashMap<u16, u16> = {
    let mut m = HashMap::new();
    m.insert(0x6739, 0x0699);
    m.insert(0x6761, 0x0717);
    m.insert(0x6765, 0x0766);
    m.insert(0x6768, 0x0707);
    m.insert(0x6771, 0x0788);
    m.insert(0x6785, 0x0813);
    m.insert(0x6833, 0x0989);
    m.insert(0x6853, 0x0996);
    m.insert(0x6873, 0x0886);
    m.insert(0x6893, 0x0959);
    m
  };
}

/// Resolve a chip record, consulting the alias table before giving up.
pub fn lookup_chip(hw_code: u16) -> Option<&'static ChipRecord> {
  if let Some(record) = CHIP_TABLE.get(&hw_code) {
    return Some(record);
  }
  PRELOADER_ALIAS.get(&hw_code).and_then(|brom_code| CHIP_TABLE.get(brom_code))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn direct_lookup_finds_brom_codes() {
    let chip = lookup_chip(0x0766).unwrap();
    assert_eq!(chip.name, "MT6765");
    assert_eq!(chip.da_mode, DaMode::Xml);
  }

  #[test]
  fn alias_lookup_resolves_preloader_codes() {
    // preloader-mode code differs from the brom-mode one
    let chip = lookup_chip(0x6765).unwrap();
    assert_eq!(chip.hw_code, 0x0766);
    assert_eq!(chip.name, "MT6765");
  }

  #[test]
  fn unknown_codes_report_none() {
    assert!(lookup_chip(0xbeef).is_none());
  }
}
