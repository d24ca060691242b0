//! Download-Agent protocol seam and shared DA helpers.
//!
//! The two wire variants ([`super::xflash`] for V5 binary frames,
//! [`super::xml`] for V6 XML documents) both implement [`DaProtocol`];
//! everything above the wire (the loader pipeline, the CLI) talks to the
//! trait only.

use std::time::{Duration, Instant};

use crate::{
  transport::{CancelToken, Transport},
  Error, Result,
};

use super::{ConnAgent, DaMode, StorageType};

/// How long the DA may take to print its ready banner after `JUMP_DA`.
pub const READY_WINDOW: Duration = Duration::from_secs(30);

/// Host parameters sent right after the DA becomes ready.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeParams {
  pub host_mtu: u32,
  pub verbose: bool,
  /// 0 = none, 1 = CRC32 on data frames.
  pub checksum_level: u32,
}

impl Default for RuntimeParams {
  fn default() -> Self {
    Self {
      host_mtu: 0x1000_0000,
      verbose: false,
      checksum_level: 0,
    }
  }
}

/// One row of the DA-reported partition table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DaPartition {
  pub name: String,
  pub start_sector: u64,
  pub sector_count: u64,
  /// Size in bytes, derived from the storage's sector size.
  pub size: u64,
  pub part_type: String,
  pub attrs: u64,
}

/// Partition-level interface exposed by a resident DA2.
pub trait DaProtocol: Send {
  /// Which stage loaded DA1 (`brom` or `preloader`).
  fn conn_agent(&mut self) -> Result<ConnAgent>;

  /// Exchange host runtime parameters (MTU, verbosity, checksum level).
  fn set_runtime_parameters(&mut self, params: &RuntimeParams) -> Result<()>;

  /// Upload a stage (DA2, patched DA2, …) and transfer control to it.
  fn boot_to(&mut self, addr: u32, data: &[u8]) -> Result<()>;

  /// Push DRAM init parameters. Required when DA1 came up from BROM.
  fn init_ext_ram(&mut self, emi: &[u8]) -> Result<()>;

  fn storage(&mut self) -> Result<StorageType>;

  fn read_partition_table(&mut self) -> Result<Vec<DaPartition>>;

  /// Read `size` bytes of a partition (the full partition when `None`).
  fn read_partition(
    &mut self,
    name: &str,
    size: Option<u64>,
    progress: &mut dyn FnMut(u64, u64),
  ) -> Result<Vec<u8>>;

  fn write_partition(&mut self, name: &str, data: &[u8], progress: &mut dyn FnMut(u64, u64)) -> Result<()>;

  /// Full-partition clear (`ERASE_PARTITION` on XML, format on XFlash).
  fn erase_partition(&mut self, name: &str) -> Result<()>;

  fn read32(&mut self, addr: u32) -> Result<u32>;

  fn write32(&mut self, addr: u32, value: u32) -> Result<()>;

  fn reboot(&mut self) -> Result<()>;

  fn shutdown(&mut self) -> Result<()>;
}

/// Wait for the device-originated ready marker after `JUMP_DA`.
///
/// The marker is a short banner; anything non-empty within the window
/// counts, since its exact content varies by DA build.
pub fn await_ready(port: &mut dyn Transport, cancel: &CancelToken, window: Duration) -> Result<Vec<u8>> {
  let start = Instant::now();
  while start.elapsed() < window {
    cancel.check()?;
    match port.receive(64, Duration::from_millis(250)) {
      Ok(banner) if !banner.is_empty() => {
        tracing::debug!("DA ready marker: {:02x?}", &banner[..banner.len().min(16)]);
        return Ok(banner);
      }
      Ok(_) => continue,
      Err(Error::IoTimeout(_)) => continue,
      Err(err) => return Err(err),
    }
  }
  Err(Error::IoTimeout(window))
}

/// Pick the wire variant and signature-length policy from the DA1 image.
///
/// An ELF prelude means a V6 (XML) agent; an ARM branch (`EA`/`EB` at
/// offset 3) marks the legacy blob; a high-entropy trailing 0x1000 block
/// means an officially signed DA, treated as V6 with a 0x1000 signature
/// regardless of prelude. Anything else falls back to the chip record.
pub fn classify_da(da1: &[u8], fallback: DaMode) -> (DaMode, usize) {
  const SIG_BLOCK: usize = 0x1000;

  if da1.len() >= SIG_BLOCK && shannon_entropy(&da1[da1.len() - SIG_BLOCK..]) > 7.2 {
    tracing::debug!("DA1 carries a high-entropy signature tail, treating as signed V6");
    return (DaMode::Xml, SIG_BLOCK);
  }
  if da1.len() >= 4 && &da1[0..4] == b"\x7fELF" {
    return (DaMode::Xml, 0x100);
  }
  if da1.len() >= 4 && (da1[3] == 0xea || da1[3] == 0xeb) {
    return (DaMode::Legacy, 0);
  }

  tracing::debug!("DA1 prelude inconclusive, falling back to chip record mode {:?}", fallback);
  let sig = match fallback {
    DaMode::Legacy => 0,
    _ => 0x100,
  };
  (fallback, sig)
}

/// Shannon entropy in bits per byte.
fn shannon_entropy(data: &[u8]) -> f64 {
  if data.is_empty() {
    return 0.0;
  }
  let mut counts = [0u64; 256];
  for &b in data {
    counts[b as usize] += 1;
  }
  let len = data.len() as f64;
  counts
    .iter()
    .filter(|&&c| c > 0)
    .map(|&c| {
      let p = c as f64 / len;
      -p * p.log2()
    })
    .sum()
}

const SECCFG_MAGIC: u32 = 0x4d4d_4d4d;
const SECCFG_LOCKED: u32 = 0x01;
const SECCFG_UNLOCKED: u32 = 0x03;

/// Change the bootloader lock state through the DA.
///
/// `method` selects the mechanism; the known set is `seccfg` (rewrite the
/// lock flag in the `seccfg` partition) and `fastboot` (clear the
/// fastboot-visible lock via `frp`). Unknown methods are an error, never a
/// silent pass-through.
pub fn set_bootloader_lock(da: &mut dyn DaProtocol, lock: bool, method: Option<&str>) -> Result<()> {
  match method.unwrap_or("seccfg") {
    "seccfg" => set_lock_via_seccfg(da, lock),
    "fastboot" => set_lock_via_frp(da, lock),
    other => Err(Error::InvalidArgument(format!("unknown un/lock method: {other}"))),
  }
}

fn set_lock_via_seccfg(da: &mut dyn DaProtocol, lock: bool) -> Result<()> {
  let mut progress = |_: u64, _: u64| {};
  let mut seccfg = da.read_partition("seccfg", None, &mut progress)?;
  if seccfg.len() < 16 {
    return Err(Error::InvalidArgument("seccfg partition too small".into()));
  }

  let magic = u32::from_le_bytes(seccfg[0..4].try_into()?);
  if magic != SECCFG_MAGIC {
    return Err(Error::InvalidArgument(format!("unrecognized seccfg magic {magic:#010x}")));
  }

  let flag = if lock { SECCFG_LOCKED } else { SECCFG_UNLOCKED };
  seccfg[12..16].copy_from_slice(&flag.to_le_bytes());

  da.write_partition("seccfg", &seccfg, &mut progress)?;
  tracing::info!("seccfg lock state set to {}", if lock { "locked" } else { "unlocked" });
  Ok(())
}

fn set_lock_via_frp(da: &mut dyn DaProtocol, lock: bool) -> Result<()> {
  let mut progress = |_: u64, _: u64| {};
  let mut frp = da.read_partition("frp", None, &mut progress)?;
  if frp.is_empty() {
    return Err(Error::InvalidArgument("frp partition is empty".into()));
  }

  // the OEM-unlock-allowed byte sits at the end of frp
  let last = frp.len() - 1;
  frp[last] = if lock { 0 } else { 1 };
  da.write_partition("frp", &frp, &mut progress)?;
  Ok(())
}

const EMI_MARKER: &[u8] = b"MTK_BLOADER_INFO";

/// Cut the EMI (DRAM init) blob out of a preloader image.
pub fn extract_emi(preloader: &[u8]) -> Result<Vec<u8>> {
  let at = preloader
    .windows(EMI_MARKER.len())
    .position(|w| w == EMI_MARKER)
    .ok_or_else(|| Error::InvalidArgument("preloader carries no MTK_BLOADER_INFO block".into()))?;

  tracing::debug!("EMI block found at preloader offset {:#x}", at);
  Ok(preloader[at..].to_vec())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn elf_prelude_classifies_as_xml() {
    let mut da1 = b"\x7fELF".to_vec();
    da1.resize(0x200, 0);
    assert_eq!(classify_da(&da1, DaMode::Legacy), (DaMode::Xml, 0x100));
  }

  #[test]
  fn arm_branch_prelude_classifies_as_legacy() {
    let mut da1 = vec![0x18, 0xf0, 0x9f, 0xea];
    da1.resize(0x200, 0);
    assert_eq!(classify_da(&da1, DaMode::Xml), (DaMode::Legacy, 0));
  }

  #[test]
  fn high_entropy_tail_wins_over_the_prelude() {
    // legacy-looking prelude, but a pseudo-random 0x1000 tail
    let mut da1 = vec![0x18, 0xf0, 0x9f, 0xea];
    da1.resize(0x4000, 0);
    let mut x: u32 = 0x12345678;
    let len = da1.len();
    for b in &mut da1[len - 0x1000..] {
      // xorshift keeps the tail incompressible
      x ^= x << 13;
      x ^= x >> 17;
      x ^= x << 5;
      *b = x as u8;
    }
    assert_eq!(classify_da(&da1, DaMode::Legacy), (DaMode::Xml, 0x1000));
  }

  #[test]
  fn inconclusive_prelude_falls_back_to_the_chip_record() {
    let da1 = vec![0u8; 0x2000];
    assert_eq!(classify_da(&da1, DaMode::XFlash), (DaMode::XFlash, 0x100));
  }

  #[test]
  fn entropy_of_constant_data_is_zero() {
    assert_eq!(shannon_entropy(&[7u8; 1024]), 0.0);
    assert!(shannon_entropy(b"") == 0.0);
  }

  #[test]
  fn emi_extraction_finds_the_marker() {
    let mut preloader = vec![0u8; 0x800];
    preloader.extend_from_slice(b"MTK_BLOADER_INFO_v20");
    preloader.extend_from_slice(&[0xaa; 64]);

    let emi = extract_emi(&preloader).unwrap();
    assert!(emi.starts_with(b"MTK_BLOADER_INFO"));
    assert_eq!(emi.len(), 20 + 64);

    assert!(extract_emi(&[0u8; 128]).is_err());
  }

  struct FakeDa {
    seccfg: Vec<u8>,
    written: Option<Vec<u8>>,
  }

  impl DaProtocol for FakeDa {
    fn conn_agent(&mut self) -> Result<ConnAgent> {
      Ok(ConnAgent::Brom)
    }
    fn set_runtime_parameters(&mut self, _params: &RuntimeParams) -> Result<()> {
      Ok(())
    }
    fn boot_to(&mut self, _addr: u32, _data: &[u8]) -> Result<()> {
      Ok(())
    }
    fn init_ext_ram(&mut self, _emi: &[u8]) -> Result<()> {
      Ok(())
    }
    fn storage(&mut self) -> Result<StorageType> {
      Ok(StorageType::Emmc)
    }
    fn read_partition_table(&mut self) -> Result<Vec<DaPartition>> {
      Ok(vec![])
    }
    fn read_partition(
      &mut self,
      _name: &str,
      _size: Option<u64>,
      _progress: &mut dyn FnMut(u64, u64),
    ) -> Result<Vec<u8>> {
      Ok(self.seccfg.clone())
    }
    fn write_partition(&mut self, _name: &str, data: &[u8], _progress: &mut dyn FnMut(u64, u64)) -> Result<()> {
      self.written = Some(data.to_vec());
      Ok(())
    }
    fn erase_partition(&mut self, _name: &str) -> Result<()> {
      Ok(())
    }
    fn read32(&mut self, _addr: u32) -> Result<u32> {
      Ok(0)
    }
    fn write32(&mut self, _addr: u32, _value: u32) -> Result<()> {
      Ok(())
    }
    fn reboot(&mut self) -> Result<()> {
      Ok(())
    }
    fn shutdown(&mut self) -> Result<()> {
      Ok(())
    }
  }

  #[test]
  fn unknown_unlock_method_is_an_invalid_argument() {
    let mut da = FakeDa {
      seccfg: vec![],
      written: None,
    };
    let res = set_bootloader_lock(&mut da, false, Some("magic-wand"));
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
  }

  #[test]
  fn seccfg_unlock_patches_the_lock_flag() {
    let mut seccfg = vec![0u8; 32];
    seccfg[0..4].copy_from_slice(&SECCFG_MAGIC.to_le_bytes());
    seccfg[12..16].copy_from_slice(&SECCFG_LOCKED.to_le_bytes());

    let mut da = FakeDa {
      seccfg,
      written: None,
    };
    set_bootloader_lock(&mut da, false, None).unwrap();

    let written = da.written.unwrap();
    assert_eq!(u32::from_le_bytes(written[12..16].try_into().unwrap()), SECCFG_UNLOCKED);
  }

  #[test]
  fn seccfg_with_bad_magic_is_rejected() {
    let mut da = FakeDa {
      seccfg: vec![0xff; 32],
      written: None,
    };
    let res = set_bootloader_lock(&mut da, true, Some("seccfg"));
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
    assert!(da.written.is_none());
  }
}
