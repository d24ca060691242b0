//! `MTK_DOWNLOAD_AGENT` container parser.
//!
//! An all-in-one DA file carries one entry per supported chip; each entry
//! points at up to ten load regions inside the file. Region 0 of the
//! matching entry is the DA1 stub, region 1 the full DA2 agent.
//!
//! Layout: a 108-byte header (18-byte magic string, 14 bytes of padding, a
//! 64-byte build id, a format word, the `0x99886622` magic, and the entry
//! count), then `count` entries of 220 bytes each: a 20-byte entry head
//! followed by ten 20-byte region descriptors.

use crate::{Error, Result};

pub const DA_FILE_MAGIC: &[u8; 18] = b"MTK_DOWNLOAD_AGENT";
pub const DA_MAGIC: u32 = 0x9988_6622;

const HEADER_SIZE: usize = 108;
const ENTRY_HEAD_SIZE: usize = 20;
const REGION_DESC_SIZE: usize = 20;
const REGION_SLOTS: usize = 10;
const ENTRY_SIZE: usize = ENTRY_HEAD_SIZE + REGION_SLOTS * REGION_DESC_SIZE;
const ENTRY_MAGIC: u16 = 0xdada;

/// One load region: a slice of the file destined for a load address.
#[derive(Debug, Clone)]
pub struct DaRegion {
  pub file_offset: u32,
  pub total_length: u32,
  pub load_address: u32,
  /// Payload length excluding the trailing signature.
  pub region_length: u32,
  pub signature_length: u32,
  /// Full region bytes, signature included.
  pub data: Vec<u8>,
  pub signature: Vec<u8>,
}

/// One per-chip entry.
#[derive(Debug, Clone)]
pub struct DaEntry {
  pub hw_code: u16,
  pub hw_subcode: u16,
  pub hw_version: u16,
  pub sw_version: u16,
  pub regions: Vec<DaRegion>,
}

impl DaEntry {
  /// The DA1 stub (region 0).
  pub fn da1(&self) -> Option<&DaRegion> {
    self.regions.first()
  }

  /// The full DA2 agent (region 1).
  pub fn da2(&self) -> Option<&DaRegion> {
    self.regions.get(1)
  }
}

/// Parsed all-in-one DA file.
#[derive(Debug, Clone)]
pub struct DaFile {
  /// Build identifier string out of the header.
  pub file_id: String,
  pub version: u32,
  pub entries: Vec<DaEntry>,
}

impl DaFile {
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(bytes)))]
  pub fn parse(bytes: &[u8]) -> Result<Self> {
    if bytes.len() < HEADER_SIZE {
      return Err(Error::InvalidArgument("DA file shorter than its header".into()));
    }
    if &bytes[0..18] != DA_FILE_MAGIC {
      return Err(Error::InvalidArgument("missing MTK_DOWNLOAD_AGENT magic".into()));
    }

    let file_id = String::from_utf8_lossy(&bytes[32..96])
      .trim_end_matches('\0')
      .to_string();
    let version = u32::from_le_bytes(bytes[96..100].try_into()?);
    let magic = u32::from_le_bytes(bytes[100..104].try_into()?);
    if magic != DA_MAGIC {
      return Err(Error::InvalidArgument(format!("bad DA magic {magic:#010x}")));
    }
    let count = u32::from_le_bytes(bytes[104..108].try_into()?) as usize;

    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
      let at = HEADER_SIZE + index * ENTRY_SIZE;
      let entry = bytes
        .get(at..at + ENTRY_SIZE)
        .ok_or_else(|| Error::InvalidArgument(format!("DA entry {index} truncated")))?;

      let entry_magic = u16::from_le_bytes(entry[0..2].try_into()?);
      if entry_magic != ENTRY_MAGIC {
        return Err(Error::InvalidArgument(format!(
          "DA entry {index} has bad magic {entry_magic:#06x}"
        )));
      }

      let hw_code = u16::from_le_bytes(entry[2..4].try_into()?);
      let hw_subcode = u16::from_le_bytes(entry[4..6].try_into()?);
      let hw_version = u16::from_le_bytes(entry[6..8].try_into()?);
      let sw_version = u16::from_le_bytes(entry[8..10].try_into()?);
      let region_count = u16::from_le_bytes(entry[18..20].try_into()?) as usize;
      if region_count == 0 || region_count > REGION_SLOTS {
        return Err(Error::InvalidArgument(format!(
          "DA entry {index} declares {region_count} regions"
        )));
      }

      let mut regions = Vec::with_capacity(region_count);
      for slot in 0..region_count {
        let at = ENTRY_HEAD_SIZE + slot * REGION_DESC_SIZE;
        let desc = &entry[at..at + REGION_DESC_SIZE];

        let file_offset = u32::from_le_bytes(desc[0..4].try_into()?);
        let total_length = u32::from_le_bytes(desc[4..8].try_into()?);
        let load_address = u32::from_le_bytes(desc[8..12].try_into()?);
        let signature_length = u32::from_le_bytes(desc[16..20].try_into()?);

        let data = bytes
          .get(file_offset as usize..(file_offset + total_length) as usize)
          .ok_or_else(|| Error::InvalidArgument(format!("DA region {index}/{slot} out of bounds")))?
          .to_vec();
        let signature = data[data.len() - (signature_length as usize).min(data.len())..].to_vec();

        regions.push(DaRegion {
          file_offset,
          total_length,
          load_address,
          region_length: total_length.saturating_sub(signature_length),
          signature_length,
          data,
          signature,
        });
      }

      entries.push(DaEntry {
        hw_code,
        hw_subcode,
        hw_version,
        sw_version,
        regions,
      });
    }

    tracing::info!("DA file \"{}\": {} chip entries", file_id, entries.len());
    Ok(Self {
      file_id,
      version,
      entries,
    })
  }

  /// Entry for a chip, matched on `hw_code`.
  pub fn entry_for(&self, hw_code: u16) -> Option<&DaEntry> {
    self.entries.iter().find(|e| e.hw_code == hw_code)
  }
}

#[cfg(test)]
pub(crate) mod testutil {
  //! Synthetic all-in-one DA files for loader and parser tests.

  use super::*;

  /// Build a DA file with one entry holding the given DA1/DA2 blobs.
  pub fn build_da_file(hw_code: u16, da1: &[u8], da1_sig_len: u32, da2: &[u8], da2_sig_len: u32) -> Vec<u8> {
    let mut out = vec![];
    out.extend_from_slice(DA_FILE_MAGIC);
    out.extend_from_slice(&[0u8; 14]);
    let mut build_id = [0u8; 64];
    build_id[..22].copy_from_slice(b"MTK_AllInOne_DA_v3.tst");
    out.extend_from_slice(&build_id);
    out.extend_from_slice(&4u32.to_le_bytes());
    out.extend_from_slice(&DA_MAGIC.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());

    let data_base = (HEADER_SIZE + ENTRY_SIZE) as u32;
    let da1_offset = data_base;
    let da2_offset = data_base + da1.len() as u32;

    // entry head
    out.extend_from_slice(&ENTRY_MAGIC.to_le_bytes());
    out.extend_from_slice(&hw_code.to_le_bytes());
    out.extend_from_slice(&0x8a00u16.to_le_bytes()); // hw_subcode
    out.extend_from_slice(&0xca00u16.to_le_bytes()); // hw_version
    out.extend_from_slice(&0u16.to_le_bytes()); // sw_version
    out.extend_from_slice(&[0u8; 6]); // unknowns
    out.extend_from_slice(&0u16.to_le_bytes()); // entry index
    out.extend_from_slice(&2u16.to_le_bytes()); // region count

    // region 0 (DA1) and region 1 (DA2)
    for (offset, blob, load, sig_len) in [
      (da1_offset, da1, 0x0020_0000u32, da1_sig_len),
      (da2_offset, da2, 0x4000_0000u32, da2_sig_len),
    ] {
      out.extend_from_slice(&offset.to_le_bytes());
      out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
      out.extend_from_slice(&load.to_le_bytes());
      out.extend_from_slice(&0u32.to_le_bytes()); // sig offset
      out.extend_from_slice(&sig_len.to_le_bytes());
    }
    // remaining empty region slots
    out.extend_from_slice(&vec![0u8; (REGION_SLOTS - 2) * REGION_DESC_SIZE]);

    out.extend_from_slice(da1);
    out.extend_from_slice(da2);
    out
  }
}

#[cfg(test)]
mod tests {
  use super::testutil::build_da_file;
  use super::*;

  #[test]
  fn parses_a_single_entry_file() {
    let da1 = vec![0x11u8; 0x400];
    let da2 = vec![0x22u8; 0x800];
    let file = build_da_file(0x0766, &da1, 0x100, &da2, 0x100);

    let parsed = DaFile::parse(&file).unwrap();
    assert_eq!(parsed.entries.len(), 1);
    assert!(parsed.file_id.starts_with("MTK_AllInOne_DA"));

    let entry = parsed.entry_for(0x0766).unwrap();
    assert_eq!(entry.regions.len(), 2);

    let da1_region = entry.da1().unwrap();
    assert_eq!(da1_region.data, da1);
    assert_eq!(da1_region.region_length, 0x300);
    assert_eq!(da1_region.signature.len(), 0x100);

    let da2_region = entry.da2().unwrap();
    assert_eq!(da2_region.data, da2);
    assert_eq!(da2_region.load_address, 0x4000_0000);
  }

  #[test]
  fn unknown_chip_has_no_entry() {
    let file = build_da_file(0x0766, &[0u8; 0x200], 0, &[0u8; 0x200], 0);
    let parsed = DaFile::parse(&file).unwrap();
    assert!(parsed.entry_for(0x0813).is_none());
  }

  #[test]
  fn bad_magic_is_rejected() {
    let mut file = build_da_file(0x0766, &[0u8; 0x200], 0, &[0u8; 0x200], 0);
    file[0] = b'X';
    assert!(DaFile::parse(&file).is_err());

    let mut file = build_da_file(0x0766, &[0u8; 0x200], 0, &[0u8; 0x200], 0);
    file[100] = 0;
    assert!(DaFile::parse(&file).is_err());
  }
}
