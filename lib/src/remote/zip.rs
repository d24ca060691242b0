//! ZIP central-directory walker over ranged reads.
//!
//! Finds the stored `payload.bin` entry of an OTA archive using only a
//! handful of small reads: the trailing 64 KiB for the end-of-central-
//! directory record, the central directory itself, and one local file
//! header. ZIP64 archives are handled via the locator record and the
//! `0x0001` extra field. Only stored (uncompressed) entries are usable;
//! signed OTA ZIPs always store `payload.bin`.

use crate::{payload::ByteSource, Error, Result};

const EOCD_SIG: u32 = 0x0605_4B50;
const EOCD64_LOCATOR_SIG: u32 = 0x0706_4B50;
const EOCD64_SIG: u32 = 0x0606_4B50;
const CDR_SIG: u32 = 0x0201_4B50;
const LFH_SIG: u32 = 0x0403_4B50;

const EOCD_MIN: usize = 22;
const EOCD64_LOCATOR_LEN: u64 = 20;
const MAX_COMMENT: u64 = 65_536;
const ZIP64_EXTRA_ID: u16 = 0x0001;

/// The located `payload.bin` entry.
#[derive(Debug, Clone, Copy)]
pub struct PayloadEntry {
  /// Absolute offset of the first payload byte inside the archive.
  pub data_offset: u64,
  pub size: u64,
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16> {
  Ok(u16::from_le_bytes(
    buf
      .get(at..at + 2)
      .ok_or_else(|| Error::ZipMalformed("record truncated".into()))?
      .try_into()?,
  ))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32> {
  Ok(u32::from_le_bytes(
    buf
      .get(at..at + 4)
      .ok_or_else(|| Error::ZipMalformed("record truncated".into()))?
      .try_into()?,
  ))
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64> {
  Ok(u64::from_le_bytes(
    buf
      .get(at..at + 8)
      .ok_or_else(|| Error::ZipMalformed("record truncated".into()))?
      .try_into()?,
  ))
}

/// Locate `payload.bin` inside an archive of `total_len` bytes.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(source)))]
pub fn locate_payload<S: ByteSource>(source: &mut S, total_len: u64) -> Result<PayloadEntry> {
  let (cd_offset, cd_size) = find_central_directory(source, total_len)?;

  if cd_offset + cd_size > total_len {
    return Err(Error::ZipMalformed("central directory extends past end of file".into()));
  }
  let directory = source.read_at(cd_offset, cd_size as usize)?;
  if directory.len() as u64 != cd_size {
    return Err(Error::ZipMalformed("central directory short read".into()));
  }

  let record = find_payload_record(&directory)?;
  if record.method != 0 {
    return Err(Error::ZipMethodUnsupported(record.method));
  }

  // the local header repeats the name/extra with possibly different lengths
  let local = source.read_at(record.local_header_offset, 30)?;
  if read_u32(&local, 0)? != LFH_SIG {
    return Err(Error::ZipMalformed("bad local file header signature".into()));
  }
  let name_len = read_u16(&local, 26)? as u64;
  let extra_len = read_u16(&local, 28)? as u64;

  let entry = PayloadEntry {
    data_offset: record.local_header_offset + 30 + name_len + extra_len,
    size: record.uncompressed_size,
  };
  tracing::info!("payload.bin: {} bytes at archive offset {}", entry.size, entry.data_offset);
  Ok(entry)
}

/// Scan the archive tail for the EOCD and resolve the central directory,
/// following the ZIP64 locator when present.
fn find_central_directory<S: ByteSource>(source: &mut S, total_len: u64) -> Result<(u64, u64)> {
  let tail_len = total_len.min(MAX_COMMENT + EOCD_MIN as u64);
  if tail_len < EOCD_MIN as u64 {
    return Err(Error::ZipMalformed("file smaller than an EOCD record".into()));
  }
  let tail_start = total_len - tail_len;
  let tail = source.read_at(tail_start, tail_len as usize)?;

  let mut eocd_pos = None;
  for i in (0..=tail.len().saturating_sub(EOCD_MIN)).rev() {
    if read_u32(&tail, i)? == EOCD_SIG {
      eocd_pos = Some(i);
      break;
    }
  }
  let eocd_pos = eocd_pos.ok_or_else(|| Error::ZipMalformed("end-of-central-directory not found".into()))?;

  let cd_size = read_u32(&tail, eocd_pos + 12)? as u64;
  let cd_offset = read_u32(&tail, eocd_pos + 16)? as u64;

  // a ZIP64 locator, when present, sits immediately before the EOCD
  let eocd_abs = tail_start + eocd_pos as u64;
  if eocd_abs >= EOCD64_LOCATOR_LEN {
    let locator_abs = eocd_abs - EOCD64_LOCATOR_LEN;
    let locator = if locator_abs >= tail_start {
      let at = (locator_abs - tail_start) as usize;
      tail[at..at + EOCD64_LOCATOR_LEN as usize].to_vec()
    } else {
      source.read_at(locator_abs, EOCD64_LOCATOR_LEN as usize)?
    };

    if read_u32(&locator, 0)? == EOCD64_LOCATOR_SIG {
      let eocd64_offset = read_u64(&locator, 8)?;
      let eocd64 = source.read_at(eocd64_offset, 56)?;
      if read_u32(&eocd64, 0)? != EOCD64_SIG {
        return Err(Error::ZipMalformed("zip64 EOCD signature mismatch".into()));
      }
      let cd_size = read_u64(&eocd64, 40)?;
      let cd_offset = read_u64(&eocd64, 48)?;
      tracing::debug!("zip64 central directory: {} bytes at {}", cd_size, cd_offset);
      return Ok((cd_offset, cd_size));
    }
  }

  if cd_offset == u32::MAX as u64 || cd_size == u32::MAX as u64 {
    return Err(Error::ZipMalformed("zip64 fields set but no zip64 locator".into()));
  }

  tracing::debug!("central directory: {} bytes at {}", cd_size, cd_offset);
  Ok((cd_offset, cd_size))
}

struct CentralRecord {
  method: u16,
  uncompressed_size: u64,
  local_header_offset: u64,
}

/// Walk central-directory records until `payload.bin` turns up.
fn find_payload_record(directory: &[u8]) -> Result<CentralRecord> {
  let mut pos = 0usize;

  while pos + 46 <= directory.len() {
    if read_u32(directory, pos)? != CDR_SIG {
      return Err(Error::ZipMalformed(format!("bad central record signature at {pos}")));
    }

    let method = read_u16(directory, pos + 10)?;
    let compressed_size = read_u32(directory, pos + 20)? as u64;
    let uncompressed_size = read_u32(directory, pos + 24)? as u64;
    let name_len = read_u16(directory, pos + 28)? as usize;
    let extra_len = read_u16(directory, pos + 30)? as usize;
    let comment_len = read_u16(directory, pos + 32)? as usize;
    let local_header_offset = read_u32(directory, pos + 42)? as u64;

    let name_start = pos + 46;
    let name = directory
      .get(name_start..name_start + name_len)
      .ok_or_else(|| Error::ZipMalformed("filename truncated".into()))?;

    if name == b"payload.bin" || name.ends_with(b"/payload.bin") {
      let extra = directory
        .get(name_start + name_len..name_start + name_len + extra_len)
        .ok_or_else(|| Error::ZipMalformed("extra field truncated".into()))?;

      let (uncompressed_size, _, local_header_offset) =
        resolve_zip64_fields(extra, uncompressed_size, compressed_size, local_header_offset)?;

      return Ok(CentralRecord {
        method,
        uncompressed_size,
        local_header_offset,
      });
    }

    pos = name_start + name_len + extra_len + comment_len;
  }

  Err(Error::PayloadBinNotFound)
}

/// Replace any `0xFFFFFFFF` 32-bit fields with values from the ZIP64 extra
/// field (header id 0x0001). Fields appear there in a fixed order, present
/// only for the values that overflowed.
fn resolve_zip64_fields(
  extra: &[u8],
  uncompressed_size: u64,
  compressed_size: u64,
  local_header_offset: u64,
) -> Result<(u64, u64, u64)> {
  let needs_zip64 = uncompressed_size == u32::MAX as u64
    || compressed_size == u32::MAX as u64
    || local_header_offset == u32::MAX as u64;
  if !needs_zip64 {
    return Ok((uncompressed_size, compressed_size, local_header_offset));
  }

  let mut pos = 0usize;
  while pos + 4 <= extra.len() {
    let id = read_u16(extra, pos)?;
    let len = read_u16(extra, pos + 2)? as usize;
    let body = extra
      .get(pos + 4..pos + 4 + len)
      .ok_or_else(|| Error::ZipMalformed("zip64 extra field truncated".into()))?;

    if id == ZIP64_EXTRA_ID {
      let mut at = 0usize;
      let mut take = |needed: bool, current: u64| -> Result<u64> {
        if !needed {
          return Ok(current);
        }
        let value = read_u64(body, at)?;
        at += 8;
        Ok(value)
      };

      let uncompressed = take(uncompressed_size == u32::MAX as u64, uncompressed_size)?;
      let compressed = take(compressed_size == u32::MAX as u64, compressed_size)?;
      let offset = take(local_header_offset == u32::MAX as u64, local_header_offset)?;
      return Ok((uncompressed, compressed, offset));
    }

    pos += 4 + len;
  }

  Err(Error::ZipMalformed("zip64 sizes without a 0x0001 extra field".into()))
}
