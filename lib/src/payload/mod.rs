//! Chrome OS update_engine `payload.bin` reader.
//!
//! Parses the `CrAU` header and the protobuf manifest, then extracts
//! partitions by replaying their install operations. Sources are abstracted
//! behind [`ByteSource`] so the same reader works against a local file, a
//! stored entry inside a local OTA ZIP, or HTTP range requests anchored
//! inside a remote archive.

pub mod proto;

use std::{
  fs::File,
  io::{Read, Seek, SeekFrom, Write},
  path::Path,
};

use crate::{transport::CancelToken, Error, Result};

pub use proto::{op_type, Extent, InstallOp, Manifest, PartitionUpdate};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";
/// Header size for `version >= 2` payloads.
pub const HEADER_SIZE: u64 = 24;

/// Random-access byte supplier for payload data.
pub trait ByteSource {
  /// Read exactly `len` bytes starting at `offset` (short only at EOF).
  fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

/// [`ByteSource`] over anything seekable.
pub struct SeekSource<R: Read + Seek> {
  inner: R,
}

impl<R: Read + Seek> SeekSource<R> {
  pub fn new(inner: R) -> Self {
    Self { inner }
  }
}

impl<R: Read + Seek> ByteSource for SeekSource<R> {
  fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
    self.inner.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
      let n = self.inner.read(&mut buf[filled..])?;
      if n == 0 {
        break;
      }
      filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
  }
}

/// A window into another source, used for `payload.bin` entries that live at
/// an offset inside a larger archive.
pub struct OffsetSource<S: ByteSource> {
  inner: S,
  base: u64,
}

impl<S: ByteSource> OffsetSource<S> {
  pub fn new(inner: S, base: u64) -> Self {
    Self { inner, base }
  }
}

impl<S: ByteSource> ByteSource for OffsetSource<S> {
  fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
    self.inner.read_at(self.base + offset, len)
  }
}

/// Parsed fixed-size payload header.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PayloadHeader {
  pub file_format_version: u64,
  pub manifest_size: u64,
  pub metadata_signature_size: u32,
  /// Absolute offset of the first operation data blob.
  pub data_start_offset: u64,
}

impl PayloadHeader {
  pub fn parse(buf: &[u8]) -> Result<Self> {
    if buf.len() < HEADER_SIZE as usize {
      return Err(Error::PayloadMagicMismatch);
    }
    if &buf[0..4] != PAYLOAD_MAGIC {
      return Err(Error::PayloadMagicMismatch);
    }
    let file_format_version = u64::from_be_bytes(buf[4..12].try_into()?);
    if file_format_version < 2 {
      return Err(Error::UnsupportedVersion(file_format_version));
    }
    let manifest_size = u64::from_be_bytes(buf[12..20].try_into()?);
    let metadata_signature_size = u32::from_be_bytes(buf[20..24].try_into()?);

    Ok(Self {
      file_format_version,
      manifest_size,
      metadata_signature_size,
      data_start_offset: HEADER_SIZE + manifest_size + metadata_signature_size as u64,
    })
  }
}

/// Hook invoked for compressed or otherwise non-trivial install operations.
///
/// The built-in [`StandardDecompressor`] covers `REPLACE_BZ` and
/// `REPLACE_XZ`; anything else must come from the caller.
pub trait Decompressor: Send {
  /// Decompress `input` for operation type `op_type` into a buffer.
  fn decompress(&self, op_type: u32, input: &[u8]) -> Result<Vec<u8>>;
}

/// Default decompressor: BZip2 and XZ.
pub struct StandardDecompressor;

impl Decompressor for StandardDecompressor {
  fn decompress(&self, op: u32, input: &[u8]) -> Result<Vec<u8>> {
    match op {
      op_type::REPLACE_BZ => {
        let mut out = vec![];
        bzip2::read::BzDecoder::new(input).read_to_end(&mut out)?;
        Ok(out)
      }
      op_type::REPLACE_XZ => {
        let mut out = vec![];
        lzma_rs::xz_decompress(&mut std::io::Cursor::new(input), &mut out)
          .map_err(|e| Error::ManifestMalformed(format!("xz stream: {e:?}")))?;
        Ok(out)
      }
      other => Err(Error::UnsupportedOperation(other)),
    }
  }
}

/// Reader over one payload: header + manifest + operation replay.
pub struct PayloadReader<S: ByteSource> {
  source: S,
  header: PayloadHeader,
  manifest: Manifest,
  decompressor: Option<Box<dyn Decompressor>>,
}

impl PayloadReader<SeekSource<File>> {
  /// Open a bare `payload.bin` file.
  pub fn open_file(path: &Path) -> Result<Self> {
    Self::open(SeekSource::new(File::open(path)?))
  }
}

impl PayloadReader<OffsetSource<SeekSource<File>>> {
  /// Open the stored `payload.bin` entry of a local OTA ZIP.
  pub fn open_zip_file(path: &Path) -> Result<Self> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let name = archive
      .file_names()
      .find(|n| *n == "payload.bin" || n.ends_with("/payload.bin"))
      .map(str::to_string)
      .ok_or(Error::PayloadBinNotFound)?;

    let entry = archive.by_name(&name)?;
    if entry.compression() != zip::CompressionMethod::Stored {
      let method = match entry.compression() {
        zip::CompressionMethod::Deflated => 8,
        zip::CompressionMethod::Bzip2 => 12,
        zip::CompressionMethod::Zstd => 93,
        _ => u16::MAX,
      };
      return Err(Error::ZipMethodUnsupported(method));
    }
    let base = entry.data_start();
    drop(entry);

    tracing::debug!("payload.bin found in {} at offset {}", path.display(), base);
    let file = File::open(path)?;
    Self::open(OffsetSource::new(SeekSource::new(file), base))
  }
}

impl<S: ByteSource> PayloadReader<S> {
  /// Parse the header and manifest from `source`.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip_all))]
  pub fn open(mut source: S) -> Result<Self> {
    let header = PayloadHeader::parse(&source.read_at(0, HEADER_SIZE as usize)?)?;
    let manifest_bytes = source.read_at(HEADER_SIZE, header.manifest_size as usize)?;
    if manifest_bytes.len() as u64 != header.manifest_size {
      return Err(Error::ManifestMalformed("manifest truncated".into()));
    }
    let manifest = Manifest::parse(&manifest_bytes)?;

    tracing::info!(
      "payload v{}: {} partitions, data starts at {}",
      header.file_format_version,
      manifest.partitions.len(),
      header.data_start_offset
    );

    Ok(Self {
      source,
      header,
      manifest,
      decompressor: Some(Box::new(StandardDecompressor)),
    })
  }

  /// Drop the built-in decompressor; compressed operations then fail with
  /// [`Error::DecompressorUnavailable`].
  pub fn without_decompressor(mut self) -> Self {
    self.decompressor = None;
    self
  }

  /// Replace the decompressor hook.
  pub fn with_decompressor(mut self, decompressor: Box<dyn Decompressor>) -> Self {
    self.decompressor = Some(decompressor);
    self
  }

  pub fn header(&self) -> &PayloadHeader {
    &self.header
  }

  pub fn block_size(&self) -> u32 {
    self.manifest.block_size
  }

  pub fn partitions(&self) -> &[PartitionUpdate] {
    &self.manifest.partitions
  }

  pub fn partition(&self, name: &str) -> Option<&PartitionUpdate> {
    self.manifest.partitions.iter().find(|p| p.name == name)
  }

  /// Extract `name` into `out` by replaying its install operations.
  ///
  /// `progress` is called with `(bytes_done, bytes_total)` after each
  /// operation. Returns the number of bytes written.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self, out, cancel, progress)))]
  pub fn extract_partition<W: Write + Seek>(
    &mut self,
    name: &str,
    out: &mut W,
    cancel: &CancelToken,
    mut progress: impl FnMut(u64, u64),
  ) -> Result<u64> {
    let partition = self
      .manifest
      .partitions
      .iter()
      .find(|p| p.name == name)
      .cloned()
      .ok_or_else(|| Error::InvalidArgument(format!("no such partition in payload: {name}")))?;

    let block_size = self.manifest.block_size as u64;
    let total: u64 = partition
      .operations
      .iter()
      .flat_map(|op| op.dst_extents.iter())
      .map(|e| e.num_blocks * block_size)
      .sum();

    tracing::info!("extracting {} ({} operations, {} bytes)", name, partition.operations.len(), total);

    let mut written: u64 = 0;
    for op in &partition.operations {
      cancel.check()?;
      written += self.apply_operation(op, out, block_size)?;
      progress(written.min(total), total);
    }

    Ok(written)
  }

  fn apply_operation<W: Write + Seek>(&mut self, op: &InstallOp, out: &mut W, block_size: u64) -> Result<u64> {
    let dst_bytes: u64 = op.dst_extents.iter().map(|e| e.num_blocks * block_size).sum();

    match op.op_type {
      op_type::REPLACE => {
        let data = self.read_op_data(op)?;
        if data.len() as u64 > dst_bytes {
          return Err(Error::ManifestMalformed(format!(
            "REPLACE payload {} exceeds destination {}",
            data.len(),
            dst_bytes
          )));
        }
        write_extents(out, &op.dst_extents, block_size, &data)?;
        Ok(data.len() as u64)
      }
      op_type::ZERO => {
        // consumes no input
        let zeros = vec![0u8; dst_bytes as usize];
        write_extents(out, &op.dst_extents, block_size, &zeros)?;
        Ok(dst_bytes)
      }
      other => {
        if self.decompressor.is_none() {
          return match other {
            op_type::REPLACE_BZ | op_type::REPLACE_XZ => Err(Error::DecompressorUnavailable(other)),
            _ => Err(Error::UnsupportedOperation(other)),
          };
        }

        let data = self.read_op_data(op)?;
        let decompressor = self.decompressor.as_deref().unwrap();
        let decompressed = decompressor.decompress(other, &data)?;
        verify_decompressed_len(decompressed.len() as u64, dst_bytes, block_size)?;
        write_extents(out, &op.dst_extents, block_size, &decompressed)?;
        Ok(decompressed.len() as u64)
      }
    }
  }

  fn read_op_data(&mut self, op: &InstallOp) -> Result<Vec<u8>> {
    let offset = self.header.data_start_offset + op.data_offset;
    let data = self.source.read_at(offset, op.data_length as usize)?;
    if data.len() as u64 != op.data_length {
      return Err(Error::ManifestMalformed(format!(
        "operation data truncated at offset {offset}"
      )));
    }
    Ok(data)
  }
}

/// The decompressed length must fill the destination, short only of a final
/// partial block.
fn verify_decompressed_len(actual: u64, dst_bytes: u64, block_size: u64) -> Result<()> {
  let lower = dst_bytes.saturating_sub(block_size);
  if actual > dst_bytes || actual <= lower {
    return Err(Error::ManifestMalformed(format!(
      "decompressed length {actual} does not match destination {dst_bytes}"
    )));
  }
  Ok(())
}

/// Scatter `data` across `extents` in order, zero-padding nothing: each
/// extent takes the next `num_blocks * block_size` bytes (the final extent
/// may receive a short tail).
fn write_extents<W: Write + Seek>(out: &mut W, extents: &[Extent], block_size: u64, data: &[u8]) -> Result<()> {
  let mut consumed: u64 = 0;
  for extent in extents {
    if consumed >= data.len() as u64 {
      break;
    }
    let span = extent.num_blocks * block_size;
    let take = span.min(data.len() as u64 - consumed);
    out.seek(SeekFrom::Start(extent.start_block * block_size))?;
    out.write_all(&data[consumed as usize..(consumed + take) as usize])?;
    consumed += take;
  }
  Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
  //! Synthetic payload builder shared by payload and remote tests.

  use super::proto::encode;
  use super::PAYLOAD_MAGIC;

  /// Build a version-2 payload. Each op tuple is
  /// `(type, blob bytes, dst start_block, dst num_blocks)`; blobs must be
  /// concatenated into `blobs` in operation order.
  pub fn build_payload(partitions: &[(&str, Vec<(u32, Vec<u8>, u64, u64)>)], blobs: &[u8]) -> Vec<u8> {
    // each op tuple: (type, inline data already placed in blobs via offset/len, start_block, num_blocks)
    let mut manifest = vec![];
    encode::varint_field(&mut manifest, 3, 4096);

    for (name, ops) in partitions {
      let mut partition = vec![];
      encode::bytes_field(&mut partition, 1, name.as_bytes());

      let mut info = vec![];
      let size: u64 = ops.iter().map(|(_, _, _, blocks)| blocks * 4096).sum();
      encode::varint_field(&mut info, 1, size);
      encode::bytes_field(&mut partition, 7, &info);

      let mut data_offset = 0u64;
      for (op_type_value, data, start_block, num_blocks) in ops {
        let mut op = vec![];
        encode::varint_field(&mut op, 1, *op_type_value as u64);
        if !data.is_empty() {
          // ops are laid out back to back in the blob area
          let offset = blobs
            .windows(data.len())
            .position(|w| w == &data[..])
            .map(|p| p as u64)
            .unwrap_or(data_offset);
          encode::varint_field(&mut op, 2, offset);
          encode::varint_field(&mut op, 3, data.len() as u64);
          data_offset += data.len() as u64;
        }
        let mut extent = vec![];
        encode::varint_field(&mut extent, 1, *start_block);
        encode::varint_field(&mut extent, 2, *num_blocks);
        encode::bytes_field(&mut op, 6, &extent);
        encode::bytes_field(&mut partition, 8, &op);
      }

      encode::bytes_field(&mut manifest, 13, &partition);
    }

    let mut payload = vec![];
    payload.extend_from_slice(PAYLOAD_MAGIC);
    payload.extend_from_slice(&2u64.to_be_bytes());
    payload.extend_from_slice(&(manifest.len() as u64).to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&manifest);
    payload.extend_from_slice(blobs);
    payload
  }
}

#[cfg(test)]
mod tests {
  use super::testutil::build_payload;
  use super::*;
  use std::io::Cursor;

  #[test]
  fn empty_manifest_header_parses() {
    let mut payload = vec![];
    payload.extend_from_slice(b"CrAU");
    payload.extend_from_slice(&2u64.to_be_bytes());
    payload.extend_from_slice(&0u64.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());

    let reader = PayloadReader::open(SeekSource::new(Cursor::new(payload))).unwrap();
    assert_eq!(reader.header().data_start_offset, 24);
    assert!(reader.partitions().is_empty());
  }

  #[test]
  fn version_below_two_is_rejected() {
    let mut payload = vec![];
    payload.extend_from_slice(b"CrAU");
    payload.extend_from_slice(&1u64.to_be_bytes());
    payload.extend_from_slice(&0u64.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());

    let res = PayloadReader::open(SeekSource::new(Cursor::new(payload)));
    assert!(matches!(res, Err(Error::UnsupportedVersion(1))));
  }

  #[test]
  fn bad_magic_is_rejected() {
    let res = PayloadReader::open(SeekSource::new(Cursor::new(b"NotAPayload_____________".to_vec())));
    assert!(matches!(res, Err(Error::PayloadMagicMismatch)));
  }

  #[test]
  fn replace_and_zero_extract_without_a_decompressor() {
    let boot_data = vec![0xAA; 4096];
    let payload = build_payload(
      &[
        ("boot", vec![(op_type::REPLACE, boot_data.clone(), 0, 1)]),
        ("vbmeta", vec![(op_type::ZERO, vec![], 0, 2)]),
      ],
      &boot_data,
    );

    let mut reader = PayloadReader::open(SeekSource::new(Cursor::new(payload)))
      .unwrap()
      .without_decompressor();
    let cancel = CancelToken::new();

    let mut boot = Cursor::new(vec![]);
    reader.extract_partition("boot", &mut boot, &cancel, |_, _| {}).unwrap();
    assert_eq!(boot.into_inner(), boot_data);

    let mut vbmeta = Cursor::new(vec![]);
    reader.extract_partition("vbmeta", &mut vbmeta, &cancel, |_, _| {}).unwrap();
    assert_eq!(vbmeta.into_inner(), vec![0u8; 8192]);
  }

  #[test]
  fn compressed_op_without_decompressor_fails_cleanly() {
    let blob = vec![0x42; 64];
    let payload = build_payload(&[("system", vec![(op_type::REPLACE_XZ, blob.clone(), 0, 1)])], &blob);

    let mut reader = PayloadReader::open(SeekSource::new(Cursor::new(payload)))
      .unwrap()
      .without_decompressor();
    let cancel = CancelToken::new();

    let mut out = Cursor::new(vec![]);
    let res = reader.extract_partition("system", &mut out, &cancel, |_, _| {});
    assert!(matches!(res, Err(Error::DecompressorUnavailable(op)) if op == op_type::REPLACE_XZ));
  }

  #[test]
  fn bz_op_round_trips_through_the_standard_decompressor() {
    let plain = vec![0x37; 4096];
    let mut compressed = vec![];
    bzip2::read::BzEncoder::new(&plain[..], bzip2::Compression::default())
      .read_to_end(&mut compressed)
      .unwrap();

    let payload = build_payload(&[("boot", vec![(op_type::REPLACE_BZ, compressed.clone(), 0, 1)])], &compressed);

    let mut reader = PayloadReader::open(SeekSource::new(Cursor::new(payload))).unwrap();
    let cancel = CancelToken::new();

    let mut out = Cursor::new(vec![]);
    reader.extract_partition("boot", &mut out, &cancel, |_, _| {}).unwrap();
    assert_eq!(out.into_inner(), plain);
  }

  #[test]
  fn unknown_op_type_fails_unsupported() {
    let blob = vec![0x42; 64];
    let payload = build_payload(&[("odm", vec![(47, blob.clone(), 0, 1)])], &blob);

    let mut reader = PayloadReader::open(SeekSource::new(Cursor::new(payload))).unwrap();
    let cancel = CancelToken::new();

    let mut out = Cursor::new(vec![]);
    let res = reader.extract_partition("odm", &mut out, &cancel, |_, _| {});
    assert!(matches!(res, Err(Error::UnsupportedOperation(47))));
  }

  #[test]
  fn cancellation_stops_extraction() {
    let boot_data = vec![0xAA; 4096];
    let payload = build_payload(&[("boot", vec![(op_type::REPLACE, boot_data.clone(), 0, 1)])], &boot_data);

    let mut reader = PayloadReader::open(SeekSource::new(Cursor::new(payload))).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let mut out = Cursor::new(vec![]);
    let res = reader.extract_partition("boot", &mut out, &cancel, |_, _| {});
    assert!(matches!(res, Err(Error::Cancelled)));
  }

  #[test]
  fn writes_stay_inside_destination_extents() {
    let data = (0u32..2048).flat_map(|i| (i % 251) .to_le_bytes()[..1].to_vec()).collect::<Vec<u8>>();
    let mut padded = data.clone();
    padded.resize(4096, 0);
    let payload = build_payload(&[("dtbo", vec![(op_type::REPLACE, padded.clone(), 3, 1)])], &padded);

    let mut reader = PayloadReader::open(SeekSource::new(Cursor::new(payload))).unwrap();
    let cancel = CancelToken::new();

    let mut out = Cursor::new(vec![0u8; 5 * 4096]);
    reader.extract_partition("dtbo", &mut out, &cancel, |_, _| {}).unwrap();

    let result = out.into_inner();
    assert!(result[..3 * 4096].iter().all(|&b| b == 0));
    assert_eq!(&result[3 * 4096..4 * 4096], &padded[..]);
    assert!(result[4 * 4096..].iter().all(|&b| b == 0));
  }
}
