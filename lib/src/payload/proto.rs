//! Minimal protobuf wire-format reader for the update_engine manifest.
//!
//! Only what `DeltaArchiveManifest` needs: varints, the three wire types the
//! schema uses, and skipping of unknown fields. Field numbers follow the
//! published update_metadata.proto.

use crate::{Error, Result};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Cursor over a protobuf-encoded buffer.
pub struct WireReader<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> WireReader<'a> {
  pub fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  pub fn is_empty(&self) -> bool {
    self.pos >= self.buf.len()
  }

  fn malformed(what: &str) -> Error {
    Error::ManifestMalformed(what.to_string())
  }

  pub fn read_varint(&mut self) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
      let byte = *self.buf.get(self.pos).ok_or_else(|| Self::malformed("varint truncated"))?;
      self.pos += 1;
      if shift >= 64 {
        return Err(Self::malformed("varint overflow"));
      }
      value |= ((byte & 0x7f) as u64) << shift;
      if byte & 0x80 == 0 {
        return Ok(value);
      }
      shift += 7;
    }
  }

  /// Read a field tag, returning `(field_number, wire_type)`.
  pub fn read_tag(&mut self) -> Result<(u64, u8)> {
    let tag = self.read_varint()?;
    Ok((tag >> 3, (tag & 0x7) as u8))
  }

  pub fn read_len_delimited(&mut self) -> Result<&'a [u8]> {
    let len = self.read_varint()? as usize;
    let end = self
      .pos
      .checked_add(len)
      .filter(|&end| end <= self.buf.len())
      .ok_or_else(|| Self::malformed("length-delimited field truncated"))?;
    let slice = &self.buf[self.pos..end];
    self.pos = end;
    Ok(slice)
  }

  pub fn skip(&mut self, wire_type: u8) -> Result<()> {
    match wire_type {
      WIRE_VARINT => {
        self.read_varint()?;
      }
      WIRE_FIXED64 => {
        self.pos = self
          .pos
          .checked_add(8)
          .filter(|&end| end <= self.buf.len())
          .ok_or_else(|| Self::malformed("fixed64 truncated"))?;
      }
      WIRE_LEN => {
        self.read_len_delimited()?;
      }
      WIRE_FIXED32 => {
        self.pos = self
          .pos
          .checked_add(4)
          .filter(|&end| end <= self.buf.len())
          .ok_or_else(|| Self::malformed("fixed32 truncated"))?;
      }
      other => return Err(Self::malformed(&format!("unsupported wire type {other}"))),
    }
    Ok(())
  }
}

/// A destination extent of an install operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Extent {
  pub start_block: u64,
  pub num_blocks: u64,
}

/// One install operation of a partition update.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstallOp {
  pub op_type: u32,
  pub data_offset: u64,
  pub data_length: u64,
  pub dst_extents: Vec<Extent>,
}

pub mod op_type {
  pub const REPLACE: u32 = 0;
  pub const REPLACE_BZ: u32 = 1;
  pub const ZERO: u32 = 6;
  pub const REPLACE_XZ: u32 = 8;
}

/// One `PartitionUpdate` entry.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, serde::Serialize)]
pub struct PartitionUpdate {
  pub name: String,
  pub size: u64,
  #[serde(serialize_with = "ser_hash", rename = "sha256")]
  pub hash: Option<Vec<u8>>,
  #[serde(skip)]
  pub operations: Vec<InstallOp>,
}

fn ser_hash<S: serde::Serializer>(hash: &Option<Vec<u8>>, s: S) -> std::result::Result<S::Ok, S::Error> {
  match hash {
    Some(bytes) => s.serialize_some(&hex::encode(bytes)),
    None => s.serialize_none(),
  }
}

/// Decoded `DeltaArchiveManifest`, limited to the fields extraction needs.
#[derive(Debug, Clone)]
pub struct Manifest {
  pub block_size: u32,
  pub signatures_offset: Option<u64>,
  pub signatures_size: Option<u64>,
  pub partitions: Vec<PartitionUpdate>,
}

impl Manifest {
  /// Decode a serialized manifest, skipping unknown fields by wire type.
  pub fn parse(buf: &[u8]) -> Result<Self> {
    let mut reader = WireReader::new(buf);
    let mut manifest = Manifest {
      block_size: 4096,
      signatures_offset: None,
      signatures_size: None,
      partitions: vec![],
    };

    while !reader.is_empty() {
      let (field, wire) = reader.read_tag()?;
      match field {
        3 => manifest.block_size = reader.read_varint()? as u32,
        4 => manifest.signatures_offset = Some(reader.read_varint()?),
        5 => manifest.signatures_size = Some(reader.read_varint()?),
        13 => {
          let bytes = reader.read_len_delimited()?;
          manifest.partitions.push(parse_partition(bytes)?);
        }
        _ => reader.skip(wire)?,
      }
    }

    tracing::debug!(
      "parsed manifest: block_size {} partitions {}",
      manifest.block_size,
      manifest.partitions.len()
    );
    Ok(manifest)
  }
}

fn parse_partition(buf: &[u8]) -> Result<PartitionUpdate> {
  let mut reader = WireReader::new(buf);
  let mut partition = PartitionUpdate {
    name: String::new(),
    size: 0,
    hash: None,
    operations: vec![],
  };

  while !reader.is_empty() {
    let (field, wire) = reader.read_tag()?;
    match field {
      1 => partition.name = String::from_utf8(reader.read_len_delimited()?.to_vec())?,
      7 => {
        let (size, hash) = parse_partition_info(reader.read_len_delimited()?)?;
        partition.size = size;
        partition.hash = hash;
      }
      8 => {
        let bytes = reader.read_len_delimited()?;
        partition.operations.push(parse_operation(bytes)?);
      }
      _ => reader.skip(wire)?,
    }
  }

  Ok(partition)
}

fn parse_partition_info(buf: &[u8]) -> Result<(u64, Option<Vec<u8>>)> {
  let mut reader = WireReader::new(buf);
  let mut size = 0;
  let mut hash = None;

  while !reader.is_empty() {
    let (field, wire) = reader.read_tag()?;
    match field {
      1 => size = reader.read_varint()?,
      2 => hash = Some(reader.read_len_delimited()?.to_vec()),
      _ => reader.skip(wire)?,
    }
  }

  Ok((size, hash))
}

fn parse_operation(buf: &[u8]) -> Result<InstallOp> {
  let mut reader = WireReader::new(buf);
  let mut op = InstallOp {
    op_type: 0,
    data_offset: 0,
    data_length: 0,
    dst_extents: vec![],
  };

  while !reader.is_empty() {
    let (field, wire) = reader.read_tag()?;
    match field {
      1 => op.op_type = reader.read_varint()? as u32,
      2 => op.data_offset = reader.read_varint()?,
      3 => op.data_length = reader.read_varint()?,
      6 => {
        let bytes = reader.read_len_delimited()?;
        op.dst_extents.push(parse_extent(bytes)?);
      }
      _ => reader.skip(wire)?,
    }
  }

  Ok(op)
}

fn parse_extent(buf: &[u8]) -> Result<Extent> {
  let mut reader = WireReader::new(buf);
  let mut extent = Extent {
    start_block: 0,
    num_blocks: 0,
  };

  while !reader.is_empty() {
    let (field, wire) = reader.read_tag()?;
    match field {
      1 => extent.start_block = reader.read_varint()?,
      2 => extent.num_blocks = reader.read_varint()?,
      _ => reader.skip(wire)?,
    }
  }

  Ok(extent)
}

#[cfg(test)]
pub(crate) mod encode {
  //! Tiny protobuf encoder used by the payload tests to build manifests.

  pub fn varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
      let byte = (value & 0x7f) as u8;
      value >>= 7;
      if value == 0 {
        out.push(byte);
        break;
      }
      out.push(byte | 0x80);
    }
  }

  pub fn tag(out: &mut Vec<u8>, field: u64, wire: u8) {
    varint(out, (field << 3) | wire as u64);
  }

  pub fn varint_field(out: &mut Vec<u8>, field: u64, value: u64) {
    tag(out, field, 0);
    varint(out, value);
  }

  pub fn bytes_field(out: &mut Vec<u8>, field: u64, bytes: &[u8]) {
    tag(out, field, 2);
    varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn varint_decoding() {
    let mut reader = WireReader::new(&[0x96, 0x01]);
    assert_eq!(reader.read_varint().unwrap(), 150);

    let mut reader = WireReader::new(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
    assert_eq!(reader.read_varint().unwrap(), u64::MAX);
  }

  #[test]
  fn truncated_varint_is_an_error() {
    let mut reader = WireReader::new(&[0x80]);
    assert!(reader.read_varint().is_err());
  }

  #[test]
  fn manifest_with_unknown_fields_parses() {
    let mut buf = vec![];
    encode::varint_field(&mut buf, 3, 8192); // block_size
    encode::varint_field(&mut buf, 99, 7); // unknown varint
    encode::bytes_field(&mut buf, 98, b"ignored"); // unknown bytes

    let mut partition = vec![];
    encode::bytes_field(&mut partition, 1, b"boot");
    let mut info = vec![];
    encode::varint_field(&mut info, 1, 4096);
    encode::bytes_field(&mut partition, 7, &info);

    let mut op = vec![];
    encode::varint_field(&mut op, 1, op_type::REPLACE as u64);
    encode::varint_field(&mut op, 2, 0);
    encode::varint_field(&mut op, 3, 4096);
    let mut extent = vec![];
    encode::varint_field(&mut extent, 1, 0);
    encode::varint_field(&mut extent, 2, 1);
    encode::bytes_field(&mut op, 6, &extent);
    encode::bytes_field(&mut partition, 8, &op);

    encode::bytes_field(&mut buf, 13, &partition);

    let manifest = Manifest::parse(&buf).unwrap();
    assert_eq!(manifest.block_size, 8192);
    assert_eq!(manifest.partitions.len(), 1);

    let boot = &manifest.partitions[0];
    assert_eq!(boot.name, "boot");
    assert_eq!(boot.size, 4096);
    assert_eq!(boot.operations.len(), 1);
    assert_eq!(boot.operations[0].op_type, op_type::REPLACE);
    assert_eq!(boot.operations[0].dst_extents, vec![Extent { start_block: 0, num_blocks: 1 }]);
  }

  #[test]
  fn empty_manifest_defaults_block_size() {
    let manifest = Manifest::parse(&[]).unwrap();
    assert_eq!(manifest.block_size, 4096);
    assert!(manifest.partitions.is_empty());
  }
}
