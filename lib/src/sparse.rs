//! Android Sparse image codec.
//!
//! Implements the `0xED26FF3A` chunked format: a 28-byte file header
//! followed by chunks of RAW, FILL, DONT_CARE, or CRC32 type, each with a
//! 12-byte header. All header fields are little-endian.
//!
//! [`TransferChunker`] splits any image, sparse or raw, into a finite,
//! restartable sequence of standalone sparse images no larger than a byte
//! budget, which is what the fastboot engine feeds through `download:`.

use std::io::{Read, Seek, SeekFrom, Write};

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::{Error, Result};

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 0;
pub const FILE_HEADER_SIZE: usize = 28;
pub const CHUNK_HEADER_SIZE: usize = 12;

const CHUNK_TYPE_RAW: u16 = 0xCAC1;
const CHUNK_TYPE_FILL: u16 = 0xCAC2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Parsed 28-byte sparse file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
  pub block_size: u32,
  pub total_blocks: u32,
  pub total_chunks: u32,
  pub checksum: u32,
}

impl SparseHeader {
  pub fn parse(buf: &[u8]) -> Result<Self> {
    if buf.len() < FILE_HEADER_SIZE {
      return Err(Error::SparseInvalid("header truncated".into()));
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into()?);
    if magic != SPARSE_MAGIC {
      return Err(Error::SparseInvalid(format!("bad magic {magic:#010x}")));
    }
    let major = u16::from_le_bytes(buf[4..6].try_into()?);
    if major != MAJOR_VERSION {
      return Err(Error::SparseInvalid(format!("unsupported major version {major}")));
    }
    let file_hdr_size = u16::from_le_bytes(buf[8..10].try_into()?);
    let chunk_hdr_size = u16::from_le_bytes(buf[10..12].try_into()?);
    if file_hdr_size as usize != FILE_HEADER_SIZE || chunk_hdr_size as usize != CHUNK_HEADER_SIZE {
      return Err(Error::SparseInvalid(format!(
        "unexpected header sizes {file_hdr_size}/{chunk_hdr_size}"
      )));
    }
    let block_size = u32::from_le_bytes(buf[12..16].try_into()?);
    if block_size == 0 || block_size % 4 != 0 {
      return Err(Error::SparseInvalid(format!("bad block size {block_size}")));
    }

    Ok(Self {
      block_size,
      total_blocks: u32::from_le_bytes(buf[16..20].try_into()?),
      total_chunks: u32::from_le_bytes(buf[20..24].try_into()?),
      checksum: u32::from_le_bytes(buf[24..28].try_into()?),
    })
  }

  pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    buf[0..4].copy_from_slice(&SPARSE_MAGIC.to_le_bytes());
    buf[4..6].copy_from_slice(&MAJOR_VERSION.to_le_bytes());
    buf[6..8].copy_from_slice(&MINOR_VERSION.to_le_bytes());
    buf[8..10].copy_from_slice(&(FILE_HEADER_SIZE as u16).to_le_bytes());
    buf[10..12].copy_from_slice(&(CHUNK_HEADER_SIZE as u16).to_le_bytes());
    buf[12..16].copy_from_slice(&self.block_size.to_le_bytes());
    buf[16..20].copy_from_slice(&self.total_blocks.to_le_bytes());
    buf[20..24].copy_from_slice(&self.total_chunks.to_le_bytes());
    buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
    buf
  }
}

/// One decoded chunk, paired with the block count it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
  /// Verbatim payload of `blocks * block_size` bytes.
  Raw(Vec<u8>),
  /// A 4-byte pattern repeated across the covered blocks.
  Fill(u32),
  /// Blocks whose content the image does not specify.
  DontCare,
  /// Running CRC32 of the image decoded so far. Covers zero blocks.
  Crc32(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseChunk {
  pub blocks: u32,
  pub chunk: Chunk,
}

/// Whether `prefix` begins with the sparse magic.
pub fn is_sparse(prefix: &[u8]) -> bool {
  prefix.len() >= 4 && u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) == SPARSE_MAGIC
}

/// Streaming reader over a sparse image.
///
/// The reader is restartable: [`SparseReader::rewind`] seeks back to the
/// first chunk and iteration starts over.
pub struct SparseReader<R: Read + Seek> {
  inner: R,
  header: SparseHeader,
  chunks_read: u32,
}

impl<R: Read + Seek> SparseReader<R> {
  pub fn open(mut inner: R) -> Result<Self> {
    inner.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; FILE_HEADER_SIZE];
    inner.read_exact(&mut buf)?;
    let header = SparseHeader::parse(&buf)?;

    Ok(Self {
      inner,
      header,
      chunks_read: 0,
    })
  }

  pub fn header(&self) -> &SparseHeader {
    &self.header
  }

  pub fn rewind(&mut self) -> Result<()> {
    self.inner.seek(SeekFrom::Start(FILE_HEADER_SIZE as u64))?;
    self.chunks_read = 0;
    Ok(())
  }

  /// Decode the next chunk, or `None` after the last one.
  pub fn next_chunk(&mut self) -> Result<Option<SparseChunk>> {
    if self.chunks_read >= self.header.total_chunks {
      return Ok(None);
    }

    let mut hdr = [0u8; CHUNK_HEADER_SIZE];
    self.inner.read_exact(&mut hdr)?;
    let chunk_type = u16::from_le_bytes(hdr[0..2].try_into()?);
    let blocks = u32::from_le_bytes(hdr[4..8].try_into()?);
    let total_size = u32::from_le_bytes(hdr[8..12].try_into()?) as usize;
    let payload_size = total_size
      .checked_sub(CHUNK_HEADER_SIZE)
      .ok_or_else(|| Error::SparseInvalid(format!("chunk total_size {total_size} below header size")))?;

    let block_bytes = blocks as u64 * self.header.block_size as u64;
    let chunk = match chunk_type {
      CHUNK_TYPE_RAW => {
        if payload_size as u64 != block_bytes {
          return Err(Error::SparseInvalid(format!(
            "raw chunk payload {payload_size} != {block_bytes} covered bytes"
          )));
        }
        let mut data = vec![0u8; payload_size];
        self.inner.read_exact(&mut data)?;
        Chunk::Raw(data)
      }
      CHUNK_TYPE_FILL => {
        if payload_size != 4 {
          return Err(Error::SparseInvalid(format!("fill chunk payload {payload_size} != 4")));
        }
        let mut pattern = [0u8; 4];
        self.inner.read_exact(&mut pattern)?;
        Chunk::Fill(u32::from_le_bytes(pattern))
      }
      CHUNK_TYPE_DONT_CARE => {
        if payload_size != 0 {
          return Err(Error::SparseInvalid(format!(
            "dont-care chunk carries {payload_size} payload bytes"
          )));
        }
        Chunk::DontCare
      }
      CHUNK_TYPE_CRC32 => {
        if payload_size != 4 {
          return Err(Error::SparseInvalid(format!("crc chunk payload {payload_size} != 4")));
        }
        let mut value = [0u8; 4];
        self.inner.read_exact(&mut value)?;
        Chunk::Crc32(u32::from_le_bytes(value))
      }
      other => return Err(Error::SparseInvalid(format!("unknown chunk type {other:#06x}"))),
    };

    self.chunks_read += 1;
    Ok(Some(SparseChunk { blocks, chunk }))
  }

  /// Materialise the image into `out`. DONT_CARE regions are written as
  /// zeros. Returns the number of bytes written.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip_all))]
  pub fn unsparse_to<W: Write>(&mut self, out: &mut W) -> Result<u64> {
    self.rewind()?;

    let block_size = self.header.block_size as usize;
    let mut written: u64 = 0;
    let mut blocks_seen: u64 = 0;
    let mut digest = CRC32.digest();

    while let Some(SparseChunk { blocks, chunk }) = self.next_chunk()? {
      blocks_seen += blocks as u64;
      match chunk {
        Chunk::Raw(data) => {
          digest.update(&data);
          out.write_all(&data)?;
          written += data.len() as u64;
        }
        Chunk::Fill(pattern) => {
          let bytes = pattern.to_le_bytes();
          let mut block = Vec::with_capacity(block_size);
          while block.len() < block_size {
            block.extend_from_slice(&bytes);
          }
          for _ in 0..blocks {
            digest.update(&block);
            out.write_all(&block)?;
            written += block_size as u64;
          }
        }
        Chunk::DontCare => {
          let zeros = vec![0u8; block_size];
          for _ in 0..blocks {
            digest.update(&zeros);
            out.write_all(&zeros)?;
            written += block_size as u64;
          }
        }
        Chunk::Crc32(expected) => {
          let running = digest.clone().finalize();
          if expected != 0 && running != expected {
            tracing::warn!(
              "sparse crc mismatch: image declares {:#010x}, computed {:#010x}",
              expected,
              running
            );
          }
        }
      }
    }

    if blocks_seen != self.header.total_blocks as u64 {
      return Err(Error::SparseInvalid(format!(
        "chunks cover {blocks_seen} blocks, header declares {}",
        self.header.total_blocks
      )));
    }

    tracing::debug!("unsparsed {} bytes across {} chunks", written, self.header.total_chunks);
    Ok(written)
  }
}

/// Incremental sparse image writer.
///
/// Chunks are appended in order; [`SparseWriter::finish`] back-patches the
/// block and chunk totals into the header.
pub struct SparseWriter<W: Write + Seek> {
  out: W,
  block_size: u32,
  total_blocks: u32,
  total_chunks: u32,
}

impl<W: Write + Seek> SparseWriter<W> {
  pub fn new(mut out: W, block_size: u32) -> Result<Self> {
    if block_size == 0 || block_size % 4 != 0 {
      return Err(Error::SparseInvalid(format!("bad block size {block_size}")));
    }
    // placeholder header, patched in finish()
    out.seek(SeekFrom::Start(0))?;
    let header = SparseHeader {
      block_size,
      total_blocks: 0,
      total_chunks: 0,
      checksum: 0,
    };
    out.write_all(&header.encode())?;

    Ok(Self {
      out,
      block_size,
      total_blocks: 0,
      total_chunks: 0,
    })
  }

  fn chunk_header(&mut self, chunk_type: u16, blocks: u32, payload: usize) -> Result<()> {
    let mut hdr = [0u8; CHUNK_HEADER_SIZE];
    hdr[0..2].copy_from_slice(&chunk_type.to_le_bytes());
    hdr[4..8].copy_from_slice(&blocks.to_le_bytes());
    hdr[8..12].copy_from_slice(&((CHUNK_HEADER_SIZE + payload) as u32).to_le_bytes());
    self.out.write_all(&hdr)?;
    self.total_blocks = self
      .total_blocks
      .checked_add(blocks)
      .ok_or_else(|| Error::SparseInvalid("image exceeds 2^32 blocks".into()))?;
    self.total_chunks += 1;
    Ok(())
  }

  /// Append a RAW chunk; `data` must be a whole number of blocks.
  pub fn raw(&mut self, data: &[u8]) -> Result<()> {
    if data.is_empty() || data.len() % self.block_size as usize != 0 {
      return Err(Error::SparseInvalid(format!(
        "raw payload {} is not a multiple of the block size",
        data.len()
      )));
    }
    let blocks = (data.len() / self.block_size as usize) as u32;
    self.chunk_header(CHUNK_TYPE_RAW, blocks, data.len())?;
    self.out.write_all(data)?;
    Ok(())
  }

  pub fn fill(&mut self, pattern: u32, blocks: u32) -> Result<()> {
    self.chunk_header(CHUNK_TYPE_FILL, blocks, 4)?;
    self.out.write_all(&pattern.to_le_bytes())?;
    Ok(())
  }

  pub fn dont_care(&mut self, blocks: u32) -> Result<()> {
    self.chunk_header(CHUNK_TYPE_DONT_CARE, blocks, 0)
  }

  pub fn crc32(&mut self, value: u32) -> Result<()> {
    self.chunk_header(CHUNK_TYPE_CRC32, 0, 4)?;
    self.out.write_all(&value.to_le_bytes())?;
    Ok(())
  }

  /// Patch the header totals and return the inner writer.
  pub fn finish(mut self) -> Result<W> {
    let header = SparseHeader {
      block_size: self.block_size,
      total_blocks: self.total_blocks,
      total_chunks: self.total_chunks,
      checksum: 0,
    };
    self.out.seek(SeekFrom::Start(0))?;
    self.out.write_all(&header.encode())?;
    self.out.seek(SeekFrom::End(0))?;
    Ok(self.out)
  }
}

/// One piece of a budgeted transfer: a standalone sparse image.
#[derive(Debug, Clone)]
pub struct TransferChunk {
  pub index: usize,
  pub total: usize,
  /// Size of `data` in bytes, always <= the chunker budget.
  pub size: usize,
  pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
enum PlanKind {
  Raw { file_offset: u64 },
  Fill(u32),
  DontCare,
  Crc32(u32),
}

#[derive(Debug, Clone, Copy)]
struct PlanEntry {
  blocks: u32,
  kind: PlanKind,
}

impl PlanEntry {
  fn payload_size(&self, block_size: u32) -> usize {
    match self.kind {
      PlanKind::Raw { .. } => self.blocks as usize * block_size as usize,
      PlanKind::Fill(_) | PlanKind::Crc32(_) => 4,
      PlanKind::DontCare => 0,
    }
  }
}

/// Splits an image into standalone sparse pieces bounded by a byte budget.
///
/// The sequence is finite and restartable ([`TransferChunker::reset`]). A
/// non-sparse source is split into raw pieces under synthetic
/// single-RAW-chunk headers; the device reassembles by partition offset.
pub struct TransferChunker<R: Read + Seek> {
  source: R,
  block_size: u32,
  pieces: Vec<Vec<PlanEntry>>,
  cursor: usize,
}

impl<R: Read + Seek> TransferChunker<R> {
  /// Build the split plan for `source` under `budget` bytes per piece.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(source)))]
  pub fn new(mut source: R, budget: usize) -> Result<Self> {
    let mut magic = [0u8; 4];
    source.seek(SeekFrom::Start(0))?;
    let sparse = match source.read_exact(&mut magic) {
      Ok(()) => is_sparse(&magic),
      Err(_) => false,
    };

    if sparse {
      let reader = SparseReader::open(source)?;
      Self::plan_sparse(reader, budget)
    } else {
      let len = source.seek(SeekFrom::End(0))?;
      Self::plan_raw(source, len, budget)
    }
  }

  fn min_budget(block_size: u32) -> usize {
    FILE_HEADER_SIZE + CHUNK_HEADER_SIZE + block_size as usize
  }

  fn plan_raw(source: R, len: u64, budget: usize) -> Result<Self> {
    let block_size: u32 = 4096;
    if budget < Self::min_budget(block_size) {
      return Err(Error::SparseInvalid(format!("budget {budget} below one chunk")));
    }

    // largest whole-block payload that still fits under the budget
    let overhead = FILE_HEADER_SIZE + CHUNK_HEADER_SIZE;
    let payload_budget = (budget - overhead) / block_size as usize * block_size as usize;

    let mut pieces = vec![];
    let mut offset: u64 = 0;
    while offset < len {
      let piece_len = (len - offset).min(payload_budget as u64);
      let blocks = piece_len.div_ceil(block_size as u64) as u32;
      pieces.push(vec![PlanEntry {
        blocks,
        kind: PlanKind::Raw { file_offset: offset },
      }]);
      offset += piece_len;
    }

    tracing::debug!("planned {} raw pieces for {} bytes", pieces.len(), len);
    Ok(Self {
      source,
      block_size,
      pieces,
      cursor: 0,
    })
  }

  fn plan_sparse(mut reader: SparseReader<R>, budget: usize) -> Result<Self> {
    let block_size = reader.header().block_size;
    if budget < Self::min_budget(block_size) {
      return Err(Error::SparseInvalid(format!("budget {budget} below one chunk")));
    }

    reader.rewind()?;
    let mut pieces: Vec<Vec<PlanEntry>> = vec![];
    let mut current: Vec<PlanEntry> = vec![];
    let mut current_size = FILE_HEADER_SIZE;

    let mut push_entry =
      |entry: PlanEntry, current: &mut Vec<PlanEntry>, current_size: &mut usize, pieces: &mut Vec<Vec<PlanEntry>>| {
        let entry_size = CHUNK_HEADER_SIZE + entry.payload_size(block_size);
        if *current_size + entry_size > budget && !current.is_empty() {
          pieces.push(std::mem::take(current));
          *current_size = FILE_HEADER_SIZE;
        }
        current.push(entry);
        *current_size += entry_size;
      };

    // sizing pass: walk chunk headers, skipping payloads
    loop {
      let position = reader.inner.stream_position()?;
      let mut hdr = [0u8; CHUNK_HEADER_SIZE];
      if reader.chunks_read >= reader.header.total_chunks {
        break;
      }
      reader.inner.read_exact(&mut hdr)?;
      reader.chunks_read += 1;

      let chunk_type = u16::from_le_bytes(hdr[0..2].try_into()?);
      let blocks = u32::from_le_bytes(hdr[4..8].try_into()?);
      let total_size = u32::from_le_bytes(hdr[8..12].try_into()?) as u64;
      let payload_offset = position + CHUNK_HEADER_SIZE as u64;

      match chunk_type {
        CHUNK_TYPE_RAW => {
          // split oversized raw chunks along block boundaries
          let max_blocks_per_piece = ((budget - FILE_HEADER_SIZE - CHUNK_HEADER_SIZE) / block_size as usize) as u32;
          let mut remaining = blocks;
          let mut offset = payload_offset;
          while remaining > 0 {
            let take = remaining.min(max_blocks_per_piece);
            push_entry(
              PlanEntry {
                blocks: take,
                kind: PlanKind::Raw { file_offset: offset },
              },
              &mut current,
              &mut current_size,
              &mut pieces,
            );
            offset += take as u64 * block_size as u64;
            remaining -= take;
          }
        }
        CHUNK_TYPE_FILL => {
          let mut pattern = [0u8; 4];
          reader.inner.read_exact(&mut pattern)?;
          push_entry(
            PlanEntry {
              blocks,
              kind: PlanKind::Fill(u32::from_le_bytes(pattern)),
            },
            &mut current,
            &mut current_size,
            &mut pieces,
          );
          continue;
        }
        CHUNK_TYPE_DONT_CARE => {
          push_entry(
            PlanEntry {
              blocks,
              kind: PlanKind::DontCare,
            },
            &mut current,
            &mut current_size,
            &mut pieces,
          );
        }
        CHUNK_TYPE_CRC32 => {
          let mut value = [0u8; 4];
          reader.inner.read_exact(&mut value)?;
          push_entry(
            PlanEntry {
              blocks: 0,
              kind: PlanKind::Crc32(u32::from_le_bytes(value)),
            },
            &mut current,
            &mut current_size,
            &mut pieces,
          );
          continue;
        }
        other => return Err(Error::SparseInvalid(format!("unknown chunk type {other:#06x}"))),
      }

      reader.inner.seek(SeekFrom::Start(position + total_size))?;
    }

    if !current.is_empty() {
      pieces.push(current);
    }

    tracing::debug!("planned {} sparse pieces", pieces.len());
    Ok(Self {
      source: reader.inner,
      block_size,
      pieces,
      cursor: 0,
    })
  }

  /// Number of pieces the plan produces.
  pub fn total(&self) -> usize {
    self.pieces.len()
  }

  /// Sum of the piece sizes in bytes (headers included).
  pub fn total_transfer_bytes(&self) -> u64 {
    self
      .pieces
      .iter()
      .map(|piece| {
        FILE_HEADER_SIZE as u64
          + piece
            .iter()
            .map(|e| (CHUNK_HEADER_SIZE + e.payload_size(self.block_size)) as u64)
            .sum::<u64>()
      })
      .sum()
  }

  /// Restart iteration from the first piece.
  pub fn reset(&mut self) {
    self.cursor = 0;
  }

  /// Materialise the next piece, or `None` after the last.
  pub fn next_chunk(&mut self) -> Result<Option<TransferChunk>> {
    if self.cursor >= self.pieces.len() {
      return Ok(None);
    }
    let entries = self.pieces[self.cursor].clone();

    let total_blocks: u64 = entries.iter().map(|e| e.blocks as u64).sum();
    let header = SparseHeader {
      block_size: self.block_size,
      total_blocks: total_blocks as u32,
      total_chunks: entries.len() as u32,
      checksum: 0,
    };

    let mut data = Vec::with_capacity(
      FILE_HEADER_SIZE
        + entries
          .iter()
          .map(|e| CHUNK_HEADER_SIZE + e.payload_size(self.block_size))
          .sum::<usize>(),
    );
    data.extend_from_slice(&header.encode());

    for entry in &entries {
      let payload_size = entry.payload_size(self.block_size);
      let (chunk_type, blocks) = match entry.kind {
        PlanKind::Raw { .. } => (CHUNK_TYPE_RAW, entry.blocks),
        PlanKind::Fill(_) => (CHUNK_TYPE_FILL, entry.blocks),
        PlanKind::DontCare => (CHUNK_TYPE_DONT_CARE, entry.blocks),
        PlanKind::Crc32(_) => (CHUNK_TYPE_CRC32, 0),
      };
      let mut hdr = [0u8; CHUNK_HEADER_SIZE];
      hdr[0..2].copy_from_slice(&chunk_type.to_le_bytes());
      hdr[4..8].copy_from_slice(&blocks.to_le_bytes());
      hdr[8..12].copy_from_slice(&((CHUNK_HEADER_SIZE + payload_size) as u32).to_le_bytes());
      data.extend_from_slice(&hdr);

      match entry.kind {
        PlanKind::Raw { file_offset } => {
          let start = data.len();
          data.resize(start + payload_size, 0);
          self.source.seek(SeekFrom::Start(file_offset))?;
          // the final raw piece of an unaligned image is zero-padded to the
          // block boundary; read what the file has, keep the rest zero
          let mut filled = 0;
          while filled < payload_size {
            let n = self.source.read(&mut data[start + filled..])?;
            if n == 0 {
              break;
            }
            filled += n;
          }
        }
        PlanKind::Fill(pattern) => data.extend_from_slice(&pattern.to_le_bytes()),
        PlanKind::DontCare => {}
        PlanKind::Crc32(value) => data.extend_from_slice(&value.to_le_bytes()),
      }
    }

    let chunk = TransferChunk {
      index: self.cursor,
      total: self.pieces.len(),
      size: data.len(),
      data,
    };
    self.cursor += 1;
    Ok(Some(chunk))
  }
}
