//! Remote OTA payload service.
//!
//! Composes the HTTP range fetcher with the ZIP locator and the payload
//! reader: given the URL of an OTA archive, the partition list is available
//! after a few kilobytes of traffic, and extracting a partition downloads
//! roughly that partition's bytes and nothing else.

pub mod http;
pub mod zip;

use std::{
  io::{Seek, Write},
  path::Path,
  time::{Instant, SystemTime},
};

use tempfile::NamedTempFile;

use crate::{
  payload::{ByteSource, OffsetSource, PartitionUpdate, PayloadReader},
  transport::CancelToken,
  Error, Result,
};

use http::RangeFetcher;
use zip::{locate_payload, PayloadEntry};

/// [`ByteSource`] over HTTP range requests.
pub struct HttpSource {
  fetcher: RangeFetcher,
}

impl HttpSource {
  pub fn new(fetcher: RangeFetcher) -> Self {
    Self { fetcher }
  }
}

impl ByteSource for HttpSource {
  fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
    if len == 0 {
      return Ok(vec![]);
    }
    self.fetcher.fetch_range(offset, offset + len as u64 - 1)
  }
}

/// Result of a user-supplied flash callback.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FlashReport {
  pub success: bool,
  pub bytes_written: u64,
  pub elapsed_seconds: f64,
}

/// A remote OTA archive with its `payload.bin` located and parsed.
pub struct RemotePayload {
  reader: PayloadReader<OffsetSource<HttpSource>>,
  entry: PayloadEntry,
  expires: Option<SystemTime>,
}

impl RemotePayload {
  /// Locate `payload.bin` inside the archive at `url` and parse its
  /// manifest, using only ranged reads.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug"))]
  pub fn open(url: &str) -> Result<Self> {
    let mut fetcher = RangeFetcher::new(url)?;
    let expires = fetcher.expires_at();

    let total_len = fetcher.content_length()?;
    tracing::info!("remote archive is {} bytes", total_len);

    let mut source = HttpSource::new(fetcher);
    let entry = locate_payload(&mut source, total_len)?;

    let reader = PayloadReader::open(OffsetSource::new(source, entry.data_offset))?;
    Ok(Self {
      reader,
      entry,
      expires,
    })
  }

  /// Expiry of the signed URL, if one was present.
  pub fn expires_at(&self) -> Option<SystemTime> {
    self.expires
  }

  /// Size of the `payload.bin` entry inside the archive.
  pub fn payload_size(&self) -> u64 {
    self.entry.size
  }

  pub fn partitions(&self) -> &[PartitionUpdate] {
    self.reader.partitions()
  }

  pub fn block_size(&self) -> u32 {
    self.reader.block_size()
  }

  /// Stream-extract one partition into `out`.
  pub fn extract_partition<W: Write + Seek>(
    &mut self,
    name: &str,
    out: &mut W,
    cancel: &CancelToken,
    progress: impl FnMut(u64, u64),
  ) -> Result<u64> {
    self.reader.extract_partition(name, out, cancel, progress)
  }

  /// Stream one partition into a temporary file and hand the file to
  /// `flash`. The temporary file is removed on every exit path.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "debug", skip(self, cancel, progress, flash)))]
  pub fn flash_partition(
    &mut self,
    name: &str,
    cancel: &CancelToken,
    progress: impl FnMut(u64, u64),
    flash: impl FnOnce(&Path) -> Result<FlashReport>,
  ) -> Result<FlashReport> {
    // NamedTempFile unlinks itself on drop, covering the error paths too
    let mut staging = NamedTempFile::new()?;
    tracing::debug!("staging {} to {}", name, staging.path().display());

    let started = Instant::now();
    let bytes = self.extract_partition(name, staging.as_file_mut(), cancel, progress)?;
    staging.as_file_mut().flush()?;

    tracing::info!(
      "staged {} ({} bytes in {:.1}s), invoking flash callback",
      name,
      bytes,
      started.elapsed().as_secs_f64()
    );

    let report = flash(staging.path())?;
    if !report.success {
      return Err(Error::DeviceFail(format!("flash callback reported failure for {name}")));
    }
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::payload::{op_type, testutil::build_payload};
  use std::{
    io::{Cursor, Read as _, Write as _},
    net::TcpListener,
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
  };

  /// Minimal loopback HTTP server. Serves `data`, honouring `Range:` when
  /// `ranged` is true, and counts bytes actually shipped.
  fn serve(data: Vec<u8>, ranged: bool) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    let shipped = Arc::new(AtomicUsize::new(0));
    let counter = shipped.clone();

    std::thread::spawn(move || {
      for stream in listener.incoming() {
        let Ok(mut stream) = stream else { continue };
        let data = data.clone();
        let counter = counter.clone();

        // one request per connection; Connection: close keeps it simple
        let mut buf = vec![0u8; 8192];
        let mut request = vec![];
        loop {
          match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
              request.extend_from_slice(&buf[..n]);
              if request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
              }
            }
            Err(_) => break,
          }
        }

        let text = String::from_utf8_lossy(&request);
        let range = text
          .lines()
          .find(|l| l.to_ascii_lowercase().starts_with("range:"))
          .and_then(|l| l.split_once('=').map(|(_, r)| r.trim().to_string()))
          .and_then(|r| {
            let (start, end) = r.split_once('-')?;
            Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?))
          });

        let response = match range {
          Some((start, end)) if ranged && start < data.len() => {
            let end = end.min(data.len() - 1);
            let body = &data[start..=end];
            counter.fetch_add(body.len(), Ordering::SeqCst);
            let mut r = format!(
              "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {start}-{end}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
              data.len(),
              body.len()
            )
            .into_bytes();
            r.extend_from_slice(body);
            r
          }
          _ => {
            counter.fetch_add(data.len(), Ordering::SeqCst);
            let mut r = format!(
              "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
              data.len()
            )
            .into_bytes();
            r.extend_from_slice(&data);
            r
          }
        };

        let _ = stream.write_all(&response);
      }
    });

    (format!("http://{addr}/ota.zip"), shipped)
  }

  /// A redirector that 302s every request to `target`.
  fn serve_redirect(target: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().unwrap();

    std::thread::spawn(move || {
      for stream in listener.incoming() {
        let Ok(mut stream) = stream else { continue };
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf);
        let response = format!(
          "HTTP/1.1 302 Found\r\nLocation: {target}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        let _ = stream.write_all(response.as_bytes());
      }
    });

    format!("http://{addr}/ota.zip")
  }

  fn ota_archive() -> (Vec<u8>, Vec<u8>) {
    // large enough that the EOCD tail read (64 KiB) is a fraction of it
    let boot_data = vec![0xAA; 64 * 4096];
    let payload = build_payload(
      &[
        ("boot", vec![(op_type::REPLACE, boot_data.clone(), 0, 64)]),
        ("vbmeta", vec![(op_type::ZERO, vec![], 0, 2)]),
      ],
      &boot_data,
    );
    let archive = super::zip::testzip::stored_zip("payload.bin", &payload);
    (archive, boot_data)
  }

  #[test]
  fn remote_partition_list_needs_only_a_sliver_of_traffic() {
    let (archive, _) = ota_archive();
    let archive_len = archive.len();
    let (url, shipped) = serve(archive, true);

    let remote = RemotePayload::open(&url).unwrap();
    let names: Vec<_> = remote.partitions().iter().map(|p| p.name.clone()).collect();
    assert_eq!(names, vec!["boot", "vbmeta"]);

    // metadata traffic must be far below the archive size
    assert!(shipped.load(Ordering::SeqCst) < archive_len);
  }

  #[test]
  fn remote_extraction_yields_partition_bytes() {
    let (archive, boot_data) = ota_archive();
    let (url, _) = serve(archive, true);

    let mut remote = RemotePayload::open(&url).unwrap();
    let cancel = CancelToken::new();

    let mut out = Cursor::new(vec![]);
    remote.extract_partition("boot", &mut out, &cancel, |_, _| {}).unwrap();
    assert_eq!(out.into_inner(), boot_data);

    let mut out = Cursor::new(vec![]);
    remote.extract_partition("vbmeta", &mut out, &cancel, |_, _| {}).unwrap();
    assert_eq!(out.into_inner(), vec![0u8; 8192]);
  }

  #[test]
  fn non_ranged_servers_fall_back_to_discarding() {
    let (archive, boot_data) = ota_archive();
    let (url, _) = serve(archive, false);

    let mut remote = RemotePayload::open(&url).unwrap();
    let cancel = CancelToken::new();

    let mut out = Cursor::new(vec![]);
    remote.extract_partition("boot", &mut out, &cancel, |_, _| {}).unwrap();
    assert_eq!(out.into_inner(), boot_data);
  }

  #[test]
  fn redirects_are_followed_to_the_archive() {
    let (archive, boot_data) = ota_archive();
    let (target, _) = serve(archive, true);
    let url = serve_redirect(target);

    let mut remote = RemotePayload::open(&url).unwrap();
    let cancel = CancelToken::new();

    let mut out = Cursor::new(vec![]);
    remote.extract_partition("boot", &mut out, &cancel, |_, _| {}).unwrap();
    assert_eq!(out.into_inner(), boot_data);
  }

  #[test]
  fn flash_partition_stages_a_real_file_and_cleans_up() {
    let (archive, boot_data) = ota_archive();
    let (url, _) = serve(archive, true);

    let mut remote = RemotePayload::open(&url).unwrap();
    let cancel = CancelToken::new();

    let expected_len = boot_data.len() as u64;
    let mut staged_path = None;
    let report = remote
      .flash_partition(
        "boot",
        &cancel,
        |_, _| {},
        |path| {
          let contents = std::fs::read(path)?;
          assert_eq!(contents, boot_data);
          staged_path = Some(path.to_path_buf());
          Ok(FlashReport {
            success: true,
            bytes_written: contents.len() as u64,
            elapsed_seconds: 0.1,
          })
        },
      )
      .unwrap();

    assert!(report.success);
    assert_eq!(report.bytes_written, expected_len);
    // the staging file must be gone afterwards
    assert!(!staged_path.unwrap().exists());
  }

  #[test]
  fn failing_flash_callback_still_cleans_up() {
    let (archive, _) = ota_archive();
    let (url, _) = serve(archive, true);

    let mut remote = RemotePayload::open(&url).unwrap();
    let cancel = CancelToken::new();

    let mut staged_path = None;
    let res = remote.flash_partition(
      "boot",
      &cancel,
      |_, _| {},
      |path| {
        staged_path = Some(path.to_path_buf());
        Err(Error::DeviceFail("injected".into()))
      },
    );

    assert!(res.is_err());
    assert!(!staged_path.unwrap().exists());
  }
}
