//! HTTP byte-range fetcher.
//!
//! Ranged GETs with explicit redirect handling. Servers that ignore `Range:`
//! and answer 200 are tolerated by streaming from byte zero and discarding
//! the prefix.

use std::{
  io::Read,
  time::{Duration, SystemTime},
};

use reqwest::{
  blocking::{Client, Response},
  header, redirect, StatusCode,
};

use crate::{Error, Result};

const USER_AGENT: &str = concat!("crossflash/", env!("CARGO_PKG_VERSION"));
const REDIRECT_LIMIT: usize = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct RangeFetcher {
  client: Client,
  /// Current URL, updated as redirects are followed.
  url: String,
  expires: Option<SystemTime>,
}

impl RangeFetcher {
  pub fn new(url: &str) -> Result<Self> {
    // redirects are followed by hand so Range headers survive the hop
    let client = Client::builder()
      .redirect(redirect::Policy::none())
      .timeout(REQUEST_TIMEOUT)
      .build()?;

    Ok(Self {
      client,
      url: url.to_string(),
      expires: parse_expires(url),
    })
  }

  /// Expiry of a signed URL (`Expires=<epoch-seconds>`), if present.
  pub fn expires_at(&self) -> Option<SystemTime> {
    self.expires
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  fn get(&mut self, range: Option<(u64, u64)>) -> Result<Response> {
    let mut hops = 0;
    loop {
      let mut request = self
        .client
        .get(&self.url)
        .header(header::ACCEPT, "*/*")
        .header(header::CONNECTION, "keep-alive")
        .header(header::USER_AGENT, USER_AGENT);
      if let Some((start, end)) = range {
        request = request.header(header::RANGE, format!("bytes={start}-{end}"));
      }

      let response = request.send()?;
      let status = response.status();

      if status.is_redirection() {
        hops += 1;
        if hops > REDIRECT_LIMIT {
          return Err(Error::ZipMalformed(format!("too many redirects fetching {}", self.url)));
        }
        let location = response
          .headers()
          .get(header::LOCATION)
          .and_then(|v| v.to_str().ok())
          .ok_or_else(|| Error::ZipMalformed("redirect without Location".into()))?;

        // resolve relative redirects against the current url
        let next = reqwest::Url::parse(&self.url)
          .and_then(|base| base.join(location))
          .map(|u| u.to_string())
          .unwrap_or_else(|_| location.to_string());

        tracing::debug!("following redirect -> {}", next);
        self.url = next;
        continue;
      }

      return Ok(response);
    }
  }

  /// Total length of the resource, probed with a one-byte range request.
  pub fn content_length(&mut self) -> Result<u64> {
    let response = self.get(Some((0, 0)))?;

    match response.status() {
      StatusCode::PARTIAL_CONTENT => {
        let content_range = response
          .headers()
          .get(header::CONTENT_RANGE)
          .and_then(|v| v.to_str().ok())
          .ok_or_else(|| Error::ZipMalformed("206 without Content-Range".into()))?;
        // "bytes 0-0/12345"
        content_range
          .rsplit('/')
          .next()
          .and_then(|total| total.trim().parse().ok())
          .ok_or_else(|| Error::ZipMalformed(format!("unparsable Content-Range: {content_range}")))
      }
      StatusCode::OK => response
        .content_length()
        .ok_or_else(|| Error::ZipMalformed("200 without Content-Length".into())),
      status => Err(Error::ZipMalformed(format!("unexpected status {status} probing length"))),
    }
  }

  /// Fetch the inclusive byte range `[start, end]`.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip(self)))]
  pub fn fetch_range(&mut self, start: u64, end: u64) -> Result<Vec<u8>> {
    if end < start {
      return Err(Error::InvalidArgument(format!("bad range {start}-{end}")));
    }
    let want = (end - start + 1) as usize;
    let response = self.get(Some((start, end)))?;

    match response.status() {
      StatusCode::PARTIAL_CONTENT => {
        let mut body = Vec::with_capacity(want);
        response.take(want as u64).read_to_end(&mut body)?;
        tracing::trace!("range {}-{}: {} bytes", start, end, body.len());
        Ok(body)
      }
      StatusCode::OK => {
        // range unsupported: stream from zero, discard the prefix
        tracing::debug!("server ignored Range, discarding {} prefix bytes", start);
        let mut reader = response;
        std::io::copy(&mut (&mut reader).take(start), &mut std::io::sink())?;
        let mut body = Vec::with_capacity(want);
        reader.take(want as u64).read_to_end(&mut body)?;
        Ok(body)
      }
      status => Err(Error::ZipMalformed(format!("unexpected status {status} for ranged GET"))),
    }
  }
}

/// Pull an `Expires=<epoch-seconds>` query parameter out of a signed URL.
fn parse_expires(url: &str) -> Option<SystemTime> {
  let query = url.split_once('?')?.1;
  for pair in query.split('&') {
    let (key, value) = pair.split_once('=')?;
    if key.eq_ignore_ascii_case("expires") {
      let secs: u64 = value.parse().ok()?;
      return Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn expires_query_parameter_is_parsed() {
    let url = "https://example.com/ota.zip?Expires=1700000000&Signature=abc";
    let expires = parse_expires(url).unwrap();
    assert_eq!(
      expires.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs(),
      1_700_000_000
    );

    assert!(parse_expires("https://example.com/ota.zip").is_none());
    assert!(parse_expires("https://example.com/ota.zip?Expires=soon").is_none());
  }
}
