//! HTTP/HTTPS source adapter. Grounded in the teacher crate's own
//! `reqwest::blocking` request construction (range header, status handling,
//! content-length validation) but restructured behind the [`SourceAdapter`]
//! trait so the engine and chunk reader are transport-agnostic.

use std::io::Cursor;
use std::io::Read;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{multi_range_header, ObjectMeta, RangeSpec, SourceAdapter};
use crate::config::ProbeOverride;
use crate::error::AdapterError;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct HttpAdapter {
    client: Client,
    url: String,
    extra_headers: Vec<(String, String)>,
    probe_override: ProbeOverride,
}

impl HttpAdapter {
    pub fn new(url: impl Into<String>, extra_headers: Vec<(String, String)>, probe_override: ProbeOverride) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            extra_headers,
            probe_override,
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "User-Agent",
            HeaderValue::from_str(&format!("rangedl/{VERSION}")).unwrap(),
        );
        for (k, v) in &self.extra_headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                headers.insert(name, value);
            }
        }
        headers
    }

    fn classify_status(status: StatusCode) -> Result<(), AdapterError> {
        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::NOT_FOUND => Err(AdapterError::NotFound),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                Err(AdapterError::Throttled)
            }
            other => Err(AdapterError::Other(format!("unexpected status: {other}"))),
        }
    }
}

impl SourceAdapter for HttpAdapter {
    fn probe(&self, chunk_size: u64) -> Result<ObjectMeta, AdapterError> {
        if let Some(size) = self.probe_override.content_length {
            let supports_range = if size <= chunk_size {
                false
            } else {
                self.probe_override.accept_ranges.unwrap_or(false)
            };
            return Ok(ObjectMeta {
                size,
                supports_range,
                supports_multipart: false,
            });
        }
        if self.probe_override.skip_head {
            return Err(AdapterError::Other(
                "--skip-head requires --content-length".to_string(),
            ));
        }

        let response = self
            .client
            .head(&self.url)
            .headers(self.headers())
            .send()
            .map_err(|e| AdapterError::Transient(e.into()))?;
        Self::classify_status(response.status())?;

        let size: u64 = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| AdapterError::Other("missing Content-Length".to_string()))?;

        let mut supports_range = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "bytes")
            .unwrap_or(false);

        if size <= chunk_size {
            debug!(size, chunk_size, "object smaller than one chunk, ignoring range support");
            return Ok(ObjectMeta {
                size,
                supports_range: false,
                supports_multipart: false,
            });
        }

        if supports_range {
            // Conservatively probe single-range support with a small real
            // request instead of trusting Accept-Ranges alone.
            let mut headers = self.headers();
            headers.insert(RANGE, HeaderValue::from_static("bytes=0-0"));
            match self.client.get(&self.url).headers(headers).send() {
                Ok(resp) if resp.status() == StatusCode::PARTIAL_CONTENT => {}
                _ => {
                    warn!("server advertised Accept-Ranges but rejected a probe range request");
                    supports_range = false;
                }
            }
        }

        Ok(ObjectMeta {
            size,
            supports_range,
            // Multipart probing is conservatively disabled: some object
            // stores begin billable transfers on a multipart probe.
            supports_multipart: false,
        })
    }

    fn get_all(&self) -> Result<Box<dyn Read + Send>, AdapterError> {
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers())
            .send()
            .map_err(|e| AdapterError::Transient(e.into()))?;
        Self::classify_status(response.status())?;
        Ok(Box::new(response))
    }

    fn get_range(&self, range: RangeSpec) -> Result<Box<dyn Read + Send>, AdapterError> {
        debug!(?range, "requesting range");
        let mut headers = self.headers();
        headers.insert(
            RANGE,
            HeaderValue::from_str(&range.to_header_value()).unwrap(),
        );
        let response: Response = self
            .client
            .get(&self.url)
            .headers(headers)
            .send()
            .map_err(|e| AdapterError::Transient(e.into()))?;

        let status = response.status();
        if status == StatusCode::OK && range.start != 0 {
            return Err(AdapterError::Other(
                "server does not support partial content".to_string(),
            ));
        }
        if status != StatusCode::PARTIAL_CONTENT && range.start != 0 {
            Self::classify_status(status)?;
        }

        let content_length: u64 = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| AdapterError::Other("missing Content-Length".to_string()))?;
        if content_length != range.len() {
            return Err(AdapterError::Other(format!(
                "unexpected content length: got {content_length}, expected {}",
                range.len()
            )));
        }

        Ok(Box::new(response))
    }

    fn get_multipart(&self, ranges: &[RangeSpec]) -> Result<Box<dyn Read + Send>, AdapterError> {
        let mut headers = self.headers();
        headers.insert(
            RANGE,
            HeaderValue::from_str(&multi_range_header(ranges)).unwrap(),
        );
        let response = self
            .client
            .get(&self.url)
            .headers(headers)
            .send()
            .map_err(|e| AdapterError::Transient(e.into()))?;
        Self::classify_status(response.status())?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !content_type.starts_with("multipart/") {
            return Err(AdapterError::NotMultipart);
        }

        let boundary = content_type
            .split(';')
            .find_map(|piece| piece.trim().strip_prefix("boundary="))
            .map(|b| b.trim_matches('"').to_string())
            .ok_or_else(|| AdapterError::Other("multipart response missing boundary".to_string()))?;

        let body = response
            .bytes()
            .map_err(|e| AdapterError::Transient(e.into()))?;

        let concatenated = split_multipart_bodies(&body, &boundary)
            .map_err(|e| AdapterError::Other(e.to_string()))?;

        Ok(Box::new(Cursor::new(concatenated)))
    }
}

/// Parse a `multipart/byteranges` body and concatenate the part bodies, in
/// the order the server returned them, discarding the per-part headers and
/// MIME boundary framing.
fn split_multipart_bodies(body: &[u8], boundary: &str) -> anyhow::Result<Vec<u8>> {
    let delim = format!("--{boundary}").into_bytes();
    let mut out = Vec::with_capacity(body.len());

    let mut offset = 0;
    while let Some(rel) = find(&body[offset..], &delim) {
        let start = offset + rel + delim.len();
        if body[start..].starts_with(b"--") {
            break; // terminal boundary
        }
        let rest = &body[start..];
        // Skip trailing CRLF after the boundary marker.
        let rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);

        let header_end = find(rest, b"\r\n\r\n")
            .ok_or_else(|| anyhow::anyhow!("malformed multipart part: no header terminator"))?;
        let part_body_start = header_end + 4;

        let next_delim = find(&rest[part_body_start..], &delim)
            .ok_or_else(|| anyhow::anyhow!("malformed multipart part: no terminating boundary"))?;
        let mut part_body_end = part_body_start + next_delim;
        if rest[..part_body_end].ends_with(b"\r\n") {
            part_body_end -= 2;
        }

        out.extend_from_slice(&rest[part_body_start..part_body_end]);
        offset = start + next_delim;
    }

    Ok(out)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len().max(1))
        .position(|window| window == needle)
}
