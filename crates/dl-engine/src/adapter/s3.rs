//! S3 source adapter. Grounded in the pack's `condow_rusoto` crate: the same
//! `rusoto_s3::S3` trait methods (`head_object`/`get_object`), translated to
//! blocking calls via a small Tokio current-thread runtime per adapter (one
//! per download worker thread, same lifetime as the worker).

use std::io::Read;

use rusoto_core::{ByteStream, Region, RusotoError};
use rusoto_s3::{GetObjectError, GetObjectRequest, HeadObjectError, HeadObjectRequest, S3Client, S3};
use tokio::runtime::Runtime;

use super::{multi_range_header, ObjectMeta, RangeSpec, SourceAdapter};
use crate::config::ProbeOverride;
use crate::error::AdapterError;

pub struct S3Adapter {
    client: S3Client,
    bucket: String,
    key: String,
    rt: Runtime,
    probe_override: ProbeOverride,
}

impl S3Adapter {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, use_fips: bool, probe_override: ProbeOverride) -> anyhow::Result<Self> {
        let region = if use_fips {
            Region::Custom {
                name: "us-gov-west-1-fips".to_string(),
                endpoint: "s3-fips.us-gov-west-1.amazonaws.com".to_string(),
            }
        } else {
            Region::default()
        };
        let client = S3Client::new(region);
        // A current-thread runtime is enough: this runtime only ever bridges
        // one rusoto future at a time via `block_on`, never runs anything
        // concurrently.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            client,
            bucket: bucket.into(),
            key: key.into(),
            rt,
            probe_override,
        })
    }

    fn classify_head(err: RusotoError<HeadObjectError>) -> AdapterError {
        match err {
            RusotoError::Service(HeadObjectError::NoSuchKey(_)) => AdapterError::NotFound,
            RusotoError::Unknown(resp) if resp.status.as_u16() == 404 => AdapterError::NotFound,
            RusotoError::Unknown(resp)
                if resp.status.as_u16() == 429 || resp.status.as_u16() == 503 =>
            {
                AdapterError::Throttled
            }
            other => AdapterError::Transient(anyhow::anyhow!("{other}")),
        }
    }

    fn classify_get(err: RusotoError<GetObjectError>) -> AdapterError {
        match err {
            RusotoError::Service(GetObjectError::NoSuchKey(_)) => AdapterError::NotFound,
            RusotoError::Unknown(resp) if resp.status.as_u16() == 404 => AdapterError::NotFound,
            RusotoError::Unknown(resp)
                if resp.status.as_u16() == 429 || resp.status.as_u16() == 503 =>
            {
                AdapterError::Throttled
            }
            other => AdapterError::Transient(anyhow::anyhow!("{other}")),
        }
    }

    fn body_to_reader(stream: ByteStream) -> Box<dyn Read + Send> {
        Box::new(stream.into_blocking_read())
    }
}

impl SourceAdapter for S3Adapter {
    fn probe(&self, chunk_size: u64) -> Result<ObjectMeta, AdapterError> {
        if let Some(size) = self.probe_override.content_length {
            let supports_range = size > chunk_size && self.probe_override.accept_ranges.unwrap_or(true);
            return Ok(ObjectMeta {
                size,
                supports_range,
                supports_multipart: false,
            });
        }

        let req = HeadObjectRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            ..Default::default()
        };
        let resp = self
            .rt
            .block_on(self.client.head_object(req))
            .map_err(Self::classify_head)?;

        let size = resp
            .content_length
            .ok_or_else(|| AdapterError::Other("missing content length".to_string()))? as u64;

        // S3 always honours byte ranges on GetObject; the only case where we
        // report false is when the object is smaller than one chunk.
        let supports_range = size > chunk_size;

        Ok(ObjectMeta {
            size,
            supports_range,
            supports_multipart: false,
        })
    }

    fn get_all(&self) -> Result<Box<dyn Read + Send>, AdapterError> {
        let req = GetObjectRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            ..Default::default()
        };
        let resp = self
            .rt
            .block_on(self.client.get_object(req))
            .map_err(Self::classify_get)?;
        let body = resp
            .body
            .ok_or_else(|| AdapterError::Other("empty response body".to_string()))?;
        Ok(Self::body_to_reader(body))
    }

    fn get_range(&self, range: RangeSpec) -> Result<Box<dyn Read + Send>, AdapterError> {
        let req = GetObjectRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            range: Some(range.to_header_value()),
            ..Default::default()
        };
        let resp = self
            .rt
            .block_on(self.client.get_object(req))
            .map_err(Self::classify_get)?;
        let body = resp
            .body
            .ok_or_else(|| AdapterError::Other("empty response body".to_string()))?;
        Ok(Self::body_to_reader(body))
    }

    fn get_multipart(&self, ranges: &[RangeSpec]) -> Result<Box<dyn Read + Send>, AdapterError> {
        // S3's GetObject does not support the `multipart/byteranges` wire
        // format for comma-separated ranges; report the mismatch the same
        // way an HTTP server that ignores multipart requests would.
        let _ = multi_range_header(ranges);
        Err(AdapterError::NotMultipart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusoto_core::request::BufferedHttpResponse;
    use rusoto_core::RusotoError;

    fn response(status: u16) -> BufferedHttpResponse {
        BufferedHttpResponse {
            status: http::StatusCode::from_u16(status).unwrap(),
            body: Default::default(),
            headers: Default::default(),
        }
    }

    #[test]
    fn classify_head_maps_404_to_not_found() {
        let err: RusotoError<HeadObjectError> = RusotoError::Unknown(response(404));
        assert!(matches!(S3Adapter::classify_head(err), AdapterError::NotFound));
    }

    #[test]
    fn classify_head_maps_503_to_throttled() {
        let err: RusotoError<HeadObjectError> = RusotoError::Unknown(response(503));
        assert!(matches!(S3Adapter::classify_head(err), AdapterError::Throttled));
    }

    #[test]
    fn classify_get_maps_no_such_key_to_not_found() {
        let err: RusotoError<GetObjectError> =
            RusotoError::Service(GetObjectError::NoSuchKey("missing".to_string()));
        assert!(matches!(S3Adapter::classify_get(err), AdapterError::NotFound));
    }
}
