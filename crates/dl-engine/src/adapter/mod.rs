//! The [`SourceAdapter`] trait abstracts an addressable remote object behind
//! probe / fetch-all / fetch-range / fetch-multipart operations. Three
//! concrete adapters (HTTP, S3, GCS) implement it; the engine and chunk
//! reader never know which one they are driving.

pub mod gcs;
pub mod http;
pub mod s3;

use std::io::Read;

use crate::error::AdapterError;

/// Metadata returned by [`SourceAdapter::probe`].
#[derive(Debug, Clone, Copy)]
pub struct ObjectMeta {
    pub size: u64,
    pub supports_range: bool,
    pub supports_multipart: bool,
}

/// A half-open byte range `[start, end)` of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

impl RangeSpec {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// The wire-level inclusive range for a single range: `bytes=start-(end-1)`.
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

/// Render a `Range` header value for one or more ranges, e.g.
/// `[[0,1]] -> "bytes=0-0"`, `[[0,1],[3,6]] -> "bytes=0-0,3-5"`.
pub fn multi_range_header(ranges: &[RangeSpec]) -> String {
    let parts: Vec<String> = ranges
        .iter()
        .map(|r| format!("{}-{}", r.start, r.end - 1))
        .collect();
    format!("bytes={}", parts.join(","))
}

/// A capability set offering probe / fetch-all / fetch-range / fetch-multipart
/// access to one remote object. Implementations are blocking: each method
/// returns a `Read` positioned at the start of the requested bytes, consumed
/// from a worker's own OS thread.
pub trait SourceAdapter: Send + Sync {
    /// Probe size and range support. When `chunk_size >= size`, both range
    /// booleans must come back `false` regardless of what the server reports,
    /// since range support is irrelevant for an object smaller than one chunk.
    fn probe(&self, chunk_size: u64) -> Result<ObjectMeta, AdapterError>;

    /// Fetch the full object from the start.
    fn get_all(&self) -> Result<Box<dyn Read + Send>, AdapterError>;

    /// Fetch a single half-open byte range.
    fn get_range(&self, range: RangeSpec) -> Result<Box<dyn Read + Send>, AdapterError>;

    /// Fetch several disjoint ranges as one multipart response. Returns
    /// [`AdapterError::NotMultipart`] (not fatal) if the server answers with
    /// a non-multipart body.
    fn get_multipart(&self, ranges: &[RangeSpec]) -> Result<Box<dyn Read + Send>, AdapterError>;
}
