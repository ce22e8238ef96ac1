//! Structured errors at the adapter/engine/extractor boundary, and the mapping
//! from those errors down to the process exit codes the CLI reports.

use thiserror::Error;

/// Classification of a single network observation, shared by every [`SourceAdapter`]
/// implementation so the retry policy never has to know which provider it is
/// talking to.
///
/// [`SourceAdapter`]: crate::adapter::SourceAdapter
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Connection reset, timeout, DNS failure, etc. Always retryable.
    #[error("transient transport error: {0}")]
    Transient(#[source] anyhow::Error),

    /// HTTP 404 or provider equivalent (S3 `NoSuchKey`, GCS 404 JSON body).
    #[error("object not found")]
    NotFound,

    /// HTTP 429/503 or provider equivalent throttling response.
    #[error("request throttled")]
    Throttled,

    /// The server replied to a multipart range request with a non-multipart
    /// body. Only meaningful during probing; never fatal by itself.
    #[error("server does not honour multipart range requests")]
    NotMultipart,

    /// Any other non-2xx status that isn't one of the above.
    #[error("unexpected response: {0}")]
    Other(String),
}

/// Errors surfaced by [`crate::download_stream`] itself, i.e. everything up
/// to and including the initial probe. Once streaming has started, a
/// worker's own retry budget and min-speed bookkeeping decide whether to
/// recover or abort the process directly (see `engine.rs` and `retry.rs`)
/// rather than returning a `Result` the caller would have no way to act on
/// mid-stream.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Errors surfaced by the tar extractor.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported tar entry type for {path}")]
    UnsupportedEntry { path: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tar(#[from] anyhow::Error),
}

/// The symbolic `errno`-style exit codes named in the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success = 0,
    NotFound = 2,  // ENOENT
    Busy = 16,     // EBUSY
    Io = 5,        // EIO
    Unspecified = 1,
}

impl ExitKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&AdapterError> for ExitKind {
    fn from(err: &AdapterError) -> Self {
        match err {
            AdapterError::NotFound => ExitKind::NotFound,
            AdapterError::Throttled => ExitKind::Busy,
            _ => ExitKind::Unspecified,
        }
    }
}

impl From<&EngineError> for ExitKind {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Adapter(inner) => ExitKind::from(inner),
        }
    }
}
