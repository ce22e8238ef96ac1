#![allow(clippy::redundant_closure)]

mod adapter;
mod chunk_reader;
mod compression;
mod config;
mod engine;
mod error;
mod extractor;
mod pipe;
mod retry;

pub use adapter::{
    gcs::GcsAdapter, http::HttpAdapter, s3::S3Adapter, ObjectMeta, RangeSpec, SourceAdapter,
};
pub use compression::{Compression, CompressionDetector};
pub use config::{Config, CompressionOverride, ProbeOverride};
pub use engine::download_stream;
pub use error::{AdapterError, EngineError, ExitKind, ExtractError};
pub use extractor::TarExtractor;
pub use pipe::{pipe, PipeReader, PipeWriter};
