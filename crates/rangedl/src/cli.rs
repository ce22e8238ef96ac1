//! Flag parsing and the translation from raw flags into the library's
//! immutable [`Config`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dl_engine::{Config, CompressionOverride, ProbeOverride};

use crate::logger::{LogFormat, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "rangedl", about = "Parallel range downloader with streaming extraction")]
pub struct Cli {
    /// s3://bucket/key, gs://bucket/object, or http(s)://host/path. Required
    /// unless `-O` is given.
    pub url: Option<String>,

    /// Read the object from stdin instead of a network source.
    #[arg(short = 'O', long = "stdin")]
    pub stdin: bool,

    #[arg(long, default_value_t = 16)]
    pub download_workers: usize,

    /// Chunk size in mebibytes.
    #[arg(long, default_value_t = 50)]
    pub chunk_size: u64,

    /// Extraction target directory; absent means write raw bytes to stdout.
    #[arg(short = 'C', long = "directory")]
    pub directory: Option<PathBuf>,

    #[arg(long, default_value_t = 8)]
    pub write_workers: usize,

    #[arg(long, default_value_t = 0)]
    pub strip_components: usize,

    #[arg(long, value_enum)]
    pub compression: Option<CliCompression>,

    #[arg(long, default_value_t = 5)]
    pub retry_count: u32,

    /// Base backoff, in seconds.
    #[arg(long, default_value_t = 1)]
    pub retry_wait: u64,

    /// Minimum sustained byte rate, in bytes/sec. Accepts a `K`/`M`/`G` suffix
    /// (e.g. `4096M`). Unset disables the check.
    #[arg(long, value_parser = parse_byte_size)]
    pub min_speed: Option<u64>,

    /// Grace period, in seconds, before the minimum-speed check engages.
    #[arg(long, default_value_t = 10)]
    pub min_speed_wait: u64,

    #[arg(long)]
    pub skip_head: bool,

    #[arg(long)]
    pub content_length: Option<u64>,

    #[arg(long)]
    pub accept_ranges: Option<bool>,

    /// Additional request header, `Key:Value`. May be repeated.
    #[arg(long = "headers", value_name = "K:V")]
    pub headers: Vec<String>,

    #[arg(long)]
    pub ignore_node_files: bool,

    #[arg(long)]
    pub overwrite: bool,

    #[arg(long)]
    pub use_fips: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, value_enum, default_value_t = LogFormat::Full)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliCompression {
    Tar,
    Gzip,
    Lz4,
}

impl From<CliCompression> for CompressionOverride {
    fn from(c: CliCompression) -> Self {
        match c {
            CliCompression::Tar => CompressionOverride::Tar,
            CliCompression::Gzip => CompressionOverride::Gzip,
            CliCompression::Lz4 => CompressionOverride::Lz4,
        }
    }
}

/// Parses a byte count with an optional `K`/`M`/`G` (binary, i.e. 1024-based)
/// suffix, e.g. `4096M` -> `4096 * 1024 * 1024`.
fn parse_byte_size(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some('K') | Some('k') => (&raw[..raw.len() - 1], 1024),
        Some('M') | Some('m') => (&raw[..raw.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid byte size {raw:?}"))?;
    Ok(value.saturating_mul(multiplier))
}

impl Cli {
    pub fn parse_headers(&self) -> anyhow::Result<Vec<(String, String)>> {
        self.headers
            .iter()
            .map(|raw| {
                raw.split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .ok_or_else(|| anyhow::anyhow!("invalid --headers value {raw:?}, expected K:V"))
            })
            .collect()
    }

    pub fn into_config(&self) -> anyhow::Result<Config> {
        let extra_headers = self.parse_headers()?;
        Ok(Config {
            download_workers: self.download_workers,
            // `0` would reach `div_ceil` in the engine's chunk-count
            // computation and panic; the smallest useful chunk is 1 byte.
            chunk_size: self.chunk_size.saturating_mul(1024 * 1024).max(1),
            write_workers: self.write_workers,
            strip_components: self.strip_components,
            compression: self
                .compression
                .map(CompressionOverride::from)
                .unwrap_or_default(),
            retry_count: self.retry_count,
            retry_wait: Duration::from_secs(self.retry_wait),
            retry_max_wait: Duration::from_secs(self.retry_wait.saturating_mul(32).max(30)),
            min_speed_bytes_per_sec: self.min_speed,
            min_speed_wait: Duration::from_secs(self.min_speed_wait),
            probe_override: ProbeOverride {
                skip_head: self.skip_head,
                content_length: self.content_length,
                accept_ranges: self.accept_ranges,
            },
            extra_headers,
            ignore_node_files: self.ignore_node_files,
            overwrite: self.overwrite,
            use_fips: self.use_fips,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_pairs() {
        let cli = Cli::try_parse_from([
            "rangedl",
            "https://example.com/o.tar.gz",
            "--headers",
            "X-Api-Key: secret",
        ])
        .unwrap();
        assert_eq!(
            cli.parse_headers().unwrap(),
            vec![("X-Api-Key".to_string(), "secret".to_string())]
        );
    }

    #[test]
    fn rejects_malformed_header() {
        let cli = Cli::try_parse_from(["rangedl", "https://example.com/o", "--headers", "nocolon"]).unwrap();
        assert!(cli.parse_headers().is_err());
    }

    #[test]
    fn chunk_size_is_converted_to_bytes() {
        let cli = Cli::try_parse_from(["rangedl", "https://example.com/o"]).unwrap();
        let cfg = cli.into_config().unwrap();
        assert_eq!(cfg.chunk_size, 50 * 1024 * 1024);
    }

    #[test]
    fn chunk_size_zero_is_clamped_to_one_byte() {
        let cli = Cli::try_parse_from(["rangedl", "https://example.com/o", "--chunk-size", "0"]).unwrap();
        let cfg = cli.into_config().unwrap();
        assert_eq!(cfg.chunk_size, 1);
    }

    #[test]
    fn min_speed_accepts_a_binary_suffix() {
        let cli = Cli::try_parse_from(["rangedl", "https://example.com/o", "--min-speed", "4096M"]).unwrap();
        assert_eq!(cli.min_speed, Some(4096 * 1024 * 1024));
    }

    #[test]
    fn min_speed_accepts_a_bare_byte_count() {
        let cli = Cli::try_parse_from(["rangedl", "https://example.com/o", "--min-speed", "512"]).unwrap();
        assert_eq!(cli.min_speed, Some(512));
    }
}
