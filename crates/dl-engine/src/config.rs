//! Immutable configuration threaded through every constructor in this crate,
//! built once by the CLI layer (design note: no module below it reaches for
//! process-global flag state).

use std::time::Duration;

/// Auto-detect or force a specific container/compression format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionOverride {
    #[default]
    Auto,
    Tar,
    Gzip,
    Lz4,
}

/// Out-of-band probe bypass values (`--skip-head`, `--content-length`,
/// `--accept-ranges`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeOverride {
    pub skip_head: bool,
    pub content_length: Option<u64>,
    pub accept_ranges: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub download_workers: usize,
    pub chunk_size: u64,
    pub write_workers: usize,
    pub strip_components: usize,
    pub compression: CompressionOverride,
    pub retry_count: u32,
    pub retry_wait: Duration,
    pub retry_max_wait: Duration,
    pub min_speed_bytes_per_sec: Option<u64>,
    pub min_speed_wait: Duration,
    pub probe_override: ProbeOverride,
    pub extra_headers: Vec<(String, String)>,
    pub ignore_node_files: bool,
    pub overwrite: bool,
    pub use_fips: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_workers: 16,
            chunk_size: 50 * 1024 * 1024,
            write_workers: 8,
            strip_components: 0,
            compression: CompressionOverride::Auto,
            retry_count: 5,
            retry_wait: Duration::from_secs(1),
            retry_max_wait: Duration::from_secs(30),
            min_speed_bytes_per_sec: None,
            min_speed_wait: Duration::from_secs(10),
            probe_override: ProbeOverride::default(),
            extra_headers: Vec::new(),
            ignore_node_files: false,
            overwrite: false,
            use_fips: false,
        }
    }
}

impl Config {
    /// Minimum bytes-per-millisecond a chunk download must sustain after the
    /// grace period, derived from `min_speed_bytes_per_sec`. `None` disables
    /// the check entirely.
    pub fn min_bytes_per_ms(&self) -> Option<f64> {
        self.min_speed_bytes_per_sec
            .map(|bps| bps as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_bytes_per_ms_is_none_when_unset() {
        let cfg = Config::default();
        assert!(cfg.min_bytes_per_ms().is_none());
    }

    #[test]
    fn min_bytes_per_ms_converts_from_per_second_rate() {
        let mut cfg = Config::default();
        cfg.min_speed_bytes_per_sec = Some(4096);
        assert_eq!(cfg.min_bytes_per_ms(), Some(4.096));
    }
}
