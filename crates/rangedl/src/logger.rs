//! Logging setup. Mirrors the node binary's own logger module: a
//! `tracing_subscriber::fmt` subscriber configured from two CLI-visible
//! enums so format and verbosity are plain, documented flags rather than an
//! `RUST_LOG` string the user has to already know the syntax for.

use clap::ValueEnum;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::UtcTime;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
    Full,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// `RANGEDL_LOG` overrides whatever `--log-level` was passed, matching the
/// environment-overrides-flag convention used throughout the stack this is
/// built on.
pub fn resolve_level(flag: LogLevel) -> LogLevel {
    match std::env::var("RANGEDL_LOG").ok().as_deref() {
        Some("debug") => LogLevel::Debug,
        Some("info") => LogLevel::Info,
        Some("warn") => LogLevel::Warn,
        Some("error") => LogLevel::Error,
        _ => flag,
    }
}

pub fn init(format: LogFormat, level: LogLevel) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_level(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(FmtSpan::CLOSE)
        .with_max_level(tracing::Level::from(level));

    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Full => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}
