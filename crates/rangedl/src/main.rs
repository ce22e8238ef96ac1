mod cli;
mod logger;

use std::io::{self, Read};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dl_engine::{
    CompressionDetector, Config, EngineError, ExitKind, GcsAdapter, HttpAdapter, S3Adapter,
    SourceAdapter, TarExtractor,
};
use tracing::info;

use cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = logger::resolve_level(cli.log_level);
    if let Err(err) = logger::init(cli.log_format, level) {
        eprintln!("failed to initialize logging: {err:#}");
    }

    match run(&cli) {
        Ok(()) => ExitCode::from(ExitKind::Success.code() as u8),
        Err(err) => {
            tracing::error!(%err, "rangedl failed");
            let code = err
                .downcast_ref::<EngineError>()
                .map(ExitKind::from)
                .unwrap_or(ExitKind::Unspecified);
            ExitCode::from(code.code() as u8)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let cfg = Arc::new(cli.into_config()?);

    let (stream, filename_hint): (Box<dyn Read + Send>, Option<String>) = if cli.stdin {
        info!("reading object from stdin");
        (Box::new(io::stdin()), None)
    } else {
        let url = cli
            .url
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("a URL is required unless -O is given"))?;
        let adapter = build_adapter(url, cli, &cfg)?;
        let hint = filename_from_url(url);
        info!(url, "starting download");
        (dl_engine::download_stream(adapter, cfg.clone())?, hint)
    };

    let (_detected, mut decompressed) =
        CompressionDetector::detect(stream, filename_hint.as_deref(), cfg.compression)?;

    match &cli.directory {
        Some(dir) => {
            info!(dir = %dir.display(), "extracting tar archive");
            TarExtractor::new(dir.clone(), cfg.clone()).extract(decompressed)?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            let written = io::copy(&mut decompressed, &mut stdout)?;
            info!(bytes = %humansize::format_size(written, humansize::BINARY), "stream complete");
        }
    }

    Ok(())
}

fn build_adapter(url: &str, cli: &Cli, cfg: &Config) -> anyhow::Result<Arc<dyn SourceAdapter>> {
    if let Some(rest) = url.strip_prefix("s3://") {
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("s3 URL must be s3://bucket/key"))?;
        let adapter = S3Adapter::new(bucket, key, cli.use_fips, cfg.probe_override)?;
        return Ok(Arc::new(adapter));
    }
    if let Some(rest) = url.strip_prefix("gs://") {
        let (bucket, object) = rest
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("gs URL must be gs://bucket/object"))?;
        let adapter = GcsAdapter::new(bucket, object, cfg.probe_override)?;
        return Ok(Arc::new(adapter));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        let adapter = HttpAdapter::new(url.to_string(), cfg.extra_headers.clone(), cfg.probe_override);
        return Ok(Arc::new(adapter));
    }
    anyhow::bail!("unsupported URL scheme in {url:?}; expected s3://, gs://, or http(s)://")
}

fn filename_from_url(raw: &str) -> Option<String> {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(str::to_string)))
        .filter(|s| !s.is_empty())
}
