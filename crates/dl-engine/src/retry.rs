//! Bounded-attempt retry with exponential backoff, shared by the probe call
//! and the parallel download engine's per-chunk reconnect loop (§4.2, §4.4).
//! Terminal classifications abort the process directly with the exit code
//! named in the specification's table; this preserves the source's exit
//! semantics rather than threading a richer error type back through the pipe
//! (see the design note on the EIO-from-a-background-thread open question).

use std::time::Duration;

use tracing::error;

use crate::config::Config;
use crate::error::AdapterError;

pub enum Classification {
    Retryable,
    NotFound,
    Throttled,
}

pub fn classify(err: &AdapterError) -> Classification {
    match err {
        AdapterError::NotFound => Classification::NotFound,
        AdapterError::Throttled => Classification::Throttled,
        AdapterError::Transient(_) | AdapterError::Other(_) | AdapterError::NotMultipart => {
            Classification::Retryable
        }
    }
}

/// Exponential backoff with a hard cap, `base * 2^(attempt-1)` clamped to
/// `max_delay`.
pub fn backoff_delay(cfg: &Config, attempt: u32) -> Duration {
    let scale = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let delay = cfg.retry_wait.saturating_mul(scale.min(u32::MAX as u64) as u32);
    delay.min(cfg.retry_max_wait)
}

/// Abort the process with the ENOENT exit code after logging. Never returns.
pub fn exit_not_found(context: &str) -> ! {
    error!(context, "object not found (404)");
    std::process::exit(crate::error::ExitKind::NotFound.code());
}

/// Abort the process with the EBUSY exit code after logging. Never returns.
pub fn exit_busy(context: &str) -> ! {
    error!(context, "persistent throttling, retry budget exhausted");
    std::process::exit(crate::error::ExitKind::Busy.code());
}

/// Abort the process with the EIO exit code after logging. Never returns.
pub fn exit_io(context: &str) -> ! {
    error!(context, "retry budget exhausted");
    std::process::exit(crate::error::ExitKind::Io.code());
}

/// Retry `op` up to `cfg.retry_count` times, sleeping with [`backoff_delay`]
/// between attempts. Terminal classifications (404, throttling exhaustion)
/// abort the process directly; exhausting retries on a retryable error
/// returns it to the caller instead, since callers above the probe call
/// (the engine's per-chunk loop) fold transient exhaustion into their own
/// EIO bookkeeping rather than exiting here.
pub fn with_retry<T>(
    cfg: &Config,
    context: &str,
    mut op: impl FnMut() -> Result<T, AdapterError>,
) -> Result<T, AdapterError> {
    let mut attempt = 1u32;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(err) => match classify(&err) {
                Classification::NotFound => exit_not_found(context),
                Classification::Throttled => {
                    if attempt >= cfg.retry_count {
                        exit_busy(context);
                    }
                    std::thread::sleep(backoff_delay(cfg, attempt));
                    attempt += 1;
                }
                Classification::Retryable => {
                    if attempt >= cfg.retry_count {
                        return Err(err);
                    }
                    std::thread::sleep(backoff_delay(cfg, attempt));
                    attempt += 1;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn cfg() -> Config {
        let mut c = Config::default();
        c.retry_count = 3;
        c.retry_wait = Duration::from_millis(1);
        c.retry_max_wait = Duration::from_millis(4);
        c
    }

    #[test]
    fn backoff_doubles_then_clamps() {
        let cfg = cfg();
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(1));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(2));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(4)); // would be 4, at the cap
        assert_eq!(backoff_delay(&cfg, 10), Duration::from_millis(4)); // clamped
    }

    #[test]
    fn retryable_exhaustion_returns_error_without_exiting() {
        let cfg = cfg();
        let calls = Cell::new(0);
        let result = with_retry(&cfg, "test", || {
            calls.set(calls.get() + 1);
            Err::<(), _>(AdapterError::Transient(anyhow::anyhow!("boom")))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), cfg.retry_count);
    }

    #[test]
    fn succeeds_without_retrying_on_first_try() {
        let cfg = cfg();
        let result = with_retry(&cfg, "test", || Ok::<_, AdapterError>(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn recovers_after_a_transient_failure() {
        let cfg = cfg();
        let calls = Cell::new(0);
        let result = with_retry(&cfg, "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(AdapterError::Transient(anyhow::anyhow!("boom")))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
    }
}
