//! Jittered exponential backoff shared by every reconnect/retry loop
//! (exchange REST retries, WS reconnects, ingestor, liquidation retries).
//!
//! Grounded on `scrapers/binance_session.rs`'s `BackoffCalculator`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 200,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.3,
        }
    }
}

#[derive(Debug)]
pub struct BackoffCalculator {
    config: BackoffConfig,
    attempt: u32,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn next_backoff(&mut self) -> Duration {
        let base = (self.config.base_ms as f64) * self.config.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.config.max_ms as f64);
        let jitter_range = capped * self.config.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let final_ms = (capped + jitter).max(self.config.base_ms as f64);
        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Retries `op` while it fails with a transient error, up to `max_attempts`
/// attempts total (spec §7: "retried with exponential backoff, cap 60s, max
/// 5 attempts, at the component that originated the call"). `retry_after`
/// overrides the jittered backoff delay when the error carries one (e.g. a
/// 429's `Retry-After` header), matching the same reconnect/retry shape
/// `exchange::ws` and `liquidation::liquidate_with_retry` already use.
pub async fn retry_with_backoff<T, E, Fut, F>(
    label: &'static str,
    max_attempts: u32,
    is_retryable: impl Fn(&E) -> bool,
    retry_after: impl Fn(&E) -> Option<Duration>,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = BackoffCalculator::new(BackoffConfig::default());
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = retry_after(&e).unwrap_or_else(|| backoff.next_backoff());
                warn!(label, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying_after_transient_error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = BackoffCalculator::new(BackoffConfig::default());
        let d1 = b.next_backoff();
        assert!(d1.as_millis() >= 100 && d1.as_millis() <= 300);
        for _ in 0..20 {
            let d = b.next_backoff();
            assert!(d.as_millis() <= 80_000);
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = BackoffCalculator::new(BackoffConfig::default());
        b.next_backoff();
        b.next_backoff();
        b.reset();
        assert_eq!(b.attempt(), 0);
    }

    #[derive(Debug)]
    struct Flaky(&'static str);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = retry_with_backoff(
            "test",
            5,
            |_: &Flaky| true,
            |_| Some(Duration::from_millis(1)),
            || {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Flaky("transient"))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), Flaky> = retry_with_backoff(
            "test",
            3,
            |_| true,
            |_| Some(Duration::from_millis(1)),
            || {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(Flaky("always fails")) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), Flaky> = retry_with_backoff(
            "test",
            5,
            |_| false,
            |_| None,
            || {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(Flaky("permanent")) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
