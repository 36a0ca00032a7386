//! Bounded retry with exponential backoff and jitter

use crate::s3::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// `base * 2^attempt` plus up to 20% jitter
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64 * (1u64 << attempt.min(16));
    let jitter = (base_ms as f64 * 0.2 * rand::thread_rng().gen::<f64>()) as u64;
    Duration::from_millis(base_ms + jitter)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or has
/// been retried `max_retries` times.
pub(crate) async fn with_retry<T, F, Fut>(
    what: &str,
    max_retries: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_retries => {
                let delay = backoff_delay(base_delay, attempt);
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
