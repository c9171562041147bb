//! Retry discipline for platform adapter calls.
//!
//! Transport errors and timeouts retry on a fixed delay; rate limits add
//! jitter so concurrent domains do not re-collide on the same instant.

use crate::errors::PlatformError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Attempt/delay policy for one adapter operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

/// Run `f` up to `policy.attempts` times, sleeping between retriable
/// failures. Non-retriable errors and the final failure surface unchanged.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    policy: RetryPolicy,
    f: F,
) -> Result<T, PlatformError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    let mut attempt = 1;
    loop {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < policy.attempts => {
                let delay = backoff_delay(&err, policy.delay);
                warn!(
                    operation,
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "platform call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(err: &PlatformError, base: Duration) -> Duration {
    match err {
        PlatformError::RateLimited(_) => {
            let jitter_ms = rand::rng().random_range(0..=base.as_millis().max(1) as u64);
            base + Duration::from_millis(jitter_ms)
        }
        _ => base,
    }
}
