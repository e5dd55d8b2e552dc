use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::observability;

/// Timeout and backoff for calls to external collaborators.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Hard limit for a single attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): initial × multiplier^attempt, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.initial_backoff.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

/// Errors that know whether another attempt could help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
    fn timed_out(after: Duration) -> Self;
}

/// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
/// Each attempt is cut off at `policy.call_timeout`.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, op_name: &'static str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(policy.call_timeout)),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    operation = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                metrics::counter!(observability::PROVIDER_RETRIES_TOTAL, "operation" => op_name).increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
