//! Retry with exponential backoff and jitter
//!
//! Used by the cron trigger to keep retrying while the previous backup is
//! still running. Only errors the caller classifies as retryable are retried;
//! anything else is returned immediately.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

/// Backoff settings for a retried operation
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unlimited)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_multiplier: f64,
    /// Stop retrying once this much time has passed since the first attempt
    pub deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            deadline: None,
        }
    }
}

impl RetryConfig {
    /// Unlimited attempts, bounded by elapsed time
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            ..Default::default()
        }
    }

    /// Set the first delay, keeping the cap at least that large
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self.max_delay = self.max_delay.max(delay);
        self
    }
}

/// Run `operation` until it succeeds, returns a non-retryable error, or the
/// attempt limit or deadline is reached. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) => e,
        };

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "giving up after max attempts"
            );
            return Err(e);
        }

        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        if let Some(deadline) = config.deadline {
            if started.elapsed() + jittered_delay > deadline {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    deadline_secs = deadline.as_secs(),
                    "giving up, deadline reached"
                );
                return Err(e);
            }
        }

        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = jittered_delay.as_millis() as u64,
            "operation not applied yet, retrying"
        );
        tokio::time::sleep(jittered_delay).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
