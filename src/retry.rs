//! Bounded in-process retry with jittered backoff.
//!
//! Most "try again later" situations in the operator are handled by requeueing
//! the whole reconciliation, not by looping in-process. This helper exists for
//! the narrow cases where an immediate bounded retry is cheaper than a full
//! requeue round-trip, such as status writes that lose an optimistic-concurrency
//! race with another writer. The delay doubles between attempts, capped at
//! [`RetryConfig::max_delay`].
//!
//! # Example
//!
//! ```ignore
//! use bench_operator::retry::{retry_with_backoff, RetryConfig};
//!
//! let result = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(3),
//!     "patch_bench_status",
//!     || async { api.patch_status(&name, &pp, &patch).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Bounds for a retried operation.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts; at least one try always runs
    pub max_attempts: u32,
    /// Delay after the first failure; doubles each attempt thereafter
    pub initial_delay: Duration,
    /// Ceiling for the doubling delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation, retrying with doubling, jittered delays.
///
/// Jitter (0.5x to 1.5x of the current delay) spreads concurrent reconcilers
/// retrying against the same contended object.
///
/// Returns the first success, or the last error once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= config.max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                let sleep_for = delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = sleep_for.as_millis(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(sleep_for).await;
                delay = (delay * 2).min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    /// Story: a status write that loses two conflict races succeeds on the third
    #[tokio::test]
    async fn test_succeeds_after_transient_conflicts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> =
            retry_with_backoff(&fast_config(5), "patch_status", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("conflict")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast_config(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
