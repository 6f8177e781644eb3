//! Retry with capped exponential backoff
//!
//! Transient remote failures (network errors, rate limiting, server errors)
//! are retried: `base, 2·base, 4·base, ...` up to `max_delay`, at most
//! `max_retries` times. Anything else is returned immediately.

use std::time::Duration;

use anyhow::Result;
use driftsync_core::config::RetryConfig;
use driftsync_core::ports::RemoteError;
use tracing::{info, warn};

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(30));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Determines whether an error is transient (retryable)
///
/// A typed [`RemoteError`] decides when present. Adapters that only produce
/// strings are classified by message:
/// - Network errors (connection refused, timeout, DNS)
/// - Rate limiting (HTTP 429)
/// - Server errors (HTTP 5xx)
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    if let Some(remote) = RemoteError::classify(err) {
        return remote.is_transient();
    }

    let err_str = format!("{err:#}").to_lowercase();

    let network = ["network", "connection", "timeout", "timed out", "dns", "broken pipe"];
    let throttled = ["429", "too many requests", "rate limit"];
    let server = ["500", "502", "503", "504", "server error"];

    network
        .iter()
        .chain(throttled.iter())
        .chain(server.iter())
        .any(|needle| err_str.contains(needle))
}

/// Server-requested pause, if the error carries one
fn retry_after(err: &anyhow::Error) -> Option<Duration> {
    match RemoteError::classify(err) {
        Some(RemoteError::RateLimited { retry_after_secs }) => {
            Some(Duration::from_secs(*retry_after_secs))
        }
        _ => None,
    }
}

/// Executes an async operation, retrying transient failures
///
/// Callers that must stay cancellable run this inside a `tokio::select!`
/// against their cancellation token; the sleeps are cancellation points.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation_name: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries && is_transient_error(&err) => {
                let delay = retry_after(&err)
                    .map(|server| server.max(policy.delay_for(attempt)))
                    .unwrap_or_else(|| policy.delay_for(attempt))
                    .min(policy.max_delay);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_is_transient_error_typed() {
        assert!(is_transient_error(&anyhow::Error::new(
            RemoteError::Transient("reset".into())
        )));
        assert!(is_transient_error(&anyhow::Error::new(
            RemoteError::RateLimited {
                retry_after_secs: 1
            }
        )));
        assert!(!is_transient_error(&anyhow::Error::new(
            RemoteError::NotFound("/a".into())
        )));
        // Typed classification wins over the message
        assert!(!is_transient_error(&anyhow::Error::new(
            RemoteError::InvalidName("connection".into())
        )));
    }

    #[test]
    fn test_is_transient_error_by_message() {
        assert!(is_transient_error(&anyhow::anyhow!("Connection refused")));
        assert!(is_transient_error(&anyhow::anyhow!("HTTP 503 Service Unavailable")));
        assert!(is_transient_error(&anyhow::anyhow!("429 Too Many Requests")));
        assert!(!is_transient_error(&anyhow::anyhow!("File not found")));
        assert!(!is_transient_error(&anyhow::anyhow!("401 Unauthorized")));
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "flaky", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow::Error::new(RemoteError::Transient("timeout".into())))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), "down", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("network unreachable"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), "missing", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::Error::new(RemoteError::NotFound("/x".into())))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
