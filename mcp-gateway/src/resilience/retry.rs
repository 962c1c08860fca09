//! Retry with exponential backoff and deadline awareness
//!
//! Retries are bounded iteration with an explicit deadline check. Only
//! `Transient` errors are retried; a retry whose earliest start time
//! falls after `deadline - min_upstream_latency` is abandoned and the
//! original error surfaces. Cancelled attempts are never retried.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Error, ErrorClass, Result};

/// Resolved retry policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub min_upstream_latency: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            min_upstream_latency: config.min_upstream_latency(),
        }
    }

    /// Backoff before attempt `n` (0-based over retries): `base * 2^n`
    /// plus uniform jitter in `[0, base)`
    fn delay_before(&self, retry_index: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << retry_index.min(20));
        let jitter = if base_ms > 0 {
            rand::rng().random_range(0..base_ms)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter))
    }
}

/// Run `op` with retries for idempotent operations.
///
/// `op` receives the 1-based attempt number. The future returned by each
/// call races against `cancel`; cancellation surfaces as
/// `Error::Cancelled` immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    deadline: Instant,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = op(attempt) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if matches!(error, Error::Cancelled) || error.class() == ErrorClass::Permanent {
            return Err(error);
        }
        if attempt >= policy.max_attempts {
            return Err(error);
        }

        let delay = policy.delay_before(attempt - 1);
        let earliest_start = Instant::now() + delay;
        if earliest_start + policy.min_upstream_latency > deadline {
            tracing::debug!(attempt, "Abandoning retry: deadline too close");
            return Err(error);
        }

        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying upstream call");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            min_upstream_latency: Duration::from_millis(1),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let result = retry_with_backoff(policy(), far_deadline(), &cancel, move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Timeout { tool_id: None })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let result: Result<()> =
            retry_with_backoff(policy(), far_deadline(), &cancel, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::BadRequest("malformed".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let result: Result<()> =
            retry_with_backoff(policy(), far_deadline(), &cancel, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Timeout { tool_id: None })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_abandons_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            min_upstream_latency: Duration::from_millis(10),
        };

        // The first backoff already overshoots this deadline
        let deadline = Instant::now() + Duration::from_millis(20);
        let result: Result<()> = retry_with_backoff(policy, deadline, &cancel, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout { tool_id: None })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = retry_with_backoff(policy(), far_deadline(), &cancel, |_| {
            async { Err(Error::Timeout { tool_id: None }) }
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
