//! Bounded retry of busy replies.
//!
//! Only `DeviceBusy` is retried. Every other error, `Nak` included, returns
//! to the caller on the first attempt. Once attempts or the time budget run
//! out, the last busy error is wrapped in a `Timeout`.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ErrorKind, LinkError, LinkResult};

/// Retry policy for transient device errors.
///
/// # Example
///
/// ```rust
/// use daq_link::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(5, Duration::from_millis(200), Duration::from_secs(3))
///     .with_backoff(2.0, Duration::from_secs(1));
/// assert_eq!(policy.max_attempts, 5);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub interval: Duration,
    /// Upper bound on time spent from the first attempt until the next
    /// retry would start.
    pub budget: Duration,
    /// Factor applied to the delay after each retry. 1.0 keeps it constant.
    pub backoff_multiplier: f64,
    /// Ceiling for the grown delay.
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts, 100 ms apart, within five seconds.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_millis(100),
            budget: Duration::from_secs(5),
            backoff_multiplier: 1.0,
            max_interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Constant-interval policy.
    pub fn new(max_attempts: u32, interval: Duration, budget: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            budget,
            max_interval: interval,
            ..Self::default()
        }
    }

    /// Grow the delay by `multiplier` after each retry, up to `max_interval`.
    #[must_use]
    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_interval = max_interval;
        self
    }

    /// Run `send` until it succeeds, fails permanently, or the policy is spent.
    ///
    /// # Errors
    ///
    /// - the first non-transient error, unchanged
    /// - `Timeout` caused by the last `DeviceBusy` once attempts or budget run out
    pub async fn with_retry<T, F, Fut>(&self, send: F) -> LinkResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LinkResult<T>>,
    {
        self.with_retry_cancellable(&CancellationToken::new(), send)
            .await
    }

    /// [`with_retry`](Self::with_retry) abandoning the wait when `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`with_retry`](Self::with_retry), plus `Cancelled`.
    pub async fn with_retry_cancellable<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut send: F,
    ) -> LinkResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LinkResult<T>>,
    {
        let started = Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.interval;
        let mut attempt = 1;

        loop {
            let err = match send().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                return Err(LinkError::timeout(format!(
                    "device still busy after {} attempts",
                    attempt
                ))
                .caused_by(err));
            }
            if started
                .elapsed()
                .checked_add(delay)
                .is_none_or(|next| next > self.budget)
            {
                return Err(LinkError::timeout(format!(
                    "retry budget of {:?} exhausted after {} attempts",
                    self.budget, attempt
                ))
                .caused_by(err));
            }

            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Device busy, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(LinkError::new(ErrorKind::Cancelled, "retry cancelled").caused_by(err));
                }
                _ = sleep(delay) => {}
            }

            attempt += 1;
            delay = self.next_delay(delay);
        }
    }

    /// Grown delay, clamped to `max_interval`. Saturates instead of
    /// overflowing for huge or non-finite multipliers.
    fn next_delay(&self, delay: Duration) -> Duration {
        let ceiling = self.max_interval.max(self.interval);
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier.max(1.0))
            .map_or(ceiling, |next| next.min(ceiling))
    }
}

/// One-shot form of [`RetryPolicy::with_retry`] with a constant interval.
///
/// # Errors
///
/// As [`RetryPolicy::with_retry`].
pub async fn with_retry<T, F, Fut>(
    send: F,
    max_attempts: u32,
    interval: Duration,
    budget: Duration,
) -> LinkResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LinkResult<T>>,
{
    RetryPolicy::new(max_attempts, interval, budget)
        .with_retry(send)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn busy() -> LinkError {
        LinkError::new(ErrorKind::DeviceBusy, "moving")
    }

    #[tokio::test]
    async fn test_busy_busy_ack_succeeds_on_third_call() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(
            || async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(busy()),
                    _ => Ok("ack"),
                }
            },
            3,
            Duration::from_millis(5),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(result.unwrap(), "ack");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_each_retry_is_logged() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let _ = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_secs(1))
            .with_retry(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(busy())
            })
            .await;

        assert!(logs_contain("Device busy, retrying"));
        assert!(logs_contain("attempt=1"));
    }

    #[tokio::test]
    async fn test_nak_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = with_retry(
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LinkError::new(ErrorKind::Nak, "rejected"))
            },
            3,
            Duration::from_millis(5),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Nak);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_wrap_last_busy() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_secs(1))
            .with_retry(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(busy())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.cause.map(|c| c.kind), Some(ErrorKind::DeviceBusy));
    }

    #[tokio::test]
    async fn test_budget_stops_early() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = RetryPolicy::new(100, Duration::from_millis(40), Duration::from_millis(100))
            .with_retry(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(busy())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(calls.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));

        let task = {
            let cancel = cancel.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                policy
                    .with_retry_cancellable(&cancel, || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(busy())
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_huge_multiplier_saturates_at_max_interval() {
        for multiplier in [1e300, f64::INFINITY, f64::NAN] {
            let policy = RetryPolicy::new(3, Duration::from_millis(2), Duration::from_secs(1))
                .with_backoff(multiplier, Duration::from_millis(5));
            assert!(policy.next_delay(Duration::from_millis(2)) <= Duration::from_millis(5));

            let calls = AtomicU32::new(0);
            let counter = &calls;
            let err = policy
                .with_retry(|| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(busy())
                })
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Timeout);
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        }
    }

    #[test]
    fn test_backoff_builder() {
        let policy = RetryPolicy::default().with_backoff(2.0, Duration::from_millis(800));
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert_eq!(policy.max_interval, Duration::from_millis(800));
    }
}
