//! Deadline-aware retry policy for calls to external collaborators (object
//! store, record store, inference endpoint).
//!
//! Retries are driven entirely by [`WorkflowError::retryable`] — callers
//! never need a per-call try/catch ladder; they just classify the native
//! error (via `vvw_error::classify`) and hand the result to [`retry`].

use std::time::Duration;
use tracing::warn;
use vvw_error::{ErrorCode, WorkflowError};

/// A deadline derived from `min(stage_timeout, remaining_invocation_time)`,
/// per the cancellation semantics in §5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Per-stage timeout (e.g. 240s default).
    pub stage_timeout: Duration,
    /// Time remaining in the enclosing invocation, if bounded.
    pub remaining_invocation_time: Option<Duration>,
}

impl TimeoutConfig {
    /// A config with no invocation-level bound, just a stage timeout.
    #[must_use]
    pub fn from_stage_timeout(stage_timeout: Duration) -> Self {
        Self { stage_timeout, remaining_invocation_time: None }
    }

    /// The effective deadline: the smaller of the two bounds.
    #[must_use]
    pub fn effective_deadline(&self) -> Duration {
        match self.remaining_invocation_time {
            Some(remaining) => self.stage_timeout.min(remaining),
            None => self.stage_timeout,
        }
    }
}

/// Exponential-backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Start building a policy from defaults (`max_attempts = 3`,
    /// `base_delay = 1s`, per §6's `RETRY_MAX_ATTEMPTS`/`RETRY_BASE_DELAY`
    /// defaults).
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Total attempts this policy will make (including the first).
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the `attempt`-th retry (1-indexed): `base_delay *
    /// 2^(attempt - 1)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }

    /// Run `op`, retrying on retryable [`WorkflowError`]s until
    /// `max_attempts` is exhausted or `deadline` elapses. Non-retryable
    /// errors are returned immediately.
    ///
    /// # Errors
    ///
    /// Returns the last classified [`WorkflowError`] if every attempt
    /// fails, or a [`ErrorCode::TimeoutError`] if the deadline is exhausted
    /// before another attempt can be made.
    pub async fn retry<T, F, Fut>(&self, deadline: Duration, mut op: F) -> Result<T, WorkflowError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, WorkflowError>>,
    {
        let start = tokio::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let remaining = deadline.checked_sub(start.elapsed());
            let Some(remaining) = remaining else {
                return Err(WorkflowError::new(
                    ErrorCode::TimeoutError,
                    "retry deadline exhausted before attempt could run",
                ));
            };

            let attempt_result = tokio::time::timeout(remaining, op()).await;
            let result = match attempt_result {
                Ok(r) => r,
                Err(_elapsed) => {
                    return Err(WorkflowError::new(ErrorCode::TimeoutError, "operation deadline exceeded"));
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if !err.retryable || attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    let delay = self.delay_for_attempt(attempt);
                    let elapsed = start.elapsed();
                    if elapsed + delay >= deadline {
                        warn!(code = %err.code, attempt, "retry abandoned: insufficient remaining budget");
                        return Err(err);
                    }
                    warn!(code = %err.code, attempt, delay_ms = delay.as_millis() as u64, "retrying after transient error");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Override the maximum number of attempts (including the first).
    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// Override the base delay used for exponential backoff.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Finalize the policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry_on_first_success() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result = policy
            .retry(Duration::from_secs(10), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, WorkflowError>(42) }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_error_then_succeeds() {
        let policy = RetryPolicy::builder().max_attempts(3).base_delay(Duration::from_millis(10)).build();
        let calls = AtomicU32::new(0);
        let result = policy
            .retry(Duration::from_secs(10), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(WorkflowError::new(ErrorCode::TimeoutError, "transient").retryable(true))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returns_immediately() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let err = policy
            .retry(Duration::from_secs(10), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(WorkflowError::new(ErrorCode::ValidationError, "bad input")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_max_attempts_then_returns_last_error() {
        let policy = RetryPolicy::builder().max_attempts(2).base_delay(Duration::from_millis(1)).build();
        let calls = AtomicU32::new(0);
        let err = policy
            .retry(Duration::from_secs(10), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(WorkflowError::new(ErrorCode::S3Error, "still throttled").retryable(true)) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::S3Error);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy::builder().base_delay(Duration::from_millis(100)).build();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn effective_deadline_is_the_tighter_bound() {
        let cfg = TimeoutConfig {
            stage_timeout: Duration::from_secs(240),
            remaining_invocation_time: Some(Duration::from_secs(30)),
        };
        assert_eq!(cfg.effective_deadline(), Duration::from_secs(30));
    }
}
