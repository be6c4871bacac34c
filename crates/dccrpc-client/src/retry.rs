use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dccrpc_common::config::RetrySettings;
use dccrpc_common::protocol::error::{Result, RpcError};
use rand::Rng;

type RetryPredicate = Arc<dyn Fn(&RpcError) -> bool + Send + Sync>;

/// Upper bound for `backoff_factor` taken from settings.
const MAX_BACKOFF_FACTOR: f64 = 100.0;

/// Retry with exponential backoff for transient failures.
///
/// On a retryable failure the policy sleeps
/// `min(delay * (1 ± jitter), max_delay)`, then grows `delay` by
/// `backoff_factor` (capped at `max_delay`). After `max_attempts` tries the
/// last error is returned unchanged. Errors that are not retryable are
/// returned immediately.
///
/// By default only [`RpcError::is_transient`] errors are retried.
///
/// # Example
///
/// ```
/// use dccrpc_client::RetryPolicy;
/// use dccrpc_common::RpcError;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 3,
///     initial_delay: Duration::from_millis(1),
///     ..RetryPolicy::default()
/// };
///
/// let mut calls = 0;
/// let value = policy.run(|_attempt| {
///     calls += 1;
///     if calls < 2 {
///         Err(RpcError::Connection("refused".into()))
///     } else {
///         Ok(42)
///     }
/// });
/// assert_eq!(value.unwrap(), 42);
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Relative jitter in `[0, 1]` applied to each sleep.
    pub jitter: f64,
    pub retry_if: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: 0.1,
            retry_if: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .field("custom_predicate", &self.retry_if.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_factor: if settings.backoff_factor.is_finite() {
                settings.backoff_factor.clamp(1.0, MAX_BACKOFF_FACTOR)
            } else {
                Self::default().backoff_factor
            },
            jitter: if settings.jitter.is_finite() {
                settings.jitter.clamp(0.0, 1.0)
            } else {
                0.0
            },
            retry_if: None,
        }
    }

    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Replaces the transient-error check with a custom predicate.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RpcError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    pub fn is_retryable(&self, err: &RpcError) -> bool {
        match &self.retry_if {
            Some(predicate) => predicate(err),
            None => err.is_transient(),
        }
    }

    /// Runs `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.initial_delay.min(self.max_delay);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && self.is_retryable(&e) => {
                    let sleep = self.jittered(delay);
                    tracing::debug!(
                        attempt,
                        max_attempts,
                        delay_ms = sleep.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    thread::sleep(sleep);
                    delay = self.next_delay(delay);
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 1 {
                        tracing::warn!(attempts = attempt, error = %e, "Giving up after retries");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Grows `delay` by the backoff factor. Overflow saturates at `max_delay`.
    fn next_delay(&self, delay: Duration) -> Duration {
        let factor = if self.backoff_factor.is_nan() { 1.0 } else { self.backoff_factor.max(1.0) };
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = if self.jitter.is_finite() { self.jitter.clamp(0.0, 1.0) } else { 0.0 };
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .unwrap_or(delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            jitter: 0.0,
            retry_if: None,
        }
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let policy = fast_policy(5);
        let mut calls = 0;
        let result = policy.run(|_| {
            calls += 1;
            if calls <= 3 {
                Err(RpcError::Timeout(10))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_exhausts_attempts_and_respects_backoff() {
        let policy = fast_policy(4);
        let mut attempts = Vec::new();
        let start = Instant::now();

        let result: Result<()> = policy.run(|attempt| {
            attempts.push(attempt);
            Err(RpcError::Connection(format!("refused {}", attempt)))
        });

        assert_eq!(attempts, vec![1, 2, 3, 4]);
        // 10 + 20 + 40 ms of pre-jitter backoff
        assert!(start.elapsed() >= Duration::from_millis(70));
        match result {
            Err(RpcError::Connection(message)) => assert_eq!(message, "refused 4"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_non_transient_errors_are_not_retried() {
        let policy = fast_policy(5);
        let mut calls = 0;
        let result: Result<()> = policy.run(|_| {
            calls += 1;
            Err(RpcError::FunctionNotFound("missing".into()))
        });
        assert!(matches!(result, Err(RpcError::FunctionNotFound(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_custom_predicate() {
        let policy = fast_policy(3).retry_if(|e| e.kind() == "Script");
        let mut calls = 0;
        let _: Result<()> = policy.run(|_| {
            calls += 1;
            Err(RpcError::Script("flaky".into()))
        });
        assert_eq!(calls, 3);

        let mut calls = 0;
        let _: Result<()> = policy.run(|_| {
            calls += 1;
            Err(RpcError::Timeout(1))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(50),
            jitter: 1.0,
            ..fast_policy(3)
        };
        for _ in 0..100 {
            assert!(policy.jittered(Duration::from_millis(40)) <= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_extreme_backoff_saturates() {
        let policy = RetryPolicy {
            backoff_factor: 1e308,
            max_delay: Duration::from_millis(30),
            ..fast_policy(4)
        };
        assert_eq!(policy.next_delay(Duration::from_secs(5)), Duration::from_millis(30));

        let mut calls = 0;
        let result: Result<()> = policy.run(|_| {
            calls += 1;
            Err(RpcError::Timeout(1))
        });
        assert!(result.is_err());
        assert_eq!(calls, 4);

        let nan = RetryPolicy {
            backoff_factor: f64::NAN,
            jitter: f64::NAN,
            ..fast_policy(2)
        };
        assert_eq!(nan.next_delay(Duration::from_millis(10)), Duration::from_millis(10));
        assert_eq!(nan.jittered(Duration::from_millis(10)), Duration::from_millis(10));
    }

    #[test]
    fn test_settings_are_sanitized() {
        let policy = RetryPolicy::from_settings(&RetrySettings {
            max_attempts: 0,
            backoff_factor: 1e308,
            jitter: 7.0,
            ..RetrySettings::default()
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_factor, MAX_BACKOFF_FACTOR);
        assert_eq!(policy.jitter, 1.0);

        let policy = RetryPolicy::from_settings(&RetrySettings {
            backoff_factor: f64::INFINITY,
            ..RetrySettings::default()
        });
        assert_eq!(policy.backoff_factor, 2.0);
    }
}
