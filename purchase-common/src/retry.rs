//! # Retry
//!
//! Module providing a `RetryPolicy` to run fallible storage operations with exponential
//! backoff and jitter.
use std::future::Future;
use std::time;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors that know whether trying again could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Enumeration of the ways `RetryPolicy::run` gives up.
/// Every variant reports how many attempts were actually made.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("all {attempts} attempts failed, last error: {error}")]
    Exhausted { attempts: u32, error: E },
    #[error("attempt {attempts} failed with a non-retryable error: {error}")]
    NonRetryable { attempts: u32, error: E },
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::NonRetryable { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// The last underlying error, if an attempt was made and failed.
    pub fn source_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::NonRetryable { error, .. } => {
                Some(error)
            }
            RetryError::Cancelled { .. } => None,
        }
    }
}

/// Lower and upper bound of the multiplicative jitter applied to every backoff, i.e. ±25%.
const JITTER_RANGE: (f64, f64) = (0.75, 1.25);

#[derive(Clone, Debug)]
/// A retry policy to determine how many times, and how far apart, an operation is attempted.
pub struct RetryPolicy {
    /// Total number of attempts, the first one included. Never less than 1.
    pub max_attempts: u32,
    /// The backoff interval for the first retry. Doubled for every retry after it.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between attempts, applied after jitter.
    pub maximum_interval: time::Duration,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(max_attempts: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts, initial_interval)
    }

    /// Un-jittered backoff to wait after the given failed attempt (1-based).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        std::cmp::min(self.retry_interval_uncapped(attempt), self.maximum_interval)
    }

    /// Backoff to wait after the given failed attempt, with jitter applied.
    pub fn jittered_interval(&self, attempt: u32) -> time::Duration {
        let factor = rand::thread_rng().gen_range(JITTER_RANGE.0..=JITTER_RANGE.1);
        self.apply_jitter(attempt, factor)
    }

    fn apply_jitter(&self, attempt: u32, factor: f64) -> time::Duration {
        let exponential = self.retry_interval_uncapped(attempt).as_nanos() as f64;
        let jittered = (exponential * factor).round();

        if jittered >= self.maximum_interval.as_nanos() as f64 {
            self.maximum_interval
        } else {
            time::Duration::from_nanos(jittered as u64)
        }
    }

    fn retry_interval_uncapped(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_interval
            .checked_mul(2u32.pow(exponent))
            .unwrap_or(time::Duration::MAX)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, runs out of
    /// attempts, or `cancel` fires.
    ///
    /// Cancellation is checked before each attempt and interrupts any backoff sleep.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts });
            }

            attempts += 1;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(RetryError::NonRetryable { attempts, error });
            }

            if attempts >= max_attempts {
                warn!(attempts, "giving up after retryable error: {}", error);
                return Err(RetryError::Exhausted { attempts, error });
            }

            let backoff = self.jittered_interval(attempts);
            debug!(
                attempt = attempts,
                backoff_ms = backoff.as_millis() as u64,
                "retrying after error: {}",
                error
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: time::Duration,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: time::Duration::from_secs(30),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(max_attempts: u32, initial_interval: time::Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = interval;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    #[test]
    fn test_retry_interval_doubles() {
        let retry_policy = RetryPolicy::build(5, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(8));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(50, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(40), time::Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let retry_policy = RetryPolicy::build(5, time::Duration::from_millis(400)).provide();

        assert_eq!(
            retry_policy.apply_jitter(2, 0.75),
            time::Duration::from_millis(600)
        );
        assert_eq!(
            retry_policy.apply_jitter(2, 1.25),
            time::Duration::from_millis(1000)
        );

        for _ in 0..100 {
            let interval = retry_policy.jittered_interval(3);
            assert!(interval >= time::Duration::from_millis(1200));
            assert!(interval <= time::Duration::from_millis(2000));
        }
    }

    #[test]
    fn test_jitter_is_capped_at_maximum() {
        let retry_policy = RetryPolicy::build(5, time::Duration::from_secs(20))
            .maximum_interval(time::Duration::from_secs(30))
            .provide();

        assert_eq!(
            retry_policy.apply_jitter(2, 1.25),
            time::Duration::from_secs(30)
        );
    }

    #[test]
    fn test_zero_attempts_is_one_attempt() {
        let retry_policy = RetryPolicy::build(0, time::Duration::from_secs(1)).provide();
        assert_eq!(retry_policy.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_succeeds_after_transient_failures() {
        let retry_policy = RetryPolicy::build(3, time::Duration::from_millis(100)).provide();
        let calls = AtomicU32::new(0);

        let result = retry_policy
            .run(&CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok("claimed")
                }
            })
            .await;

        assert_eq!(result.expect("retry did not succeed"), "claimed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausts_attempts() {
        let retry_policy = RetryPolicy::build(4, time::Duration::from_millis(100)).provide();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_policy
            .run(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Transient)
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, error }) => {
                assert_eq!(attempts, 4);
                assert_eq!(error, TestError::Transient);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_non_retryable_error() {
        let retry_policy = RetryPolicy::build(5, time::Duration::from_millis(100)).provide();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_policy
            .run(&CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError::Transient)
                } else {
                    Err(TestError::Fatal)
                }
            })
            .await;

        match result {
            Err(RetryError::NonRetryable { attempts, error }) => {
                assert_eq!(attempts, 2);
                assert_eq!(error, TestError::Fatal);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_does_not_attempt_when_already_cancelled() {
        let retry_policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_policy
            .run(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        // A backoff of an hour: only cancellation can end this test in time.
        let retry_policy = RetryPolicy::build(3, time::Duration::from_secs(3600))
            .maximum_interval(time::Duration::from_secs(3600))
            .provide();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let result: Result<(), _> = tokio::time::timeout(
            time::Duration::from_secs(5),
            retry_policy.run(&cancel, || async { Err(TestError::Transient) }),
        )
        .await
        .expect("cancellation did not interrupt backoff");

        assert!(started.elapsed() < time::Duration::from_secs(5));
        match result {
            Err(error) => {
                assert!(error.is_cancelled());
                assert_eq!(error.attempts(), 1);
                assert!(error.source_error().is_none());
            }
            Ok(_) => panic!("expected cancellation"),
        }
    }
}
