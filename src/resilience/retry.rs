//! Exponential backoff and retry for backend calls
//!
//! Provides configurable retry strategies with exponential backoff. Every
//! wait is a suspension point that honours a [`CancelSignal`].

use super::cancel::CancelSignal;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Backoff schedule for backend calls and poll loops
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try
    pub max_retries: u32,
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single wait
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Spread waits by up to a quarter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Same as `default()`
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries allowed after the first try
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Wait before the first retry
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Cap on any single wait
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor per attempt, at least 1.0
    pub fn multiplier(mut self, factor: f64) -> Self {
        self.multiplier = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
        self
    }

    /// Spread waits by up to a quarter
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }
}

/// Backoff schedule for one retried operation or poll loop
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Start a schedule at attempt zero
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Wait before the next retry, `None` once retries are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_more() {
            return None;
        }
        Some(self.next_interval())
    }

    /// Next wait without a retry limit, for poll loops bounded by a deadline
    pub fn next_interval(&mut self) -> Duration {
        let wait = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        wait
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.config.max_delay;
        let growth = self.config.multiplier.powi(attempt.min(64) as i32);
        let wait = if growth.is_finite() && self.config.initial_delay.as_secs_f64() * growth < cap.as_secs_f64() {
            self.config.initial_delay.mul_f64(growth)
        } else {
            cap
        };
        if self.config.jitter {
            wait.mul_f64(1.0 + 0.25 * unit_jitter())
        } else {
            wait
        }
    }

    /// Back to attempt zero
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Waits handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether `next_delay` would still yield a wait
    pub fn has_more(&self) -> bool {
        self.attempt < self.config.max_retries
    }
}

/// Uniform value in `[0, 1)`
fn unit_jitter() -> f64 {
    let bits = uuid::Uuid::new_v4().as_u128() as u64;
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

/// How a retried operation ended
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded
    Succeeded {
        /// Returned value
        value: T,
        /// Tries made, including the successful one
        attempts: u32,
    },
    /// Every allowed try failed with a retryable error
    Exhausted {
        /// Last error
        error: E,
        /// Tries made
        attempts: u32,
    },
    /// A non-retryable error stopped the loop
    Rejected {
        /// The error
        error: E,
        /// Tries made
        attempts: u32,
    },
    /// Cancellation was raised while waiting to retry
    Cancelled {
        /// Last error seen, if any try was made
        last_error: Option<E>,
        /// Tries made
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Number of tries made
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Rejected { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Convert into a plain result, mapping cancellation through `on_cancel`
    pub fn into_result(self, on_cancel: impl FnOnce(Option<E>) -> E) -> Result<T, E> {
        match self {
            Self::Succeeded { value, .. } => Ok(value),
            Self::Exhausted { error, .. } | Self::Rejected { error, .. } => Err(error),
            Self::Cancelled { last_error, .. } => Err(on_cancel(last_error)),
        }
    }
}

/// Runs a fallible async operation under a [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Policy using `config`
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy with default backoff
    pub fn default_config() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Policy configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an async operation, retrying every error
    pub async fn execute<F, Fut, T, E>(&self, operation: F, cancel: &CancelSignal) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Debug,
    {
        self.execute_if(operation, |_| true, cancel).await
    }

    /// Retry only errors for which `should_retry` holds
    pub async fn execute_if<F, Fut, T, E, C>(
        &self,
        mut operation: F,
        should_retry: C,
        cancel: &CancelSignal,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Debug,
        C: Fn(&E) -> bool,
    {
        let mut backoff = ExponentialBackoff::new(self.config.clone());
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled {
                    last_error: None,
                    attempts,
                };
            }
            attempts += 1;
            let error = match operation().await {
                Ok(value) => return RetryOutcome::Succeeded { value, attempts },
                Err(e) => e,
            };

            if !should_retry(&error) {
                return RetryOutcome::Rejected { error, attempts };
            }
            let Some(delay) = backoff.next_delay() else {
                return RetryOutcome::Exhausted { error, attempts };
            };

            debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = ?error,
                "Backend call failed, backing off"
            );
            if !cancel.sleep(delay).await {
                return RetryOutcome::Cancelled {
                    last_error: Some(error),
                    attempts,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::cancel::CancelHandle;

    fn quick() -> RetryConfig {
        RetryConfig::default()
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .jitter(false)
    }

    #[test]
    fn test_backoff_doubles_until_exhausted() {
        let config = RetryConfig::new()
            .max_retries(3)
            .initial_delay(Duration::from_millis(250))
            .multiplier(2.0)
            .jitter(false);

        let mut backoff = ExponentialBackoff::new(config);
        let waits: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(1000),
            ]
        );
        assert!(!backoff.has_more());
    }

    #[test]
    fn test_poll_interval_is_capped() {
        let config = RetryConfig::new()
            .max_retries(0)
            .initial_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(60))
            .multiplier(1.5)
            .jitter(false);

        let mut backoff = ExponentialBackoff::new(config);
        assert!(backoff.next_delay().is_none());
        let last = (0..40).map(|_| backoff.next_interval()).last().unwrap();
        assert_eq!(last, Duration::from_secs(60));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig::new()
            .initial_delay(Duration::from_millis(400))
            .multiplier(1.0);
        let mut backoff = ExponentialBackoff::new(config);
        for _ in 0..20 {
            let wait = backoff.next_interval();
            assert!(wait >= Duration::from_millis(400));
            assert!(wait <= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let policy = RetryPolicy::new(quick().max_retries(3));
        let mut calls = 0;

        let outcome: RetryOutcome<i32, &str> = policy
            .execute(
                || {
                    calls += 1;
                    let c = calls;
                    async move {
                        if c < 2 {
                            Err("fail")
                        } else {
                            Ok(42)
                        }
                    }
                },
                &CancelSignal::never(),
            )
            .await;

        assert_eq!(outcome, RetryOutcome::Succeeded { value: 42, attempts: 2 });
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let policy = RetryPolicy::new(quick().max_retries(2));
        let outcome: RetryOutcome<(), &str> = policy
            .execute(|| async { Err("down") }, &CancelSignal::never())
            .await;
        assert_eq!(outcome, RetryOutcome::Exhausted { error: "down", attempts: 3 });
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::new(quick().max_retries(5));
        let outcome: RetryOutcome<(), &str> = policy
            .execute_if(|| async { Err("bad request") }, |e| *e != "bad request", &CancelSignal::never())
            .await;
        assert_eq!(outcome.attempts(), 1);
        assert!(matches!(outcome, RetryOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_cancel_stops_retries() {
        let (handle, signal) = CancelHandle::new();
        handle.cancel();
        let policy = RetryPolicy::new(quick());
        let outcome: RetryOutcome<(), &str> = policy.execute(|| async { Err("down") }, &signal).await;
        assert!(matches!(outcome, RetryOutcome::Cancelled { attempts: 0, .. }));
        assert_eq!(outcome.into_result(|e| e.unwrap_or("cancelled")), Err("cancelled"));
    }
}
