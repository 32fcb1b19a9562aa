//! Shared retry and polling policies.
//!
//! Every component that talks to an external service retries through
//! [`BackoffPolicy`]: a fixed attempt cap, a transient-vs-permanent
//! classifier (the [`Transient`] trait) and a delay function. Long-running
//! remote jobs are polled through [`PollPolicy`].

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Classifies an error as worth retrying.
pub trait Transient {
    /// Returns true for network failures, rate limits and overload responses.
    fn is_transient(&self) -> bool;
}

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayStrategy {
    /// Same delay after every failed attempt.
    Fixed,
    /// `base × attempt`.
    Linear,
    /// `base × 2^(attempt - 1)`.
    Exponential,
}

/// Retry policy for a single external call.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay unit the strategy scales.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    pub strategy: DelayStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            strategy: DelayStrategy::Linear,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, strategy: DelayStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(60),
            strategy,
        }
    }

    /// A policy that never sleeps; used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, DelayStrategy::Fixed)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            DelayStrategy::Fixed => self.base_delay,
            DelayStrategy::Linear => self.base_delay.saturating_mul(attempt),
            DelayStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt cap is hit.
    ///
    /// `op` receives the 1-based attempt number. Non-transient errors are
    /// returned immediately without sleeping.
    pub async fn retry<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Transient + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = label,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => {
                    debug!(operation = label, attempt = attempt, error = %err, "Giving up");
                    return Err(err);
                }
            }
        }
    }
}

/// Fixed-interval polling with a hard cap on the number of polls.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        // 180 polls at 10s = 30 minutes
        Self {
            interval: Duration::from_secs(10),
            max_polls: 180,
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls: max_polls.max(1),
        }
    }

    /// Total wall time the policy allows before timing out.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_polls)
    }

    /// Sleeps one interval.
    pub async fn wait(&self) {
        if !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (transient={})", self.transient)
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[test]
    fn test_linear_delay_scales_with_attempt() {
        let policy = BackoffPolicy::new(3, Duration::from_secs(2), DelayStrategy::Linear);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(6));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = BackoffPolicy::new(10, Duration::from_secs(1), DelayStrategy::Exponential)
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_poll_budget() {
        assert_eq!(PollPolicy::default().budget(), Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::immediate(3);

        let result: Result<u32, TestError> = policy
            .retry("op", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(TestError { transient: true })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_cap() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::immediate(3);

        let result: Result<(), TestError> = policy
            .retry("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: true }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::immediate(3);

        let result: Result<(), TestError> = policy
            .retry("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: false }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
