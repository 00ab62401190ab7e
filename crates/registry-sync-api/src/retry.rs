//! Bounded exponential backoff and a consecutive-failure circuit breaker for
//! calls against the remote registry.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("transient network error: {0}")]
    Transient(String),
    #[error("http status {status} from {url}")]
    Http { status: u16, url: String },
    #[error("failed to decode source document: {0}")]
    Decode(String),
    #[error("circuit breaker open; retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl FetchError {
    /// Network faults, rate limiting and server errors are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::CircuitOpen { .. } | Self::RetriesExhausted { .. } => false,
        }
    }

    /// The registry as a whole is unreachable, as opposed to one document
    /// being missing or broken.
    #[must_use]
    pub fn aborts_cycle(&self) -> bool {
        self.is_retryable() || matches!(self, Self::CircuitOpen { .. } | Self::RetriesExhausted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2,
        }
    }

    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1,
        }
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: u32) -> Self {
        self.backoff_multiplier = multiplier.max(1);
        self
    }

    /// Pause before `attempt` (0-indexed). The first attempt never waits.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = self.backoff_multiplier.saturating_pow(attempt - 1);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// Consecutive retryable failures that open the circuit.
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self { failure_threshold: 3, cooldown: Duration::from_secs(60) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until: Instant },
    /// Cooldown elapsed; the next call is a trial.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    consecutive_failures: u32,
    state: BreakerState,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(policy: BreakerPolicy) -> Self {
        Self { policy, consecutive_failures: 0, state: BreakerState::Closed }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// # Errors
    /// Returns `FetchError::CircuitOpen` while the cooldown has not elapsed.
    pub fn check(&mut self, now: Instant) -> Result<(), FetchError> {
        if let BreakerState::Open { until } = self.state {
            if now < until {
                return Err(FetchError::CircuitOpen { retry_after: until - now });
            }
            tracing::info!("circuit breaker half-open; allowing trial request");
            self.state = BreakerState::HalfOpen;
        }
        Ok(())
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            tracing::info!("circuit breaker closed");
        }
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let trial_failed = self.state == BreakerState::HalfOpen;
        if trial_failed || self.consecutive_failures >= self.policy.failure_threshold {
            tracing::warn!(
                failures = self.consecutive_failures,
                cooldown_secs = self.policy.cooldown.as_secs(),
                "circuit breaker opened"
            );
            self.state = BreakerState::Open { until: now + self.policy.cooldown };
        }
    }
}

/// Runs fallible calls under a [`RetryPolicy`] and a shared [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl Retrier {
    #[must_use]
    pub fn new(policy: RetryPolicy, breaker: BreakerPolicy) -> Self {
        Self { policy, breaker: CircuitBreaker::new(breaker) }
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// # Errors
    /// Returns the first non-retryable error, `CircuitOpen` once the breaker
    /// trips, or `RetriesExhausted` after the last attempt.
    pub fn call<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut() -> Result<T, FetchError>,
    ) -> Result<T, FetchError> {
        let mut last_error = None;

        for attempt in 0..self.policy.max_attempts {
            self.breaker.check(Instant::now())?;

            let delay = self.policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tracing::debug!(what, attempt, delay_ms = delay.as_millis(), "backing off");
                std::thread::sleep(delay);
            }

            match op() {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(what, attempt, error = %err, "retryable fetch failure");
                    self.breaker.record_failure(Instant::now());
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts: self.policy.max_attempts,
            last: last_error.map(|err| err.to_string()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_initial_delay(Duration::ZERO)
    }

    // Test IDs: TRTY-001
    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    // Test IDs: TRTY-002
    #[test]
    fn transient_failures_are_retried_until_success() {
        let mut retrier = Retrier::new(fast_policy(5), BreakerPolicy::default());
        let mut calls = 0;

        let result = retrier.call("listing", || {
            calls += 1;
            if calls < 3 {
                Err(FetchError::Transient("connection reset".to_string()))
            } else {
                Ok(calls)
            }
        });

        assert_eq!(result, Ok(3));
        assert_eq!(retrier.breaker().state(), BreakerState::Closed);
    }

    // Test IDs: TRTY-003
    #[test]
    fn attempts_are_bounded() {
        let policy = BreakerPolicy { failure_threshold: 100, cooldown: Duration::from_secs(60) };
        let mut retrier = Retrier::new(fast_policy(4), policy);
        let mut calls = 0;

        let result: Result<(), FetchError> = retrier.call("listing", || {
            calls += 1;
            Err(FetchError::Http { status: 503, url: "u".to_string() })
        });

        assert_eq!(calls, 4);
        assert!(matches!(result, Err(FetchError::RetriesExhausted { attempts: 4, .. })));
    }

    // Test IDs: TRTY-004
    #[test]
    fn breaker_opens_after_threshold_and_short_circuits() {
        let mut retrier = Retrier::new(fast_policy(5), BreakerPolicy::default());
        let mut calls = 0;

        let result: Result<(), FetchError> = retrier.call("detail", || {
            calls += 1;
            Err(FetchError::Transient("timeout".to_string()))
        });

        assert_eq!(calls, 3);
        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));

        let again: Result<(), FetchError> = retrier.call("detail", || Ok(()));
        assert!(matches!(again, Err(FetchError::CircuitOpen { .. })));
    }

    // Test IDs: TRTY-005
    #[test]
    fn client_errors_fail_fast() {
        let mut retrier = Retrier::new(fast_policy(5), BreakerPolicy::default());
        let mut calls = 0;

        let result: Result<(), FetchError> = retrier.call("detail", || {
            calls += 1;
            Err(FetchError::Http { status: 404, url: "u".to_string() })
        });

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(FetchError::Http { status: 404, .. })));
    }

    // Test IDs: TRTY-007
    #[test]
    fn only_registry_wide_failures_abort_a_cycle() {
        assert!(!FetchError::Http { status: 404, url: "u".to_string() }.aborts_cycle());
        assert!(!FetchError::Decode("bad".to_string()).aborts_cycle());
        assert!(FetchError::Http { status: 503, url: "u".to_string() }.aborts_cycle());
        assert!(FetchError::CircuitOpen { retry_after: Duration::from_secs(1) }.aborts_cycle());
        assert!(FetchError::RetriesExhausted { attempts: 3, last: String::new() }.aborts_cycle());
    }

    // Test IDs: TRTY-006
    #[test]
    fn breaker_half_opens_after_cooldown() {
        let policy = BreakerPolicy { failure_threshold: 2, cooldown: Duration::from_secs(10) };
        let mut breaker = CircuitBreaker::new(policy);
        let start = Instant::now();

        breaker.record_failure(start);
        assert!(breaker.check(start).is_ok());
        breaker.record_failure(start);
        assert!(breaker.check(start + Duration::from_secs(5)).is_err());

        assert!(breaker.check(start + Duration::from_secs(10)).is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure(start + Duration::from_secs(10));
        assert!(matches!(breaker.state(), BreakerState::Open { .. }));
        assert!(breaker.check(start + Duration::from_secs(20)).is_ok());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
