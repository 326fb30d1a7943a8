//! Retry with exponential backoff and per-resource circuit breaking.
//!
//! [`ResiliencePolicy`] composes the two as `retry(breaker(op))`: every
//! attempt the retry loop makes passes through the breaker, so a failing
//! resource trips its breaker and the retry loop then stops at once on
//! [`SwarmError::CircuitOpen`] instead of burning its remaining attempts.
//!
//! All waits use `tokio::time`, so they honor paused test time and are
//! raced against a [`CancellationToken`].

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SwarmError};

/// Attempt budget and backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether the final failed attempt also waits out its delay before giving up.
    pub backoff_after_last_attempt: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            backoff_after_last_attempt: false,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay following the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let delay_millis = (self.initial_delay.as_millis() as f64 * multiplier) as u64;
        Duration::from_millis(delay_millis)
    }

    /// Check whether another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
///
/// Returns [`SwarmError::Cancelled`] as soon as `cancel` fires, whether the
/// operation or a backoff delay is in flight.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SwarmError::Cancelled),
            result = op() => result,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        let exhausted = !policy.should_retry(attempt);
        if exhausted && !policy.backoff_after_last_attempt {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            operation,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, backing off"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SwarmError::Cancelled),
            () = sleep(delay) => {}
        }

        if exhausted {
            return Err(err);
        }
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive faults that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// Cooldown elapsed; a single trial call decides the next state.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Suppresses calls to a repeatedly failing resource for a cooldown window.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Admission ticket for one call. Releases a half-open trial slot on drop,
/// so a cancelled trial does not wedge the breaker.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Consecutive failures recorded since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
            }),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.cooldown {
                    debug!("circuit cooldown elapsed, admitting trial call");
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(Permit {
                        breaker: self,
                        trial: true,
                    })
                } else {
                    Err(SwarmError::CircuitOpen {
                        retry_after: self.config.cooldown - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(SwarmError::CircuitOpen {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit {
                        breaker: self,
                        trial: true,
                    })
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!("circuit closed after successful trial");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if trip && inner.state != BreakerState::Open {
            warn!(
                failures = inner.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Run `fut` through the breaker.
    ///
    /// When the breaker rejects the call, `fut` is dropped unpolled and
    /// [`SwarmError::CircuitOpen`] is returned.
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.acquire()?;
        let result = fut.await;
        match &result {
            Ok(_) => self.on_success(),
            Err(e) if e.counts_against_breaker() => self.on_failure(),
            Err(_) => {}
        }
        result
    }
}

/// Retry wrapped around a circuit breaker, owned per resource.
#[derive(Debug)]
pub struct ResiliencePolicy {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResiliencePolicy {
    /// Create a policy with its own breaker.
    #[must_use]
    pub fn new(retry: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self {
            retry,
            breaker: CircuitBreaker::new(breaker),
        }
    }

    /// The retry schedule.
    #[must_use]
    pub const fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The breaker guarding this resource.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Execute `op` as `retry(breaker(op))`.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.retry, cancel, operation, || self.breaker.call(op())).await
    }
}
