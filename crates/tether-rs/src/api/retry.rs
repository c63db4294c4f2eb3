//! Exponential backoff and circuit breaking for reconnects.
//!
//! [`RetryPolicy`] is static configuration. [`RetryState`] and
//! [`CircuitBreaker`] are the mutable halves, owned by exactly one transport
//! (or tunnel supervisor) and combined in [`Backoff`], which turns each
//! success or failure into a [`RetryDecision`].
//!
//! Everything here is pure: time is passed in as an [`Instant`], so the whole
//! state machine can be driven deterministically in tests.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::duration_secs;

/// Backoff and breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Consecutive failures after which the circuit breaker opens.
    pub max_attempts: u32,
    /// How long an open breaker rejects attempts.
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transport()
    }
}

impl RetryPolicy {
    /// Reference policy for transport reconnects: 1s base, 30s cap, 5 attempts,
    /// 5 minute cool-down.
    pub fn transport() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            cooldown: Duration::from_secs(300),
        }
    }

    /// Reference policy for tunnel restarts: same curve, never gives up.
    pub fn tunnel() -> Self {
        Self {
            max_attempts: u32::MAX,
            ..Self::transport()
        }
    }

    /// Delay for a given attempt number (0-indexed): `min(base * 2^n, max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        self.base_delay
            .saturating_mul(1_u32 << shift)
            .min(self.max_delay)
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

// ── Retry state ────────────────────────────────────────────────────

/// Consecutive-failure counter. Resets only on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt_count: u32,
    pub current_delay: Duration,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt_count: 0,
            current_delay: policy.base_delay,
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Duration {
        let delay = policy.delay_for_attempt(self.attempt_count);
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.current_delay = delay;
        delay
    }

    pub fn has_reached_max_attempts(&self, policy: &RetryPolicy) -> bool {
        self.attempt_count >= policy.max_attempts
    }

    pub fn reset(&mut self, policy: &RetryPolicy) {
        *self = Self::new(policy);
    }
}

// ── Circuit breaker ────────────────────────────────────────────────

/// Snapshot of the breaker's raw state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CircuitBreakerState {
    pub is_open: bool,
    pub opened_at: Option<Instant>,
}

/// Observable breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Normal operation.
    Closed,
    /// Rejecting attempts until the cool-down elapses.
    Open,
    /// Cool-down elapsed; the next attempt is a probe.
    HalfOpen,
}

/// Whether an attempt may proceed, and in which capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed.
    Allowed,
    /// Breaker half-open: this attempt decides whether it closes or reopens.
    Probe,
}

/// Guard that stops attempts for a cool-down after repeated or fatal failures.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitBreakerState,
    cooldown: Duration,
    half_open: bool,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitBreakerState::default(),
            cooldown,
            half_open: false,
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.state
    }

    pub fn status(&self, now: Instant) -> CircuitStatus {
        if self.state.is_open {
            match self.remaining(now) {
                Some(_) => CircuitStatus::Open,
                None => CircuitStatus::HalfOpen,
            }
        } else if self.half_open {
            CircuitStatus::HalfOpen
        } else {
            CircuitStatus::Closed
        }
    }

    /// Time left in the cool-down, or `None` when attempts are allowed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if !self.state.is_open {
            return None;
        }
        let opened_at = self.state.opened_at?;
        let elapsed = now.saturating_duration_since(opened_at);
        self.cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    pub fn is_half_open(&self) -> bool {
        self.half_open
    }

    /// Check whether an attempt may proceed. Moves an expired open breaker to
    /// half-open. Returns the remaining cool-down when rejected.
    pub fn try_acquire(&mut self, now: Instant) -> Result<Admission, Duration> {
        if !self.state.is_open {
            return Ok(if self.half_open {
                Admission::Probe
            } else {
                Admission::Allowed
            });
        }
        if let Some(remaining) = self.remaining(now) {
            return Err(remaining);
        }
        info!("Circuit breaker entering half-open state");
        self.state = CircuitBreakerState::default();
        self.half_open = true;
        Ok(Admission::Probe)
    }

    /// Open (or reopen) with a fresh cool-down starting at `now`.
    pub fn open(&mut self, now: Instant) {
        self.state = CircuitBreakerState {
            is_open: true,
            opened_at: Some(now),
        };
        self.half_open = false;
    }

    pub fn record_success(&mut self) {
        self.force_close();
    }

    pub fn force_close(&mut self) {
        self.state = CircuitBreakerState::default();
        self.half_open = false;
    }
}

// ── Combined ───────────────────────────────────────────────────────

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay.
    RetryAfter(Duration),
    /// The breaker opened; the next attempt is a probe after the cool-down.
    CircuitOpened { cooldown: Duration },
}

/// Retry counter plus circuit breaker, driven by one owner.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retry: RetryState,
    breaker: CircuitBreaker,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            retry: RetryState::new(&policy),
            breaker: CircuitBreaker::new(policy.cooldown),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Gate an attempt. Entering half-open resets the retry counter so the
    /// probe starts a fresh backoff curve.
    pub fn admit(&mut self, now: Instant) -> Result<Admission, Duration> {
        let was_open = self.breaker.state().is_open;
        let admission = self.breaker.try_acquire(now)?;
        if was_open && admission == Admission::Probe {
            self.retry.reset(&self.policy);
        }
        Ok(admission)
    }

    pub fn on_success(&mut self) {
        self.retry.reset(&self.policy);
        self.breaker.record_success();
    }

    pub fn on_failure(&mut self, retryable: bool, now: Instant) -> RetryDecision {
        if self.breaker.is_half_open() {
            warn!("Half-open probe failed; reopening circuit breaker");
            self.retry.record_failure(&self.policy);
            self.breaker.open(now);
            return RetryDecision::CircuitOpened {
                cooldown: self.policy.cooldown,
            };
        }

        let delay = self.retry.record_failure(&self.policy);
        if !retryable || self.retry.has_reached_max_attempts(&self.policy) {
            warn!(
                "Circuit breaker opened after {} failure(s) (retryable: {retryable})",
                self.retry.attempt_count
            );
            self.breaker.open(now);
            return RetryDecision::CircuitOpened {
                cooldown: self.policy.cooldown,
            };
        }
        RetryDecision::RetryAfter(delay)
    }

    /// Manual "try again": clear the counter and close the breaker.
    pub fn reset(&mut self) {
        self.retry.reset(&self.policy);
        self.breaker.force_close();
    }
}
