//! Open-suspending circuit breaker.
//!
//! Trips after `failure_threshold` consecutive *retryable* venue failures
//! inside `failure_window`; fatal errors bypass the count (they halt opens
//! through the engine's own error taxonomy instead). While open, new
//! position opens are suspended; closes are never gated here. After
//! `cooldown` the breaker lets one trial open through (half-open) and fully
//! closes again on its success.
//!
//! ## States
//! - **Closed**: opens pass through.
//! - **Open**: opens suspended until the cooldown elapses.
//! - **HalfOpen**: one trial open allowed; success closes the breaker,
//!   failure re-opens it.
//!
//! Lock-free: the allow/record paths use only atomics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::exchange::ExchangeError;

/// Breaker state (encoded as u32 for atomic storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive retryable failures that trip the breaker.
    pub failure_threshold: u32,
    /// Failures older than this no longer count as consecutive.
    pub failure_window: Duration,
    /// How long opens stay suspended before a trial call is allowed.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(120),
            cooldown: Duration::from_secs(60),
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU32,
    failure_count: AtomicU32,
    /// First/last failure of the current run, nanos since `epoch`.
    first_failure_nanos: AtomicU64,
    last_failure_nanos: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU32::new(BreakerState::Closed as u32),
            failure_count: AtomicU32::new(0),
            first_failure_nanos: AtomicU64::new(0),
            last_failure_nanos: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    #[inline]
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Whether a new open may be submitted right now. Transitions
    /// Open → HalfOpen once the cooldown has elapsed; the call that observes
    /// the transition is the trial call.
    pub fn allows_open(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            0 | 2 => true,
            _ => {
                let last = self.last_failure_nanos.load(Ordering::Acquire);
                let elapsed = self.now_nanos().saturating_sub(last);
                if elapsed > self.config.cooldown.as_nanos() as u64 {
                    if self
                        .state
                        .compare_exchange(
                            BreakerState::Open as u32,
                            BreakerState::HalfOpen as u32,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        info!("Circuit breaker cooldown elapsed, allowing trial open");
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record the outcome of an exchange-facing call. Only retryable errors
    /// feed the failure count; successes fully close the breaker.
    pub fn record_outcome(&self, result: Result<(), &ExchangeError>) {
        match result {
            Ok(()) => self.record_success(),
            Err(e) if e.is_retryable() => self.record_retryable_failure(),
            Err(_) => {}
        }
    }

    pub fn record_success(&self) {
        let prior = self
            .state
            .swap(BreakerState::Closed as u32, Ordering::AcqRel);
        self.failure_count.store(0, Ordering::Release);
        if prior == BreakerState::HalfOpen as u32 {
            info!("Circuit breaker trial open succeeded, closing breaker");
        }
    }

    /// Count one retryable failure, tripping the breaker at the threshold.
    pub fn record_retryable_failure(&self) {
        let now = self.now_nanos();
        let window = self.config.failure_window.as_nanos() as u64;

        // A failure outside the window starts a fresh run.
        let first = self.first_failure_nanos.load(Ordering::Acquire);
        let count = self.failure_count.load(Ordering::Acquire);
        let new_count = if count == 0 || now.saturating_sub(first) > window {
            self.first_failure_nanos.store(now, Ordering::Release);
            self.failure_count.store(1, Ordering::Release);
            1
        } else {
            self.failure_count.fetch_add(1, Ordering::AcqRel) + 1
        };
        self.last_failure_nanos.store(now, Ordering::Release);

        let current = self.state.load(Ordering::Acquire);
        let should_trip =
            new_count >= self.config.failure_threshold || current == BreakerState::HalfOpen as u32;
        if should_trip
            && current != BreakerState::Open as u32
            && self
                .state
                .compare_exchange(
                    current,
                    BreakerState::Open as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            warn!(
                failures = new_count,
                threshold = self.config.failure_threshold,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit breaker OPEN - suspending new position opens"
            );
        }
    }

    pub fn reset(&self) {
        self.state
            .store(BreakerState::Closed as u32, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.first_failure_nanos.store(0, Ordering::Release);
        self.last_failure_nanos.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, cooldown_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_millis(cooldown_ms),
        }
    }

    #[test]
    fn test_starts_closed() {
        let breaker = CircuitBreaker::with_defaults();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allows_open());
    }

    #[test]
    fn test_trips_after_threshold() {
        let breaker = CircuitBreaker::new(config(3, 10_000));
        let timeout = ExchangeError::Timeout("t".into());

        breaker.record_outcome(Err(&timeout));
        breaker.record_outcome(Err(&timeout));
        assert!(breaker.allows_open());

        breaker.record_outcome(Err(&timeout));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allows_open());
    }

    #[test]
    fn test_fatal_errors_do_not_count() {
        let breaker = CircuitBreaker::new(config(2, 10_000));
        let auth = ExchangeError::Auth("denied".into());

        breaker.record_outcome(Err(&auth));
        breaker.record_outcome(Err(&auth));
        breaker.record_outcome(Err(&auth));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_success_resets() {
        let breaker = CircuitBreaker::new(config(3, 10_000));
        let timeout = ExchangeError::Timeout("t".into());

        breaker.record_outcome(Err(&timeout));
        breaker.record_outcome(Err(&timeout));
        breaker.record_outcome(Ok(()));
        assert_eq!(breaker.failure_count(), 0);

        breaker.record_outcome(Err(&timeout));
        breaker.record_outcome(Err(&timeout));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_trial_after_cooldown() {
        let breaker = CircuitBreaker::new(config(2, 1));
        let timeout = ExchangeError::Timeout("t".into());

        breaker.record_outcome(Err(&timeout));
        breaker.record_outcome(Err(&timeout));
        assert!(!breaker.allows_open());

        std::thread::sleep(Duration::from_millis(10));

        // Cooldown elapsed: trial allowed.
        assert!(breaker.allows_open());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Trial success closes the breaker for good.
        breaker.record_outcome(Ok(()));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(config(2, 1));
        let timeout = ExchangeError::Timeout("t".into());

        breaker.record_outcome(Err(&timeout));
        breaker.record_outcome(Err(&timeout));
        std::thread::sleep(Duration::from_millis(10));
        assert!(breaker.allows_open());

        // A single failure in HalfOpen trips it again immediately.
        breaker.record_outcome(Err(&timeout));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allows_open());
    }
}
