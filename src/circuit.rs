//! Fail-fast guard around the remote API.
//!
//! ```text
//!   Closed ──N consecutive outages──▶ Open ──recovery timeout──▶ HalfOpen
//!     ▲                                 ▲                           │
//!     └──────── M trial successes ──────┼───────────────────────────┤
//!                                       └──── any outage ───────────┘
//! ```
//!
//! Only outages (timeouts, network errors, 5xx) count against the remote.
//! A refusal or a rate limit proves the remote is reachable.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::clock::{deadline_after, Clock};
use crate::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time left before an open circuit admits trial calls.
    pub retry_in: Option<Duration>,
    /// Dispatches refused while open.
    pub rejected: u64,
    /// How many times the circuit has opened.
    pub opened: u64,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    trial_successes: u32,
    open_until: Option<Instant>,
    rejected: u64,
    opened: u64,
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerState>,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                trial_successes: 0,
                open_until: None,
                rejected: 0,
                opened: 0,
            }),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            clock,
        }
    }

    /// Admit a dispatch, or report how long until the circuit may half-open.
    pub fn try_enter(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }
        match inner.open_until {
            Some(until) if now < until => {
                inner.rejected += 1;
                Err(until - now)
            }
            _ => {
                inner.state = CircuitState::HalfOpen;
                inner.trial_successes = 0;
                inner.open_until = None;
                info!("circuit half-open, admitting trial dispatches");
                Ok(())
            }
        }
    }

    /// The remote answered.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.trial_successes += 1;
            if inner.trial_successes >= self.success_threshold {
                inner.state = CircuitState::Closed;
                info!("circuit closed");
            }
        }
    }

    /// The remote looked unreachable. Returns `true` if this opened the circuit.
    pub fn record_failure(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.open_until = Some(deadline_after(now, self.recovery_timeout));
            inner.opened += 1;
            warn!(
                consecutive_failures = inner.consecutive_failures,
                recovery_ms = self.recovery_timeout.as_millis() as u64,
                "circuit opened"
            );
        }
        trip
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now();
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            retry_in: inner
                .open_until
                .filter(|until| now < *until)
                .map(|until| until - now),
            rejected: inner.rejected,
            opened: inner.opened,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(failures: u32, successes: u32) -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::new());
        let config = CircuitConfig {
            failure_threshold: failures,
            success_threshold: successes,
            recovery_timeout_ms: 1_000,
        };
        (clock.clone(), CircuitBreaker::new(&config, clock))
    }

    #[test]
    fn opens_after_consecutive_failures_only() {
        let (_clock, cb) = breaker(3, 1);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.snapshot().state, CircuitState::Closed);

        assert!(cb.record_failure());
        assert_eq!(cb.try_enter(), Err(Duration::from_millis(1_000)));
        assert_eq!(cb.snapshot().rejected, 1);
        assert_eq!(cb.snapshot().opened, 1);
    }

    #[test]
    fn half_opens_after_recovery_and_closes_on_trial_successes() {
        let (clock, cb) = breaker(1, 2);
        cb.record_failure();

        clock.advance(Duration::from_millis(999));
        assert!(cb.try_enter().is_err());
        clock.advance(Duration::from_millis(1));
        assert!(cb.try_enter().is_ok());
        assert_eq!(cb.snapshot().state, CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.snapshot().state, CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn trial_failure_reopens_immediately() {
        let (clock, cb) = breaker(5, 1);
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(Duration::from_millis(1_000));
        assert!(cb.try_enter().is_ok());

        assert!(cb.record_failure());
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.retry_in, Some(Duration::from_millis(1_000)));
        assert_eq!(snapshot.opened, 2);
    }
}
