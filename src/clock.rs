//! Time source for everything that waits or expires.
//!
//! The dedup cache, rate-limit tracker and dispatcher never call
//! `tokio::time` directly; they go through a [`Clock`] so retry and
//! reset behaviour can be exercised without real time passing.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Longest single wait the crate will schedule. Remote-supplied delays and
/// configured windows beyond this are capped.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// `now + wait`, capped at [`MAX_WAIT`] and never panicking on overflow.
pub(crate) fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait.min(MAX_WAIT)).unwrap_or(now)
}

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Suspend the calling task until `deadline`. Returns immediately if it has passed.
    async fn sleep_until(&self, deadline: Instant);

    async fn sleep(&self, duration: Duration) {
        let deadline = deadline_after(self.now(), duration);
        self.sleep_until(deadline).await;
    }
}

/// Production clock backed by the tokio timer.
///
/// Honours `tokio::time::pause`, so paused-time tests work with it too.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Virtual clock: sleeping advances time instantly and is recorded.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    inner: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            inner: Mutex::new(ManualState::default()),
        }
    }

    /// Move time forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.offset += by;
    }

    /// Virtual time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).offset
    }

    /// Every non-zero sleep taken so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).sleeps.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    async fn sleep_until(&self, deadline: Instant) {
        {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let now = self.base + state.offset;
            if deadline > now {
                let slept = deadline - now;
                state.offset += slept;
                state.sleeps.push(slept);
            }
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(5)).await;
        clock.sleep_until(start).await; // already passed

        assert_eq!(clock.now() - start, Duration::from_secs(5));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn oversized_sleep_is_capped() {
        let clock = ManualClock::new();
        clock.sleep(Duration::from_secs(u64::MAX)).await;
        assert_eq!(clock.sleeps(), vec![MAX_WAIT]);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep(Duration::from_millis(250)).await;
        assert!(clock.now() - start >= Duration::from_millis(250));
    }
}
