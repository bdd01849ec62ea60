//! Per-resource call budgets plus the remote-wide lockout.
//!
//! Each resource moves between three states:
//!
//! ```text
//!   Open ──decrement to 0──▶ Exhausted ──reset elapses──▶ Open
//!     └──────────── global signal ────────▶ GloballyLocked ──global reset──▶ (previous)
//! ```
//!
//! Transitions out of a waiting state are lazy: they happen on the next
//! access, never on a background timer. Budgets are only raised by the
//! remote side's own numbers or by a reset restoring the ceiling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::{deadline_after, Clock};
use crate::config::RateLimitConfig;
use crate::types::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BucketState {
    Open,
    Exhausted,
    GloballyLocked,
}

/// Budget metadata reported by the remote side on a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitUpdate {
    /// New ceiling, if the remote reported one.
    pub limit: Option<u32>,
    pub remaining: u32,
    pub reset_after: Duration,
}

/// Why a call may not proceed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wait {
    pub until: Instant,
    pub global: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub resource: ResourceId,
    pub state: BucketState,
    pub remaining: u32,
    pub ceiling: u32,
    pub resets_in: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    /// Time left on the global lockout, if one is active.
    pub global_lockout: Option<Duration>,
    pub buckets: Vec<BucketSnapshot>,
}

#[derive(Debug, Clone)]
struct Bucket {
    ceiling: u32,
    remaining: u32,
    reset_at: Instant,
}

#[derive(Default)]
struct TrackerState {
    buckets: HashMap<ResourceId, Bucket>,
    global_reset: Option<Instant>,
}

pub struct RateLimitTracker {
    state: Mutex<TrackerState>,
    default_budget: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimitTracker {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            default_budget: config.default_budget.max(1),
            window: config.window(),
            clock,
        }
    }

    /// Take one unit of budget for `resource`, or report how long to wait.
    ///
    /// The lock is released before returning, so callers wait without holding it.
    pub async fn try_acquire(&self, resource: &ResourceId) -> Result<(), Wait> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if let Some(reset) = state.global_reset {
            if now < reset {
                return Err(Wait { until: reset, global: true });
            }
            state.global_reset = None;
            info!("global rate limit lifted");
        }

        let bucket = state
            .buckets
            .entry(resource.clone())
            .or_insert_with(|| Bucket {
                ceiling: self.default_budget,
                remaining: self.default_budget,
                reset_at: deadline_after(now, self.window),
            });

        if now >= bucket.reset_at {
            bucket.remaining = bucket.ceiling;
            bucket.reset_at = deadline_after(now, self.window);
            debug!(resource = %resource, budget = bucket.ceiling, "rate limit bucket reset");
        }

        if bucket.remaining == 0 {
            return Err(Wait { until: bucket.reset_at, global: false });
        }

        bucket.remaining -= 1;
        if bucket.remaining == 0 {
            debug!(resource = %resource, "rate limit bucket exhausted");
        }
        Ok(())
    }

    /// Overwrite local estimates with what the remote side reported.
    pub async fn apply_update(&self, resource: &ResourceId, update: &RateLimitUpdate) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let ceiling = update.limit.unwrap_or(self.default_budget).max(1);

        let bucket = state
            .buckets
            .entry(resource.clone())
            .or_insert_with(|| Bucket {
                ceiling,
                remaining: update.remaining,
                reset_at: deadline_after(now, update.reset_after),
            });

        if let Some(limit) = update.limit {
            bucket.ceiling = limit.max(1);
        }
        bucket.remaining = update.remaining;
        bucket.reset_at = deadline_after(now, update.reset_after);

        if update.remaining > 0 && update.remaining <= 2 {
            warn!(
                resource = %resource,
                remaining = update.remaining,
                ceiling = bucket.ceiling,
                "rate limit budget nearly exhausted"
            );
        }
    }

    /// Record an explicit rate-limit rejection.
    ///
    /// A global signal locks every resource until `retry_after` elapses.
    pub async fn apply_rate_limited(&self, resource: &ResourceId, retry_after: Duration, global: bool) {
        let now = self.clock.now();
        let reset_at = deadline_after(now, retry_after);
        let mut state = self.state.lock().await;

        if global {
            let until = state.global_reset.map_or(reset_at, |existing| existing.max(reset_at));
            state.global_reset = Some(until);
            warn!(
                resource = %resource,
                retry_after_ms = retry_after.as_millis() as u64,
                "global rate limit hit"
            );
            return;
        }

        let default_budget = self.default_budget;
        let bucket = state
            .buckets
            .entry(resource.clone())
            .or_insert_with(|| Bucket {
                ceiling: default_budget,
                remaining: 0,
                reset_at,
            });
        bucket.remaining = 0;
        bucket.reset_at = reset_at;
        info!(
            resource = %resource,
            retry_after_ms = retry_after.as_millis() as u64,
            "resource rate limit hit"
        );
    }

    pub async fn state(&self, resource: &ResourceId) -> BucketState {
        let now = self.clock.now();
        let state = self.state.lock().await;
        if state.global_reset.is_some_and(|reset| now < reset) {
            return BucketState::GloballyLocked;
        }
        match state.buckets.get(resource) {
            Some(bucket) => bucket_state(bucket, now),
            None => BucketState::Open,
        }
    }

    pub async fn snapshot(&self) -> RateLimitSnapshot {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let global_lockout = state
            .global_reset
            .filter(|reset| now < *reset)
            .map(|reset| reset - now);

        let mut buckets: Vec<BucketSnapshot> = state
            .buckets
            .iter()
            .map(|(resource, bucket)| {
                let refreshed = now >= bucket.reset_at;
                BucketSnapshot {
                    resource: resource.clone(),
                    state: if global_lockout.is_some() {
                        BucketState::GloballyLocked
                    } else {
                        bucket_state(bucket, now)
                    },
                    remaining: if refreshed { bucket.ceiling } else { bucket.remaining },
                    ceiling: bucket.ceiling,
                    resets_in: bucket.reset_at.saturating_duration_since(now),
                }
            })
            .collect();
        buckets.sort_by(|a, b| a.resource.cmp(&b.resource));

        RateLimitSnapshot { global_lockout, buckets }
    }

    /// Forget buckets whose reset has passed and a lapsed global lockout.
    pub async fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.global_reset.is_some_and(|reset| now >= reset) {
            state.global_reset = None;
        }
        let before = state.buckets.len();
        state.buckets.retain(|_, bucket| now < bucket.reset_at);
        before - state.buckets.len()
    }
}

fn bucket_state(bucket: &Bucket, now: Instant) -> BucketState {
    if bucket.remaining == 0 && now < bucket.reset_at {
        BucketState::Exhausted
    } else {
        BucketState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MAX_WAIT};

    fn tracker(budget: u32, window_ms: u64) -> (Arc<ManualClock>, RateLimitTracker) {
        let clock = Arc::new(ManualClock::new());
        let config = RateLimitConfig { default_budget: budget, window_ms };
        (clock.clone(), RateLimitTracker::new(&config, clock))
    }

    fn channel(id: &str) -> ResourceId {
        ResourceId::new(id)
    }

    #[tokio::test]
    async fn budget_of_n_allows_n_then_waits_until_reset() {
        let (clock, tracker) = tracker(3, 1_000);
        let start = clock.now();
        let c = channel("c1");

        for _ in 0..3 {
            assert!(tracker.try_acquire(&c).await.is_ok());
        }
        let wait = tracker.try_acquire(&c).await.unwrap_err();
        assert_eq!(wait, Wait { until: start + Duration::from_millis(1_000), global: false });
        assert_eq!(tracker.state(&c).await, BucketState::Exhausted);

        clock.advance(Duration::from_millis(1_000));
        assert_eq!(tracker.state(&c).await, BucketState::Open);
        assert!(tracker.try_acquire(&c).await.is_ok());
    }

    #[tokio::test]
    async fn exhausted_resource_does_not_affect_others() {
        let (_clock, tracker) = tracker(1, 1_000);
        assert!(tracker.try_acquire(&channel("a")).await.is_ok());
        assert!(tracker.try_acquire(&channel("a")).await.is_err());
        assert!(tracker.try_acquire(&channel("b")).await.is_ok());
    }

    #[tokio::test]
    async fn authoritative_update_overwrites_local_estimate() {
        let (clock, tracker) = tracker(5, 1_000);
        let c = channel("c1");
        tracker.try_acquire(&c).await.unwrap();

        tracker
            .apply_update(&c, &RateLimitUpdate {
                limit: Some(10),
                remaining: 0,
                reset_after: Duration::from_millis(250),
            })
            .await;

        let wait = tracker.try_acquire(&c).await.unwrap_err();
        assert_eq!(wait.until, clock.now() + Duration::from_millis(250));

        clock.advance(Duration::from_millis(250));
        let snapshot = tracker.snapshot().await;
        assert_eq!(snapshot.buckets[0].ceiling, 10);
        assert_eq!(snapshot.buckets[0].remaining, 10);
    }

    #[tokio::test]
    async fn global_lockout_blocks_every_resource_then_restores_previous_state() {
        let (clock, tracker) = tracker(1, 10_000);
        let a = channel("a");
        let b = channel("b");
        tracker.try_acquire(&a).await.unwrap(); // a is now exhausted

        tracker.apply_rate_limited(&b, Duration::from_millis(500), true).await;

        assert_eq!(tracker.state(&a).await, BucketState::GloballyLocked);
        assert_eq!(tracker.state(&channel("never-used")).await, BucketState::GloballyLocked);
        let wait = tracker.try_acquire(&channel("never-used")).await.unwrap_err();
        assert!(wait.global);
        assert_eq!(wait.until, clock.now() + Duration::from_millis(500));

        clock.advance(Duration::from_millis(500));
        assert_eq!(tracker.state(&a).await, BucketState::Exhausted);
        assert_eq!(tracker.state(&b).await, BucketState::Open);
        assert!(tracker.snapshot().await.global_lockout.is_none());
    }

    #[tokio::test]
    async fn resource_rate_limit_exhausts_bucket() {
        let (clock, tracker) = tracker(5, 10_000);
        let c = channel("c1");
        tracker.apply_rate_limited(&c, Duration::from_secs(2), false).await;

        assert_eq!(tracker.state(&c).await, BucketState::Exhausted);
        let wait = tracker.try_acquire(&c).await.unwrap_err();
        assert_eq!(wait.until, clock.now() + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn remote_supplied_waits_are_capped() {
        let (clock, tracker) = tracker(5, u64::MAX);
        let huge = Duration::from_secs(u64::MAX / 2);
        let (a, b, c) = (channel("a"), channel("b"), channel("c"));

        tracker.try_acquire(&a).await.unwrap();
        tracker.apply_rate_limited(&a, huge, false).await;
        assert_eq!(tracker.try_acquire(&a).await.unwrap_err().until, clock.now() + MAX_WAIT);

        tracker
            .apply_update(&b, &RateLimitUpdate { limit: None, remaining: 0, reset_after: huge })
            .await;
        assert_eq!(tracker.try_acquire(&b).await.unwrap_err().until, clock.now() + MAX_WAIT);

        tracker.apply_rate_limited(&c, huge, true).await;
        let wait = tracker.try_acquire(&c).await.unwrap_err();
        assert!(wait.global);
        assert_eq!(wait.until, clock.now() + MAX_WAIT);
    }

    #[tokio::test]
    async fn prune_drops_lapsed_buckets() {
        let (clock, tracker) = tracker(2, 100);
        tracker.try_acquire(&channel("a")).await.unwrap();
        tracker.try_acquire(&channel("b")).await.unwrap();
        clock.advance(Duration::from_millis(100));

        assert_eq!(tracker.prune_expired().await, 2);
        assert!(tracker.snapshot().await.buckets.is_empty());
    }
}
