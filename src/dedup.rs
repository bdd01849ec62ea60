//! Time-windowed, capacity-bounded record of processed join events.
//!
//! ## Guarantee
//! A key is reported as new at most once while its record is live.
//! Records die when the retention window elapses or when capacity
//! pressure evicts them (oldest insertion first). After that the key
//! is indistinguishable from one never seen, so deduplication holds
//! only within the window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::clock::Clock;
use crate::types::DedupKey;

pub struct DedupCache {
    state: Mutex<DedupState>,
    retention: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct DedupState {
    records: HashMap<DedupKey, Record>,
    /// Insertion order; entries whose seq no longer matches are stale.
    order: VecDeque<(u64, DedupKey)>,
    next_seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    first_seen: Instant,
    seq: u64,
}

impl DedupCache {
    pub fn new(retention: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(DedupState::default()),
            retention,
            capacity: capacity.max(1),
            clock,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` ("new, proceed") exactly once per live key.
    pub fn check_and_record(&self, key: &DedupKey) -> bool {
        match self.reserve(key) {
            Some(reservation) => {
                reservation.commit();
                true
            }
            None => false,
        }
    }

    /// Atomically record `key` provisionally.
    ///
    /// Returns `None` if the key is already live. The returned reservation
    /// releases the record when dropped unless [`Reservation::commit`] is called.
    pub fn reserve(&self, key: &DedupKey) -> Option<Reservation<'_>> {
        let now = self.clock.now();
        let mut state = self.lock();
        self.purge_locked(&mut state, now);

        if state.records.contains_key(key) {
            return None;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(key.clone(), Record { first_seen: now, seq });
        state.order.push_back((seq, key.clone()));

        while state.records.len() > self.capacity {
            let Some((old_seq, old_key)) = state.order.pop_front() else { break };
            if is_current(&state.records, &old_key, old_seq) {
                state.records.remove(&old_key);
                debug!(key = %old_key, "dedup record evicted by capacity bound");
            }
        }

        if state.order.len() > self.capacity.saturating_mul(2) {
            let DedupState { records, order, .. } = &mut *state;
            order.retain(|(seq, key)| is_current(records, key, *seq));
        }

        Some(Reservation {
            cache: self,
            key: key.clone(),
            seq,
            committed: false,
        })
    }

    /// Whether `key` is currently remembered. Does not record anything.
    pub fn contains(&self, key: &DedupKey) -> bool {
        let now = self.clock.now();
        let state = self.lock();
        state
            .records
            .get(key)
            .is_some_and(|record| !self.expired(record, now))
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        self.purge_locked(&mut state, now);
        state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record whose window has elapsed; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        self.purge_locked(&mut state, now)
    }

    fn release(&self, key: &DedupKey, seq: u64) {
        let mut state = self.lock();
        if is_current(&state.records, key, seq) {
            state.records.remove(key);
            debug!(key = %key, "dedup reservation released");
        }
    }

    fn purge_locked(&self, state: &mut DedupState, now: Instant) -> usize {
        let mut purged = 0;
        while let Some((seq, key)) = state.order.front() {
            match state.records.get(key) {
                Some(record) if record.seq == *seq => {
                    if !self.expired(record, now) {
                        break;
                    }
                    let key = key.clone();
                    state.records.remove(&key);
                    purged += 1;
                }
                // released or re-inserted later under a new seq
                _ => {}
            }
            state.order.pop_front();
        }
        purged
    }

    fn expired(&self, record: &Record, now: Instant) -> bool {
        now.saturating_duration_since(record.first_seen) >= self.retention
    }

    fn lock(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_current(records: &HashMap<DedupKey, Record>, key: &DedupKey, seq: u64) -> bool {
    records.get(key).is_some_and(|record| record.seq == seq)
}

/// A provisional dedup record.
///
/// Dropping it without calling [`commit`](Self::commit) removes the record,
/// so paths that end without processing the event stay retry-safe.
#[must_use = "an uncommitted reservation is released when dropped"]
pub struct Reservation<'a> {
    cache: &'a DedupCache,
    key: DedupKey,
    seq: u64,
    committed: bool,
}

impl Reservation<'_> {
    pub fn key(&self) -> &DedupKey {
        &self.key
    }

    /// Keep the record for the rest of its retention window.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.cache.release(&self.key, self.seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{SubjectId, TenantId};

    fn key(tenant: &str, subject: &str) -> DedupKey {
        DedupKey::new(TenantId::new(tenant), SubjectId::new(subject))
    }

    fn cache(retention_ms: u64, capacity: usize) -> (Arc<ManualClock>, DedupCache) {
        let clock = Arc::new(ManualClock::new());
        let cache = DedupCache::new(Duration::from_millis(retention_ms), capacity, clock.clone());
        (clock, cache)
    }

    #[test]
    fn new_exactly_once_within_window() {
        let (_clock, cache) = cache(1_000, 10);
        let k = key("G1", "U1");

        assert!(cache.check_and_record(&k));
        assert!(!cache.check_and_record(&k));
        assert!(!cache.check_and_record(&k));
        assert!(cache.check_and_record(&key("G1", "U2")));
        assert!(cache.check_and_record(&key("G2", "U1")));
    }

    #[test]
    fn key_is_new_again_after_retention_window() {
        let (clock, cache) = cache(1_000, 10);
        let k = key("G1", "U1");

        assert!(cache.check_and_record(&k));
        clock.advance(Duration::from_millis(999));
        assert!(!cache.check_and_record(&k));
        clock.advance(Duration::from_millis(1));
        assert!(cache.check_and_record(&k));
    }

    #[test]
    fn capacity_evicts_oldest_inside_window() {
        let (_clock, cache) = cache(60_000, 2);

        assert!(cache.check_and_record(&key("G", "1")));
        assert!(cache.check_and_record(&key("G", "2")));
        assert!(cache.check_and_record(&key("G", "3")));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key("G", "1")));
        // evicted key is processed again
        assert!(cache.check_and_record(&key("G", "1")));
        assert!(!cache.contains(&key("G", "2")));
        assert!(cache.contains(&key("G", "3")));
    }

    #[test]
    fn dropped_reservation_is_released() {
        let (_clock, cache) = cache(60_000, 10);
        let k = key("G1", "U1");

        {
            let reservation = cache.reserve(&k).unwrap();
            assert!(cache.reserve(&k).is_none());
            assert_eq!(reservation.key(), &k);
        }

        assert!(!cache.contains(&k));
        assert!(cache.reserve(&k).map(Reservation::commit).is_some());
        assert!(cache.reserve(&k).is_none());
    }

    #[test]
    fn stale_release_does_not_remove_newer_record() {
        let (clock, cache) = cache(100, 10);
        let k = key("G1", "U1");

        let old = cache.reserve(&k).unwrap();
        clock.advance(Duration::from_millis(100));
        assert!(cache.check_and_record(&k));
        drop(old);

        assert!(cache.contains(&k));
    }

    #[test]
    fn purge_reports_expired_records() {
        let (clock, cache) = cache(100, 10);
        cache.check_and_record(&key("G", "1"));
        cache.check_and_record(&key("G", "2"));
        clock.advance(Duration::from_millis(150));

        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redeliveries_see_new_once() {
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(DedupCache::new(Duration::from_secs(60), 100, clock));
        let k = key("G1", "U1");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move { cache.check_and_record(&k) }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
