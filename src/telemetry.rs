//! Process-wide counters and the dispatch latency distribution.
//!
//! Writers take a short lock per increment; [`MetricsSink::snapshot`]
//! copies the whole state under the same lock, so a snapshot is always
//! internally consistent. With the `metrics` feature every update is
//! also forwarded to the `metrics` facade.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    ::metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
fn metric_inc_kind(name: &'static str, kind: &'static str) {
    ::metrics::increment_counter!(name, "kind" => kind);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc_kind(_name: &'static str, _kind: &'static str) {}

#[cfg(feature = "metrics")]
fn metric_ms(name: &'static str, value: Duration) {
    ::metrics::histogram!(name, value.as_secs_f64() * 1_000.0);
}

#[cfg(not(feature = "metrics"))]
fn metric_ms(_name: &'static str, _value: Duration) {}

const DEFAULT_BOUNDS_MS: [u64; 11] = [10, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000];

/// Fixed-bucket latency histogram in milliseconds.
///
/// `counts[i]` holds observations `<= bounds_ms[i]` (and above the previous
/// bound); the final slot counts everything above the last bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencyHistogram {
    pub bounds_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub count: u64,
    pub sum_ms: u64,
    pub max_ms: u64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            bounds_ms: DEFAULT_BOUNDS_MS.to_vec(),
            counts: vec![0; DEFAULT_BOUNDS_MS.len() + 1],
            count: 0,
            sum_ms: 0,
            max_ms: 0,
        }
    }
}

impl LatencyHistogram {
    pub fn observe(&mut self, latency: Duration) {
        let ms = latency.as_millis().min(u64::MAX as u128) as u64;
        let slot = self
            .bounds_ms
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(self.bounds_ms.len());
        self.counts[slot] += 1;
        self.count += 1;
        self.sum_ms = self.sum_ms.saturating_add(ms);
        self.max_ms = self.max_ms.max(ms);
    }

    pub fn mean_ms(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum_ms as f64 / self.count as f64)
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub invalid_events: u64,
    pub dedup_hits: u64,
    pub dedup_misses: u64,
    pub no_target: u64,
    /// Dispatches that had to wait on a bucket or the global lockout.
    pub rate_limit_waits: u64,
    pub global_rate_limit_waits: u64,
    pub rate_limit_wait_ms: u64,
    /// 429 responses received.
    pub rate_limited_responses: u64,
    pub dispatch_attempts: u64,
    pub retries: u64,
    pub dispatch_successes: u64,
    /// Terminal dispatch failures keyed by classification label.
    pub dispatch_failures: BTreeMap<String, u64>,
    pub internal_errors: u64,
    pub intake_rejections: u64,
    /// Dispatches refused by an open circuit.
    pub circuit_rejections: u64,
    pub circuit_opened: u64,
    /// End-to-end dispatch latency, including every attempt and wait.
    pub dispatch_latency: LatencyHistogram,
}

impl MetricsSnapshot {
    pub fn failures(&self, label: &str) -> u64 {
        self.dispatch_failures.get(label).copied().unwrap_or(0)
    }

    pub fn total_failures(&self) -> u64 {
        self.dispatch_failures.values().sum()
    }
}

#[derive(Debug, Default)]
pub struct MetricsSink {
    state: Mutex<MetricsSnapshot>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().clone()
    }

    pub fn record_event_received(&self) {
        self.lock().events_received += 1;
        metric_inc("welcome_relay.events.received");
    }

    pub fn record_invalid(&self) {
        self.lock().invalid_events += 1;
        metric_inc("welcome_relay.events.invalid");
    }

    pub fn record_dedup_hit(&self) {
        self.lock().dedup_hits += 1;
        metric_inc("welcome_relay.dedup.hit");
    }

    pub fn record_dedup_miss(&self) {
        self.lock().dedup_misses += 1;
        metric_inc("welcome_relay.dedup.miss");
    }

    pub fn record_no_target(&self) {
        self.lock().no_target += 1;
        metric_inc("welcome_relay.events.no_target");
    }

    pub fn record_rate_limit_wait(&self, waited: Duration, global: bool) {
        {
            let mut state = self.lock();
            state.rate_limit_waits += 1;
            if global {
                state.global_rate_limit_waits += 1;
            }
            state.rate_limit_wait_ms = state
                .rate_limit_wait_ms
                .saturating_add(waited.as_millis() as u64);
        }
        metric_inc_kind(
            "welcome_relay.rate_limit.wait",
            if global { "global" } else { "resource" },
        );
        metric_ms("welcome_relay.rate_limit.wait_ms", waited);
    }

    pub fn record_rate_limited_response(&self) {
        self.lock().rate_limited_responses += 1;
        metric_inc("welcome_relay.rate_limit.response");
    }

    pub fn record_attempt(&self) {
        self.lock().dispatch_attempts += 1;
        metric_inc("welcome_relay.dispatch.attempt");
    }

    pub fn record_retry(&self) {
        self.lock().retries += 1;
        metric_inc("welcome_relay.dispatch.retry");
    }

    pub fn record_success(&self, latency: Duration) {
        {
            let mut state = self.lock();
            state.dispatch_successes += 1;
            state.dispatch_latency.observe(latency);
        }
        metric_inc("welcome_relay.dispatch.success");
        metric_ms("welcome_relay.dispatch.latency_ms", latency);
    }

    pub fn record_failure(&self, label: &'static str, latency: Option<Duration>) {
        {
            let mut state = self.lock();
            *state.dispatch_failures.entry(label.to_string()).or_insert(0) += 1;
            if let Some(latency) = latency {
                state.dispatch_latency.observe(latency);
            }
        }
        metric_inc_kind("welcome_relay.dispatch.failure", label);
        if let Some(latency) = latency {
            metric_ms("welcome_relay.dispatch.latency_ms", latency);
        }
    }

    pub fn record_internal_error(&self) {
        self.lock().internal_errors += 1;
        metric_inc("welcome_relay.internal_error");
    }

    pub fn record_circuit_rejection(&self) {
        self.lock().circuit_rejections += 1;
        metric_inc("welcome_relay.circuit.rejected");
    }

    pub fn record_circuit_opened(&self) {
        self.lock().circuit_opened += 1;
        metric_inc("welcome_relay.circuit.opened");
    }

    pub fn record_intake_rejection(&self) {
        self.lock().intake_rejections += 1;
        metric_inc("welcome_relay.intake.rejected");
    }

    fn lock(&self) -> MutexGuard<'_, MetricsSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn histogram_buckets_by_upper_bound() {
        let mut histogram = LatencyHistogram::default();
        histogram.observe(Duration::from_millis(10));
        histogram.observe(Duration::from_millis(11));
        histogram.observe(Duration::from_secs(120));

        assert_eq!(histogram.counts[0], 1);
        assert_eq!(histogram.counts[1], 1);
        assert_eq!(*histogram.counts.last().unwrap(), 1);
        assert_eq!(histogram.count, 3);
        assert_eq!(histogram.max_ms, 120_000);
        assert_eq!(histogram.mean_ms(), Some((10.0 + 11.0 + 120_000.0) / 3.0));
    }

    #[test]
    fn snapshot_is_a_detached_copy() {
        let sink = MetricsSink::new();
        sink.record_dedup_hit();
        let before = sink.snapshot();
        sink.record_dedup_hit();

        assert_eq!(before.dedup_hits, 1);
        assert_eq!(sink.snapshot().dedup_hits, 2);
    }

    #[test]
    fn failures_grouped_by_label() {
        let sink = MetricsSink::new();
        sink.record_failure("forbidden", None);
        sink.record_failure("retries_exhausted", Some(Duration::from_millis(30)));
        sink.record_failure("retries_exhausted", Some(Duration::from_millis(40)));

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.failures("forbidden"), 1);
        assert_eq!(snapshot.failures("retries_exhausted"), 2);
        assert_eq!(snapshot.total_failures(), 3);
        assert_eq!(snapshot.dispatch_latency.count, 2);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let sink = Arc::new(MetricsSink::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        sink.record_attempt();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sink.snapshot().dispatch_attempts, 8_000);
    }
}
