use std::any::Any;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::circuit::CircuitSnapshot;
use crate::clock::{Clock, TokioClock};
use crate::config::RelayConfig;
use crate::dedup::DedupCache;
use crate::dispatcher::Dispatcher;
use crate::error::{FailureKind, Outcome};
use crate::rate_limit::RateLimitSnapshot;
use crate::remote::{RemoteApi, TargetResolver};
use crate::telemetry::{MetricsSink, MetricsSnapshot};
use crate::types::Payload;
use crate::validator;

/// validate → dedup → resolve target → dispatch → record.
///
/// Cheap to clone; clones share the same caches, tracker and metrics.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    template: String,
    dedup: DedupCache,
    dispatcher: Dispatcher,
    targets: Arc<dyn TargetResolver>,
    metrics: Arc<MetricsSink>,
}

impl Pipeline {
    pub fn new(
        config: RelayConfig,
        targets: Arc<dyn TargetResolver>,
        api: Arc<dyn RemoteApi>,
    ) -> Self {
        Self::with_clock(config, targets, api, Arc::new(TokioClock))
    }

    pub fn with_clock(
        config: RelayConfig,
        targets: Arc<dyn TargetResolver>,
        api: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = Arc::new(MetricsSink::new());
        let dedup = DedupCache::new(config.dedup.retention(), config.dedup.capacity, clock.clone());
        let dispatcher = Dispatcher::new(api, &config, clock, metrics.clone());
        info!(
            retention_ms = dedup.retention().as_millis() as u64,
            capacity = dedup.capacity(),
            "pipeline ready"
        );

        Self {
            inner: Arc::new(PipelineInner {
                template: config.message_template,
                dedup,
                dispatcher,
                targets,
                metrics,
            }),
        }
    }

    /// Process one raw notification to completion.
    ///
    /// Never panics and never returns an error: every failure is folded into
    /// the [`Outcome`]. The work runs on its own task so that a defect in one
    /// event cannot take down the caller.
    pub async fn process(&self, raw: Value) -> Outcome {
        let inner = self.inner.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move { inner.process(raw).await }));
        match (&mut task.0).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let reason = if err.is_panic() {
                    panic_message(err.into_panic())
                } else {
                    "processing task cancelled".to_string()
                };
                error!(stage = "pipeline", error = %reason, "event processing failed unexpectedly");
                let kind = FailureKind::Internal(reason);
                self.inner.metrics.record_internal_error();
                self.inner.metrics.record_failure(kind.label(), None);
                Outcome::Failed(kind)
            }
        }
    }

    pub fn snapshot_metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub async fn rate_limits(&self) -> RateLimitSnapshot {
        self.inner.dispatcher.rate_limits().await
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.inner.dispatcher.circuit()
    }

    /// Number of live dedup records.
    pub fn dedup_len(&self) -> usize {
        self.inner.dedup.len()
    }

    /// Drop lapsed dedup records and rate-limit buckets.
    ///
    /// Both are also cleaned lazily; this only bounds idle memory.
    pub async fn purge_expired(&self) -> (usize, usize) {
        let records = self.inner.dedup.purge_expired();
        let buckets = self.inner.dispatcher.prune_rate_limits().await;
        debug!(records, buckets, "purged expired state");
        (records, buckets)
    }

    pub(crate) fn metrics(&self) -> &MetricsSink {
        &self.inner.metrics
    }
}

impl PipelineInner {
    async fn process(&self, raw: Value) -> Outcome {
        self.metrics.record_event_received();

        let event = match validator::validate(&raw) {
            Ok(event) => event,
            Err(err) => {
                self.metrics.record_invalid();
                warn!(stage = "validate", field = err.field(), error = %err, "dropping invalid event");
                return Outcome::Invalid(err);
            }
        };
        let tenant_id = &event.tenant_id;
        let subject_id = &event.subject.id;

        let Some(reservation) = self.dedup.reserve(&event.dedup_key()) else {
            self.metrics.record_dedup_hit();
            debug!(%tenant_id, %subject_id, stage = "dedup", "duplicate join suppressed");
            return Outcome::Duplicate;
        };
        self.metrics.record_dedup_miss();

        // An early return below drops the reservation, releasing the key.
        let target = match self.targets.resolve_target(tenant_id).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                self.metrics.record_no_target();
                info!(%tenant_id, %subject_id, stage = "resolve", "no target configured, skipping");
                return Outcome::NoTarget;
            }
            Err(err) => {
                error!(%tenant_id, %subject_id, stage = "resolve", error = %err, "target lookup failed");
                let kind = FailureKind::TargetLookup(err.0);
                self.metrics.record_failure(kind.label(), None);
                return Outcome::Failed(kind);
            }
        };

        let payload = Payload::render(&self.template, &event);
        // Once a call may have reached the remote, the key must stay recorded
        // even if this task is aborted or panics afterwards.
        let result = self
            .dispatcher
            .dispatch_with(&target, &payload, move || reservation.commit())
            .await;

        match result {
            Ok(receipt) => {
                info!(
                    %tenant_id,
                    %subject_id,
                    resource = %target,
                    attempts = receipt.attempts,
                    latency_ms = receipt.latency.as_millis() as u64,
                    "welcome dispatched"
                );
                Outcome::Dispatched(receipt)
            }
            Err(err) => {
                error!(
                    %tenant_id,
                    %subject_id,
                    resource = %target,
                    stage = "dispatch",
                    error = %err,
                    "welcome dispatch failed"
                );
                Outcome::Failed(err.into())
            }
        }
    }
}

/// Cancels the processing task if the caller stops waiting for it.
struct AbortOnDrop(JoinHandle<Outcome>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic".to_string()
    }
}
