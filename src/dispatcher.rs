use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::circuit::{CircuitBreaker, CircuitSnapshot};
use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::error::{DispatchError, FailureReason};
use crate::rate_limit::{BucketState, RateLimitSnapshot, RateLimitTracker, RateLimitUpdate};
use crate::remote::{RemoteApi, RemoteResponse, RemoteStatus};
use crate::telemetry::MetricsSink;
use crate::types::{Payload, ResourceId};

/// Fallback wait for a 429 that carries no retry-after.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Summary of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub attempts: u32,
    /// Time from the first budget check to the successful response,
    /// including every wait and backoff in between.
    pub latency: Duration,
    pub rate_limit_waits: u32,
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttemptClass {
    Success,
    RateLimited { retry_after: Duration, global: bool },
    Transient(FailureReason),
    Terminal(FailureReason),
}

pub(crate) fn classify(response: &RemoteResponse) -> AttemptClass {
    let reason = match &response.status {
        RemoteStatus::Success => return AttemptClass::Success,
        RemoteStatus::RateLimited { global } => {
            return AttemptClass::RateLimited {
                retry_after: response.retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
                global: *global,
            }
        }
        RemoteStatus::ServerError(_) => FailureReason::RemoteError,
        RemoteStatus::Network(_) => FailureReason::Network,
        RemoteStatus::Unauthorized => FailureReason::Unauthorized,
        RemoteStatus::Forbidden => FailureReason::Forbidden,
        RemoteStatus::NotFound => FailureReason::NotFound,
        RemoteStatus::ClientError(_) => FailureReason::ClientError,
    };
    if reason.is_retryable() {
        AttemptClass::Transient(reason)
    } else {
        AttemptClass::Terminal(reason)
    }
}

/// State of one dispatch call chain; lives only as long as the call.
struct DispatchAttempt<'a> {
    resource: &'a ResourceId,
    payload: &'a Payload,
    number: u32,
    last_failure: Option<FailureReason>,
    rate_limit_waits: u32,
    /// Runs once, just before the first outbound call starts.
    on_first_call: Option<Box<dyn FnOnce() + Send + 'a>>,
}

/// Rate-limit-aware, retrying sender behind a circuit breaker.
///
/// Owns the [`RateLimitTracker`]; nothing else mutates it.
pub struct Dispatcher {
    api: Arc<dyn RemoteApi>,
    tracker: RateLimitTracker,
    circuit: CircuitBreaker,
    backoff: BackoffPolicy,
    attempt_timeout: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsSink>,
}

impl Dispatcher {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        config: &RelayConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            api,
            tracker: RateLimitTracker::new(&config.rate_limit, clock.clone()),
            circuit: CircuitBreaker::new(&config.circuit, clock.clone()),
            backoff: config.retry.backoff_policy(),
            attempt_timeout: config.retry.attempt_timeout(),
            clock,
            metrics,
        }
    }

    pub async fn rate_limits(&self) -> RateLimitSnapshot {
        self.tracker.snapshot().await
    }

    pub async fn resource_state(&self, resource: &ResourceId) -> BucketState {
        self.tracker.state(resource).await
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.circuit.snapshot()
    }

    /// Drop tracker entries whose reset has passed.
    pub async fn prune_rate_limits(&self) -> usize {
        self.tracker.prune_expired().await
    }

    /// Deliver `payload` to `resource`, waiting out rate limits and retrying
    /// transient failures up to the policy's attempt ceiling.
    ///
    /// Waits suspend only the calling task and never hold the tracker lock.
    pub async fn dispatch(
        &self,
        resource: &ResourceId,
        payload: &Payload,
    ) -> Result<DispatchReceipt, DispatchError> {
        self.dispatch_with(resource, payload, || {}).await
    }

    /// Like [`dispatch`](Self::dispatch), calling `on_first_call` right before
    /// the first outbound call starts. It is never called if the dispatch
    /// ends, or is cancelled, before any call goes out.
    pub async fn dispatch_with<'a, F>(
        &self,
        resource: &'a ResourceId,
        payload: &'a Payload,
        on_first_call: F,
    ) -> Result<DispatchReceipt, DispatchError>
    where
        F: FnOnce() + Send + 'a,
    {
        if let Err(retry_in) = self.circuit.try_enter() {
            self.metrics.record_circuit_rejection();
            self.metrics.record_failure("circuit_open", None);
            warn!(
                resource = %resource,
                retry_in_ms = retry_in.as_millis() as u64,
                "circuit open, failing fast"
            );
            return Err(DispatchError::CircuitOpen { retry_in });
        }

        let started = self.clock.now();
        let mut attempt = DispatchAttempt {
            resource,
            payload,
            number: 0,
            last_failure: None,
            rate_limit_waits: 0,
            on_first_call: Some(Box::new(on_first_call)),
        };

        let result = self.run(&mut attempt).await;
        let latency = self.clock.now().saturating_duration_since(started);

        match &result {
            Ok(()) => {
                self.circuit.record_success();
                self.metrics.record_success(latency);
            }
            Err(DispatchError::RetriesExhausted { last, .. }) => {
                if last.is_outage() {
                    if self.circuit.record_failure() {
                        self.metrics.record_circuit_opened();
                    }
                } else {
                    self.circuit.record_success();
                }
                self.metrics.record_failure("retries_exhausted", Some(latency));
            }
            Err(err) => {
                // a refusal still proves the remote is reachable
                self.circuit.record_success();
                self.metrics.record_failure(err.label(), Some(latency));
            }
        }

        result.map(|()| DispatchReceipt {
            attempts: attempt.number,
            latency,
            rate_limit_waits: attempt.rate_limit_waits,
        })
    }

    async fn run(&self, attempt: &mut DispatchAttempt<'_>) -> Result<(), DispatchError> {
        loop {
            attempt.number += 1;
            attempt.rate_limit_waits += self.wait_for_budget(attempt.resource).await;

            if let Some(hook) = attempt.on_first_call.take() {
                hook();
            }
            self.metrics.record_attempt();
            let (class, update) = self.call_once(attempt.resource, attempt.payload).await;
            if let Some(update) = &update {
                self.tracker.apply_update(attempt.resource, update).await;
            }

            let backoff = match class {
                AttemptClass::Success => {
                    debug!(
                        resource = %attempt.resource,
                        attempt = attempt.number,
                        "dispatch succeeded"
                    );
                    return Ok(());
                }
                AttemptClass::Terminal(reason) => {
                    warn!(
                        resource = %attempt.resource,
                        attempt = attempt.number,
                        reason = %reason,
                        "dispatch rejected"
                    );
                    return Err(DispatchError::Rejected(reason));
                }
                AttemptClass::RateLimited { retry_after, global } => {
                    self.metrics.record_rate_limited_response();
                    self.tracker
                        .apply_rate_limited(attempt.resource, retry_after, global)
                        .await;
                    attempt.last_failure = Some(FailureReason::RateLimited);
                    // the tracker now holds the authoritative wait
                    None
                }
                AttemptClass::Transient(reason) => {
                    attempt.last_failure = Some(reason);
                    Some(self.backoff.delay(attempt.number))
                }
            };

            let last = attempt.last_failure.unwrap_or(FailureReason::Network);
            if !self.backoff.allows_retry(attempt.number) {
                warn!(
                    resource = %attempt.resource,
                    attempts = attempt.number,
                    last = %last,
                    "dispatch retries exhausted"
                );
                return Err(DispatchError::RetriesExhausted {
                    attempts: attempt.number,
                    last,
                });
            }

            self.metrics.record_retry();
            if let Some(delay) = backoff {
                info!(
                    resource = %attempt.resource,
                    attempt = attempt.number,
                    reason = %last,
                    delay_ms = delay.as_millis() as u64,
                    "transient dispatch failure, backing off"
                );
                self.clock.sleep(delay).await;
            }
        }
    }

    /// Block until the tracker grants budget; returns how many waits it took.
    async fn wait_for_budget(&self, resource: &ResourceId) -> u32 {
        let mut waits = 0;
        loop {
            match self.tracker.try_acquire(resource).await {
                Ok(()) => return waits,
                Err(wait) => {
                    let waited = wait.until.saturating_duration_since(self.clock.now());
                    debug!(
                        resource = %resource,
                        global = wait.global,
                        wait_ms = waited.as_millis() as u64,
                        "waiting for rate limit reset"
                    );
                    self.metrics.record_rate_limit_wait(waited, wait.global);
                    self.clock.sleep_until(wait.until).await;
                    waits += 1;
                }
            }
        }
    }

    async fn call_once(
        &self,
        resource: &ResourceId,
        payload: &Payload,
    ) -> (AttemptClass, Option<RateLimitUpdate>) {
        match tokio::time::timeout(self.attempt_timeout, self.api.call(resource, payload)).await {
            Ok(response) => (classify(&response), response.rate_limit),
            Err(_) => (AttemptClass::Transient(FailureReason::Timeout), None),
        }
    }
}
