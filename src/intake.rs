//! Bounded worker pool in front of the [`Pipeline`].
//!
//! Submission never blocks: a full queue is reported as
//! [`IntakeError::Backpressure`] and the caller decides what to do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::IntakeConfig;
use crate::error::{IntakeError, Outcome};
use crate::pipeline::Pipeline;
use crate::worker::{worker_loop, Job};

/// What [`Intake::shutdown`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that drained and exited within the grace period.
    pub completed: usize,
    /// Workers still busy at the deadline and aborted.
    pub aborted: usize,
}

pub struct Intake {
    tx: Option<mpsc::Sender<Job>>,
    is_running: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    pipeline: Pipeline,
    grace: Duration,
}

impl Intake {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(pipeline: Pipeline, config: &IntakeConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let shared_rx = Arc::new(Mutex::new(rx));

        let worker_count = config.worker_count.max(1);
        let worker_handles = (0..worker_count)
            .map(|id| tokio::spawn(worker_loop(id, shared_rx.clone(), pipeline.clone())))
            .collect();

        info!(workers = worker_count, queue_size = config.queue_size, "intake started");

        Self {
            tx: Some(tx),
            is_running: Arc::new(AtomicBool::new(true)),
            worker_handles,
            pipeline,
            grace: config.shutdown_grace(),
        }
    }

    /// Queue a raw notification; the receiver resolves once it is processed.
    pub fn submit(&self, raw: Value) -> Result<oneshot::Receiver<Outcome>, IntakeError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(IntakeError::Shutdown);
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(IntakeError::Shutdown);
        };

        let (reply, outcome) = oneshot::channel();
        match tx.try_send(Job { raw, reply }) {
            Ok(()) => Ok(outcome),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.pipeline.metrics().record_intake_rejection();
                warn!("intake queue full, rejecting event");
                Err(IntakeError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(IntakeError::Shutdown),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Refuse new work, let queued and in-flight events finish within the
    /// grace period, then abort whatever is left.
    ///
    /// An aborted event's dedup reservation is released, so its
    /// redelivery is processed normally.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        self.is_running.store(false, Ordering::SeqCst);
        self.tx.take();

        let deadline = Instant::now() + self.grace;
        let mut report = ShutdownReport { completed: 0, aborted: 0 };

        for mut handle in self.worker_handles.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => report.completed += 1,
                Err(_) => {
                    handle.abort();
                    report.aborted += 1;
                }
            }
        }

        if report.aborted > 0 {
            warn!(aborted = report.aborted, "shutdown grace elapsed, aborted busy workers");
        } else {
            info!(workers = report.completed, "intake drained");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RelayConfig;
    use crate::remote::{RemoteApi, RemoteResponse, StaticTargets};
    use crate::types::{Payload, ResourceId};
    use async_trait::async_trait;
    use serde_json::json;

    struct AlwaysOk;

    #[async_trait]
    impl RemoteApi for AlwaysOk {
        async fn call(&self, _resource: &ResourceId, _payload: &Payload) -> RemoteResponse {
            RemoteResponse::success()
        }
    }

    fn intake(workers: usize) -> Intake {
        let pipeline = Pipeline::with_clock(
            RelayConfig::default(),
            Arc::new(StaticTargets::new().with_target("G1", "C1")),
            Arc::new(AlwaysOk),
            Arc::new(ManualClock::new()),
        );
        let config = IntakeConfig { worker_count: workers, queue_size: 8, shutdown_grace_ms: 1_000 };
        Intake::start(pipeline, &config)
    }

    #[tokio::test]
    async fn submitted_event_reports_outcome() {
        let mut intake = intake(2);

        let outcome = intake
            .submit(json!({ "guild_id": "G1", "user": { "id": "U1", "username": "a" } }))
            .unwrap();
        assert!(outcome.await.unwrap().is_dispatched());

        let report = intake.shutdown().await;
        assert_eq!(report, ShutdownReport { completed: 2, aborted: 0 });
    }

    #[tokio::test]
    async fn refuses_work_after_shutdown() {
        let mut intake = intake(1);
        intake.shutdown().await;

        assert!(!intake.is_running());
        assert_eq!(intake.submit(json!({})).unwrap_err(), IntakeError::Shutdown);
    }
}
