use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::error::Outcome;
use crate::pipeline::Pipeline;

/// One queued notification and where to send its outcome.
#[derive(Debug)]
pub(crate) struct Job {
    pub raw: Value,
    pub reply: oneshot::Sender<Outcome>,
}

/// Main worker loop.
///
/// Workers share one receiver and exit once the queue is closed and empty.
/// A submitter that stopped listening does not stop the worker.
pub(crate) async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    pipeline: Pipeline,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(job) = job else { break };

        let outcome = pipeline.process(job.raw).await;
        if job.reply.send(outcome).is_err() {
            debug!(worker = id, "outcome receiver dropped");
        }
    }
    debug!(worker = id, "worker stopped");
}
