use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use welcome_relay::{
    Intake, Payload, Pipeline, RelayConfig, RemoteApi, RemoteResponse, ResourceId, StaticTargets,
};

/// Prints instead of calling a real API.
struct LoggingApi;

#[async_trait]
impl RemoteApi for LoggingApi {
    async fn call(&self, resource: &ResourceId, payload: &Payload) -> RemoteResponse {
        tracing::info!(resource = %resource, content = %payload.content, "would post message");
        RemoteResponse::success()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let targets = StaticTargets::new().with_target("123", "welcome-channel");
    let pipeline = Pipeline::new(RelayConfig::default(), Arc::new(targets), Arc::new(LoggingApi));
    let mut intake = Intake::start(pipeline.clone(), &RelayConfig::default().intake);

    let join = json!({
        "guild_id": "123",
        "user": { "id": "987", "username": "new_user" }
    });

    // the transport redelivers the same join
    let mut pending = Vec::new();
    for _ in 0..2 {
        if let Ok(outcome) = intake.submit(join.clone()) {
            pending.push(outcome);
        }
    }
    for outcome in pending {
        if let Ok(outcome) = outcome.await {
            tracing::info!(outcome = outcome.label(), "event processed");
        }
    }

    intake.shutdown().await;
    if let Ok(json) = serde_json::to_string_pretty(&pipeline.snapshot_metrics()) {
        println!("{}", json);
    }
}
