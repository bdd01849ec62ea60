//! Intake and resilient dispatch for member-join notifications.
//!
//! This crate turns **redeliverable** join events from a chat platform
//! into **at most one** outbound welcome call per join, sent against a
//! remote API that enforces per-resource rate limits.
//!
//! ## Guarantees
//! - At most one dispatch per (tenant, subject) within the dedup window
//! - Per-resource rate-limit isolation, plus a remote-wide lockout
//! - Bounded retries with exponential backoff and full jitter
//! - Fail-fast circuit breaker while the remote is unreachable
//! - Explicit backpressure at intake
//! - Every event ends in exactly one [`Outcome`]
//!
//! ## Non-Guarantees
//! - Deduplication past the retention window or after capacity eviction
//! - Ordering across unrelated tenants
//! - Durability across restarts
//! - Transport reconnect or resume
//!
//! The transport, the configuration store and the outbound client are
//! collaborators behind [`TargetResolver`] and [`RemoteApi`].

mod backoff;
mod circuit;
mod clock;
mod config;
mod dedup;
mod dispatcher;
mod error;
mod intake;
mod pipeline;
mod rate_limit;
mod remote;
mod telemetry;
mod types;
mod validator;
mod worker;

#[cfg(feature = "http")]
mod http;

pub use backoff::BackoffPolicy;
pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use clock::{Clock, ManualClock, TokioClock, MAX_WAIT};
pub use config::{CircuitConfig, DedupConfig, IntakeConfig, RateLimitConfig, RelayConfig, RetryConfig};
pub use dedup::{DedupCache, Reservation};
pub use dispatcher::{DispatchReceipt, Dispatcher};
pub use error::{
    ConfigError,
    DispatchError,
    FailureKind,
    FailureReason,
    IntakeError,
    LookupError,
    Outcome,
    ValidationError,
};
pub use intake::{Intake, ShutdownReport};
pub use pipeline::Pipeline;
pub use rate_limit::{BucketSnapshot, BucketState, RateLimitSnapshot, RateLimitTracker, RateLimitUpdate, Wait};
pub use remote::{RemoteApi, RemoteResponse, RemoteStatus, StaticTargets, TargetResolver};
pub use telemetry::{LatencyHistogram, MetricsSink, MetricsSnapshot};
pub use types::{DedupKey, DeliveryId, InboundEvent, Payload, ResourceId, Subject, SubjectId, TenantId};
pub use validator::validate;

#[cfg(feature = "http")]
pub use http::{HttpApi, DEFAULT_BASE_URL};
