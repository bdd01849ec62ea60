use std::fmt;
use std::time::Duration;

use crate::dispatcher::DispatchReceipt;

/// Why a raw notification could not be turned into an [`InboundEvent`](crate::InboundEvent).
///
/// Always terminal for the delivery: never retried, never recorded for dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is absent.
    Missing { field: &'static str },

    /// A required field is present but empty or whitespace.
    Empty { field: &'static str },

    /// A field has the wrong JSON type.
    Malformed { field: &'static str, reason: String },
}

impl ValidationError {
    /// Name of the offending field.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::Missing { field }
            | ValidationError::Empty { field }
            | ValidationError::Malformed { field, .. } => field,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Missing { field } =>
                write!(f, "missing required field `{}`", field),
            ValidationError::Empty { field } =>
                write!(f, "required field `{}` is empty", field),
            ValidationError::Malformed { field, reason } =>
                write!(f, "malformed field `{}`: {}", field, reason),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Classification of a single failed outbound attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    Timeout,
    Network,
    /// 5xx-class response.
    RemoteError,
    /// 429 from the remote side.
    RateLimited,
    Unauthorized,
    Forbidden,
    NotFound,
    /// Any other 4xx.
    ClientError,
}

impl FailureReason {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::Timeout
                | FailureReason::Network
                | FailureReason::RemoteError
                | FailureReason::RateLimited
        )
    }

    /// Whether this failure suggests the remote is unreachable, as opposed
    /// to reachable but refusing or throttling.
    pub fn is_outage(&self) -> bool {
        matches!(
            self,
            FailureReason::Timeout | FailureReason::Network | FailureReason::RemoteError
        )
    }

    /// Stable label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Network => "network",
            FailureReason::RemoteError => "remote_error",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::Forbidden => "forbidden",
            FailureReason::NotFound => "not_found",
            FailureReason::ClientError => "client_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network =>
                write!(f, "network error"),
            FailureReason::RemoteError =>
                write!(f, "remote service returned a server error"),
            FailureReason::RateLimited =>
                write!(f, "rate limited by remote service"),
            FailureReason::Unauthorized =>
                write!(f, "credentials rejected (non-retryable)"),
            FailureReason::Forbidden =>
                write!(f, "permission denied (non-retryable)"),
            FailureReason::NotFound =>
                write!(f, "target not found (non-retryable)"),
            FailureReason::ClientError =>
                write!(f, "client error (non-retryable)"),
        }
    }
}

/// Terminal result of [`Dispatcher::dispatch`](crate::Dispatcher::dispatch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The remote side refused the call; retrying cannot help.
    Rejected(FailureReason),

    /// Every allowed attempt failed with a retryable error.
    RetriesExhausted {
        attempts: u32,
        last: FailureReason,
    },

    /// The circuit breaker is open; no call was made.
    CircuitOpen { retry_in: Duration },
}

impl DispatchError {
    /// Stable label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchError::Rejected(reason) => reason.label(),
            DispatchError::RetriesExhausted { .. } => "retries_exhausted",
            DispatchError::CircuitOpen { .. } => "circuit_open",
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Rejected(reason) =>
                write!(f, "remote rejected dispatch: {}", reason),
            DispatchError::RetriesExhausted { attempts, last } =>
                write!(f, "gave up after {} attempts, last error: {}", attempts, last),
            DispatchError::CircuitOpen { retry_in } =>
                write!(f, "circuit open, retry in {}ms", retry_in.as_millis()),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Failure reported by the configuration-store collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupError(pub String);

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target lookup failed: {}", self.0)
    }
}

impl std::error::Error for LookupError {}

/// Why processing of a valid, non-duplicate event failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Remote rejected the call (permission, not found, ...).
    Terminal(FailureReason),

    /// Retryable failures persisted past the attempt ceiling.
    RetriesExhausted {
        attempts: u32,
        last: FailureReason,
    },

    /// Remote looked down; the call was not attempted.
    CircuitOpen,

    /// The configuration store could not be queried.
    TargetLookup(String),

    /// Unexpected defect (panic) inside the pipeline.
    Internal(String),
}

impl FailureKind {
    /// Stable label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Terminal(reason) => reason.label(),
            FailureKind::RetriesExhausted { .. } => "retries_exhausted",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::TargetLookup(_) => "target_lookup",
            FailureKind::Internal(_) => "internal",
        }
    }
}

impl From<DispatchError> for FailureKind {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Rejected(reason) => FailureKind::Terminal(reason),
            DispatchError::RetriesExhausted { attempts, last } =>
                FailureKind::RetriesExhausted { attempts, last },
            DispatchError::CircuitOpen { .. } => FailureKind::CircuitOpen,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Terminal(reason) =>
                write!(f, "terminal: {}", reason),
            FailureKind::RetriesExhausted { attempts, last } =>
                write!(f, "retries exhausted after {} attempts ({})", attempts, last),
            FailureKind::CircuitOpen =>
                write!(f, "circuit open"),
            FailureKind::TargetLookup(msg) =>
                write!(f, "target lookup failed: {}", msg),
            FailureKind::Internal(msg) =>
                write!(f, "internal error: {}", msg),
        }
    }
}

/// Final result of processing one inbound notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Dispatched(DispatchReceipt),
    Duplicate,
    Invalid(ValidationError),
    NoTarget,
    Failed(FailureKind),
}

impl Outcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Outcome::Dispatched(_))
    }

    /// Stable label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Dispatched(_) => "dispatched",
            Outcome::Duplicate => "duplicate",
            Outcome::Invalid(_) => "invalid",
            Outcome::NoTarget => "no_target",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// Errors returned when handing work to the [`Intake`](crate::Intake).
#[derive(Debug, PartialEq, Eq)]
pub enum IntakeError {
    /// Intake queue is full.
    /// Caller must retry or apply backoff.
    Backpressure,

    /// Intake has been shut down.
    Shutdown,
}

impl fmt::Display for IntakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntakeError::Backpressure =>
                write!(f, "intake at capacity"),
            IntakeError::Shutdown =>
                write!(f, "intake is shut down"),
        }
    }
}

impl std::error::Error for IntakeError {}

/// Errors loading or validating [`RelayConfig`](crate::RelayConfig).
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) =>
                write!(f, "failed to read config: {}", err),
            ConfigError::Parse(err) =>
                write!(f, "failed to parse config: {}", err),
            ConfigError::Invalid(msg) =>
                write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_class_failures_are_retryable() {
        assert!(FailureReason::Timeout.is_retryable());
        assert!(FailureReason::RemoteError.is_retryable());
        assert!(FailureReason::RateLimited.is_retryable());
        assert!(!FailureReason::Forbidden.is_retryable());
        assert!(!FailureReason::NotFound.is_retryable());
        assert!(!FailureReason::ClientError.is_retryable());
    }

    #[test]
    fn exhausted_is_distinct_from_rejection() {
        let gave_up: FailureKind = DispatchError::RetriesExhausted {
            attempts: 3,
            last: FailureReason::RemoteError,
        }
        .into();
        let rejected: FailureKind = DispatchError::Rejected(FailureReason::Forbidden).into();

        assert_eq!(gave_up.label(), "retries_exhausted");
        assert!(FailureReason::Timeout.is_outage());
        assert!(!FailureReason::RateLimited.is_outage());
        assert_eq!(rejected, FailureKind::Terminal(FailureReason::Forbidden));
    }

    #[test]
    fn validation_error_names_field() {
        let err = ValidationError::Missing { field: "user.id" };
        assert_eq!(err.field(), "user.id");
        assert_eq!(err.to_string(), "missing required field `user.id`");
    }
}
