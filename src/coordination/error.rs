use std::time::Duration;

use http::StatusCode;
use snafu::Snafu;

use super::{
    backend::BackendError,
    persistence::PersistenceError,
    request::{RequestId, UserId},
};

/// Why a submission was refused. Returned synchronously; a refused request is
/// never queued and leaves no trace in the admission counters.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AdmissionError {
    #[snafu(display("Rate limit exceeded, retry after {}ms", retry_after.as_millis()))]
    RateLimited { retry_after: Duration },

    #[snafu(display("User {user} already has {limit} chats in flight"))]
    UserConcurrencyExceeded { user: UserId, limit: usize },

    #[snafu(display("Chat service is not accepting new requests"))]
    ServiceDisabled,

    #[snafu(display("Request {request_id} is already in flight"))]
    DuplicateRequest { request_id: RequestId },
}

impl AdmissionError {
    /// Stable machine-readable code, as used by the management surface.
    pub const fn code(&self) -> &'static str {
        match self {
            AdmissionError::RateLimited { .. } => "RATE_LIMITED",
            AdmissionError::UserConcurrencyExceeded { .. } => "USER_CONCURRENCY_EXCEEDED",
            AdmissionError::ServiceDisabled => "SERVICE_DISABLED",
            AdmissionError::DuplicateRequest { .. } => "DUPLICATE_REQUEST",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::RateLimited { .. } | AdmissionError::UserConcurrencyExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AdmissionError::ServiceDisabled => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::DuplicateRequest { .. } => StatusCode::CONFLICT,
        }
    }
}

/// Terminal reason attached to a request that did not complete.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExecutionError {
    #[snafu(display("Completion backend failed: {source}"))]
    Backend { source: BackendError },

    #[snafu(display("Watchdog fired after {}s without a terminal signal", after.as_secs()))]
    Timeout { after: Duration },

    /// User initiated. Not an operational failure.
    #[snafu(display("Request cancelled"))]
    Cancelled,

    #[snafu(display("Failed to persist the assistant message: {source}"))]
    Persistence { source: PersistenceError },

    #[snafu(display("Internal coordinator fault: {message}"))]
    Internal { message: String },
}

impl ExecutionError {
    /// Whether the failure says something about the health of the concurrent
    /// execution path, as opposed to the content of one conversation.
    pub fn counts_against_circuit(&self) -> bool {
        match self {
            ExecutionError::Backend { source } => source.counts_against_circuit(),
            ExecutionError::Timeout { .. } | ExecutionError::Internal { .. } => true,
            ExecutionError::Cancelled | ExecutionError::Persistence { .. } => false,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Invalid configuration document: {source}"))]
    Parse { source: serde_json::Error },

    #[snafu(display("`{field}` must be greater than zero"))]
    ZeroLimit { field: &'static str },

    #[snafu(display(
        "Watchdog ({watchdog_secs}s) must be shorter than the backend timeout ({backend_secs}s)"
    ))]
    WatchdogNotShorter { watchdog_secs: u64, backend_secs: u64 },

    #[snafu(display("The coordinator must be created inside a Tokio runtime"))]
    NoRuntime,
}
