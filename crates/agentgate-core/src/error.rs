//! Error taxonomy for the gateway core.

use agentgate_state::StorageError;

use crate::runtime::RuntimeError;

/// Coarse classification used by callers that translate errors for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Unavailable,
    Timeout,
    Forbidden,
    InvalidTransition,
    Conflict,
    BadRequest,
    PayloadTooLarge,
    Upstream,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Conflict => "conflict",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Gateway errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown agent: {name}")]
    AgentNotFound { name: String },

    #[error("unknown thread: {job_id}")]
    JobNotFound { job_id: String },

    #[error("agent {name} unavailable: {reason}")]
    AgentUnavailable { name: String, reason: String },

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("egress to {host} denied for {agent}")]
    Forbidden { agent: String, host: String },

    #[error("job {job_id}: cannot go from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("job {job_id} already {state} with a different outcome")]
    Conflict { job_id: String, state: String },

    #[error("audit log unavailable: {0}")]
    AuditUnavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("payload exceeds {limit_bytes} bytes")]
    PayloadTooLarge { limit_bytes: u64 },

    #[error("agent call failed: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("io error: {0}")]
    Io(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::AgentNotFound { .. } | GatewayError::JobNotFound { .. } => {
                ErrorKind::NotFound
            }
            GatewayError::AgentUnavailable { .. }
            | GatewayError::Unavailable(_)
            | GatewayError::AuditUnavailable(_) => ErrorKind::Unavailable,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::Forbidden { .. } => ErrorKind::Forbidden,
            GatewayError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            GatewayError::Conflict { .. } => ErrorKind::Conflict,
            GatewayError::BadRequest(_) => ErrorKind::BadRequest,
            GatewayError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            GatewayError::Upstream(_) => ErrorKind::Upstream,
            GatewayError::Storage(StorageError::JobNotFound { .. }) => ErrorKind::NotFound,
            GatewayError::Storage(StorageError::Backend(_)) => ErrorKind::Unavailable,
            GatewayError::Storage(_) | GatewayError::Io(_) | GatewayError::Config(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        GatewayError::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::JobNotFound { job_id } => GatewayError::JobNotFound { job_id },
            other => GatewayError::Storage(other),
        }
    }
}

impl From<RuntimeError> for GatewayError {
    fn from(err: RuntimeError) -> Self {
        GatewayError::Unavailable(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
