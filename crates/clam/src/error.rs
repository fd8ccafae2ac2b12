//! Error types for control plane operations.

use serde::Serialize;
use thiserror::Error;

use crate::model::SandboxStatus;

/// The result type used throughout the control plane.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Stable machine-readable error codes.
///
/// The routing layer serializes these verbatim so SDKs can branch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Bad input shape or range.
    ValidationError,
    /// Resource absent or scoped away from the caller.
    NotFound,
    /// Current state disallows the operation.
    Conflict,
    /// The sandbox must be running for this operation.
    SandboxNotRunning,
    /// Concurrent sandbox quota reached.
    QuotaExceeded,
    /// Fork would exceed the maximum fork depth.
    ForkDepthExceeded,
    /// Parent sandbox already has the maximum number of forks.
    ForkLimitExceeded,
    /// The replay has expired.
    Gone,
    /// Reserved stub path.
    NotImplemented,
    /// Plan restriction.
    BillingLimit,
    /// Too many requests.
    RateLimited,
    /// A node or store could not be reached.
    ServiceUnavailable,
    /// Anything else.
    InternalError,
}

impl ErrorCode {
    /// The string form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::SandboxNotRunning => "sandbox_not_running",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ForkDepthExceeded => "fork_depth_exceeded",
            Self::ForkLimitExceeded => "fork_limit_exceeded",
            Self::Gone => "gone",
            Self::NotImplemented => "not_implemented",
            Self::BillingLimit => "billing_limit",
            Self::RateLimited => "rate_limited",
            Self::ServiceUnavailable => "service_unavailable",
            Self::InternalError => "internal_error",
        }
    }

    /// HTTP status the routing layer responds with for this code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationError => 400,
            Self::NotFound => 404,
            Self::Conflict | Self::SandboxNotRunning => 409,
            Self::QuotaExceeded
            | Self::ForkDepthExceeded
            | Self::ForkLimitExceeded
            | Self::BillingLimit => 403,
            Self::Gone => 410,
            Self::NotImplemented => 501,
            Self::RateLimited => 429,
            Self::ServiceUnavailable => 503,
            Self::InternalError => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a node client.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node could not be reached.
    #[error("node {node_id} unreachable: {message}")]
    Unreachable {
        /// Node that was targeted.
        node_id: String,
        /// Transport detail.
        message: String,
    },
    /// The node does not know the sandbox, session or file.
    #[error("not found on node: {0}")]
    NotFound(String),
    /// The node rejected the request.
    #[error("node rejected request: {0}")]
    Rejected(String),
    /// The RPC exceeded its deadline.
    #[error("node request timed out after {0}s")]
    Timeout(u64),
}

/// Errors returned by the ephemeral store.
#[derive(Debug, Error)]
#[error("ephemeral store error: {message}")]
pub struct StoreError {
    /// Description of the failure.
    pub message: String,
}

impl StoreError {
    /// Create a store error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors returned by object storage.
#[derive(Debug, Error)]
pub enum ObjectStorageError {
    /// No object at the key.
    #[error("object not found: {0}")]
    NotFound(String),
    /// Backend failure.
    #[error("object storage backend error: {0}")]
    Backend(String),
}

/// Errors that can occur in control plane operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Bad input shape or range.
    #[error("validation error: {0}")]
    Validation(String),

    /// A resource was not found (or is not visible to the caller).
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of resource.
        resource: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The current state disallows the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The sandbox is not running.
    #[error("sandbox {id} is not running (status: {status})")]
    NotRunning {
        /// Sandbox identifier.
        id: String,
        /// Its current status.
        status: SandboxStatus,
    },

    /// The org already has the maximum number of active sandboxes.
    #[error("concurrent sandbox quota exceeded: {active}/{limit} active")]
    QuotaExceeded {
        /// Active sandboxes right now.
        active: u64,
        /// Configured maximum.
        limit: u64,
    },

    /// A fork would exceed the org's maximum fork depth.
    #[error("fork depth {depth} exceeds the maximum of {limit}")]
    ForkDepthExceeded {
        /// Depth the fork would have.
        depth: u32,
        /// Configured maximum.
        limit: u32,
    },

    /// The parent already has the maximum number of forks.
    #[error("sandbox {id} has reached its fork limit of {limit}")]
    ForkLimitExceeded {
        /// Parent sandbox.
        id: String,
        /// Configured maximum.
        limit: u32,
    },

    /// The replay for a sandbox has expired.
    #[error("replay for sandbox {0} has expired")]
    Gone(String),

    /// Reserved stub path.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// The org's plan does not allow the operation.
    #[error("billing limit: {0}")]
    BillingLimit(String),

    /// The caller exceeded a rate limit.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// No node has capacity for a new sandbox.
    #[error("no node capacity available")]
    NoCapacity,

    /// A node RPC failed.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// The ephemeral store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Object storage failed.
    #[error(transparent)]
    ObjectStorage(#[from] ObjectStorageError),

    /// The repository failed.
    #[error("repository error: {0}")]
    Repository(String),

    /// A serialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ControlError {
    /// Shorthand for a sandbox not-found error.
    pub fn sandbox_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: "sandbox",
            id: id.into(),
        }
    }

    /// The stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::NotRunning { .. } => ErrorCode::SandboxNotRunning,
            Self::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            Self::ForkDepthExceeded { .. } => ErrorCode::ForkDepthExceeded,
            Self::ForkLimitExceeded { .. } => ErrorCode::ForkLimitExceeded,
            Self::Gone(_) => ErrorCode::Gone,
            Self::NotImplemented(_) => ErrorCode::NotImplemented,
            Self::BillingLimit(_) => ErrorCode::BillingLimit,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::NoCapacity | Self::Node(_) | Self::Store(_) | Self::ObjectStorage(_) => {
                ErrorCode::ServiceUnavailable
            }
            Self::Repository(_) | Self::Serialization(_) => ErrorCode::InternalError,
        }
    }

    /// Whether a client retry could succeed without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::ServiceUnavailable | ErrorCode::RateLimited
        )
    }
}
