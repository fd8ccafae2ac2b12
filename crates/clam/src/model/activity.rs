//! Records of what happened inside a sandbox: execs, sessions, artifacts,
//! plus idempotency bookkeeping for retried requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// Recorded, not yet sent to the node.
    Queued,
    /// Running on the node.
    Running,
    /// Exited (any exit code).
    Done,
    /// The node could not run it.
    Failed,
    /// Killed at its deadline.
    TimedOut,
}

/// Resources consumed by an exec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU time in milliseconds.
    pub cpu_ms: u64,
    /// Peak resident memory in bytes.
    pub peak_memory_bytes: u64,
}

/// One command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exec {
    /// Identifier.
    pub id: String,
    /// Owning sandbox.
    pub sandbox_id: String,
    /// Interactive session it ran in, if any.
    pub session_id: Option<String>,
    /// Monotonic per sandbox, assigned by the repository.
    pub seq: u64,
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// Status.
    pub status: ExecStatus,
    /// Exit code once done.
    pub exit_code: Option<i32>,
    /// Resource usage once done.
    pub resource_usage: Option<ResourceUsage>,
    /// Pointer to the stored output log.
    pub log_ref: Option<String>,
    /// When it was recorded.
    pub created_at: DateTime<Utc>,
    /// When the node started it.
    pub started_at: Option<DateTime<Utc>>,
    /// When it finished.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Status of an interactive shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Shell is alive.
    Running,
    /// Shell has been torn down.
    Destroyed,
}

/// An interactive shell inside a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Identifier.
    pub id: String,
    /// Owning sandbox.
    pub sandbox_id: String,
    /// Shell binary, e.g. `/bin/bash`.
    pub shell: String,
    /// Status.
    pub status: SessionStatus,
    /// When it was opened.
    pub created_at: DateTime<Utc>,
    /// When it was destroyed.
    pub destroyed_at: Option<DateTime<Utc>>,
}

/// A registered output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Identifier.
    pub id: String,
    /// Owning sandbox.
    pub sandbox_id: String,
    /// Path inside the sandbox.
    pub name: String,
    /// Size once collected.
    pub bytes: u64,
    /// Content hash once collected.
    pub sha256: Option<String>,
    /// Object storage key once collected.
    #[serde(rename = "ref")]
    pub storage_ref: Option<String>,
    /// When the stored object may be deleted.
    pub retention_until: Option<DateTime<Utc>>,
    /// When it was registered.
    pub created_at: DateTime<Utc>,
}

/// Progress of a request guarded by an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// The first request is still being served.
    InProgress,
    /// The response has been recorded.
    Completed,
}

/// A deduplication record for a retried mutating request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Client-supplied key.
    pub key: String,
    /// Org the key is scoped to.
    pub org_id: String,
    /// Progress.
    pub status: IdempotencyStatus,
    /// Recorded response status.
    pub response_status: Option<u16>,
    /// Recorded response body.
    pub response_body: Option<serde_json::Value>,
    /// When the first request arrived.
    pub created_at: DateTime<Utc>,
}
