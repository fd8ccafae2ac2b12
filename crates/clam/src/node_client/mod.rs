//! The boundary to the node-resident hypervisor daemon.
//!
//! The control plane only ever issues imperative commands through
//! [`NodeClient`]; how they travel to the node is up to the implementation.

pub mod loopback;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::model::{Profile, ResourceUsage};

pub use loopback::{LoopbackNodeClient, NodeOp};

/// Result type for node RPCs.
pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// Boot a fresh VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    /// Sandbox the VM backs.
    pub sandbox_id: String,
    /// Catalog image id.
    pub image_id: String,
    /// Resource shape.
    pub profile: Profile,
    /// Environment for the guest.
    pub env: BTreeMap<String, String>,
    /// Maximum runtime.
    pub ttl_seconds: u64,
}

/// Clone a running VM into a new sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkSandboxRequest {
    /// Running parent.
    pub source_sandbox_id: String,
    /// The child being created.
    pub new_sandbox_id: String,
    /// Merged environment for the child.
    pub env: BTreeMap<String, String>,
}

/// Run one command to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Target sandbox.
    pub sandbox_id: String,
    /// Exec row id.
    pub exec_id: String,
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
    /// Deadline; the node kills the process after this.
    pub timeout_seconds: u64,
}

/// Open an interactive shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Target sandbox.
    pub sandbox_id: String,
    /// Session row id.
    pub session_id: String,
    /// Shell binary.
    pub shell: String,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
}

/// Run a command line inside an open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExecRequest {
    /// Target sandbox.
    pub sandbox_id: String,
    /// Open session.
    pub session_id: String,
    /// Exec row id.
    pub exec_id: String,
    /// Command line, interpreted by the session's shell.
    pub cmd: String,
    /// Deadline.
    pub timeout_seconds: u64,
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl OutputStream {
    /// The string form used in event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Source stream.
    pub stream: OutputStream,
    /// Output text.
    pub data: String,
}

/// How a command finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code. Meaningless if `timed_out`.
    pub exit_code: i32,
    /// Output in the order it was produced.
    pub output: Vec<OutputChunk>,
    /// Resources consumed.
    pub resource_usage: ResourceUsage,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Whether the node killed it at its deadline.
    pub timed_out: bool,
}

impl ExecResult {
    /// Concatenated output for one stream.
    pub fn collect(&self, stream: OutputStream) -> String {
        self.output
            .iter()
            .filter(|chunk| chunk.stream == stream)
            .map(|chunk| chunk.data.as_str())
            .collect()
    }
}

/// An entry in a guest directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute path inside the guest.
    pub path: String,
    /// Size in bytes (zero for directories).
    pub size: u64,
    /// Whether this is a directory.
    pub is_dir: bool,
}

/// An artifact the node uploaded to object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedArtifact {
    /// Path it was collected from.
    pub name: String,
    /// Size.
    pub bytes: u64,
    /// Hex SHA-256 of the content.
    pub sha256: String,
    /// Object storage key.
    pub storage_ref: String,
}

/// RPCs to an execution node. Every call names the node it targets.
#[async_trait]
pub trait NodeClient: Send + Sync + std::fmt::Debug {
    /// Boot a VM for a new sandbox.
    async fn create_sandbox(&self, node_id: &str, request: &CreateSandboxRequest)
    -> NodeResult<()>;

    /// Fork a running VM.
    async fn fork_sandbox(&self, node_id: &str, request: &ForkSandboxRequest) -> NodeResult<()>;

    /// Gracefully stop a VM.
    async fn stop_sandbox(&self, node_id: &str, sandbox_id: &str) -> NodeResult<()>;

    /// Tear down a VM and its disk.
    async fn destroy_sandbox(&self, node_id: &str, sandbox_id: &str) -> NodeResult<()>;

    /// Run a command to completion.
    async fn exec(&self, node_id: &str, request: &ExecRequest) -> NodeResult<ExecResult>;

    /// Open an interactive shell.
    async fn create_session(&self, node_id: &str, request: &CreateSessionRequest)
    -> NodeResult<()>;

    /// Run a command line in an open shell.
    async fn session_exec(
        &self,
        node_id: &str,
        request: &SessionExecRequest,
    ) -> NodeResult<ExecResult>;

    /// Write raw input to an open shell.
    async fn session_input(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        data: &str,
    ) -> NodeResult<()>;

    /// Close a shell.
    async fn destroy_session(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
    ) -> NodeResult<()>;

    /// Write a file, returning the bytes written.
    async fn put_file(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
        data: Vec<u8>,
    ) -> NodeResult<u64>;

    /// Read a file.
    async fn get_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<Vec<u8>>;

    /// List entries under a directory.
    async fn list_files(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
    ) -> NodeResult<Vec<FileEntry>>;

    /// Delete a file.
    async fn delete_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<()>;

    /// Upload the given paths to object storage. Missing paths are skipped.
    async fn collect_artifacts(
        &self,
        node_id: &str,
        sandbox_id: &str,
        paths: &[String],
    ) -> NodeResult<Vec<CollectedArtifact>>;
}
