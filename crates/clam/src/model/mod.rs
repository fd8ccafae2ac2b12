//! Domain records shared by the lifecycle manager, workers and replay.
//!
//! These are the logical shapes the control plane depends on; how a repository
//! lays them out in tables is up to the repository implementation.

mod activity;
mod node;
mod sandbox;

pub use activity::{
    Artifact, Exec, ExecStatus, IdempotencyRecord, IdempotencyStatus, ResourceUsage, Session,
    SessionStatus,
};
pub use node::{Image, Node, NodeStatus, Profile};
pub use sandbox::{FailureReason, ReplayExpiry, Sandbox, SandboxStatus, purge_sentinel};
