//! Replay bundle assembly.
//!
//! A replay is one versioned document describing everything that happened in
//! a sandbox: where it sits in its fork tree, its execs, sessions and
//! artifacts, and a short-lived link to the durable event log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backends::Backends;
use crate::error::{ControlError, Result};
use crate::lifecycle::fork_tree::{children_index, find_root};
use crate::model::{Artifact, Exec, Sandbox, SandboxStatus, Session};
use crate::object_store::event_log_key;

/// Current bundle format.
pub const REPLAY_VERSION: u32 = 1;

/// Whether the sandbox can still produce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    /// The sandbox has not ended.
    InProgress,
    /// The sandbox has ended.
    Complete,
}

/// A node of the nested fork tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayTreeNode {
    /// Sandbox id.
    pub sandbox_id: String,
    /// When the fork was created, `None` for the root.
    pub forked_at: Option<DateTime<Utc>>,
    /// Direct children, oldest first.
    pub children: Vec<ReplayTreeNode>,
}

/// Everything needed to replay a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayBundle {
    /// Bundle format version.
    pub version: u32,
    /// The sandbox this replay describes.
    pub sandbox_id: String,
    /// Sandbox status at assembly time.
    pub sandbox_status: SandboxStatus,
    /// Whether more events may still arrive.
    pub status: ReplayStatus,
    /// The whole fork tree, from its root.
    pub fork_tree: ReplayTreeNode,
    /// Execs in sequence order.
    pub execs: Vec<Exec>,
    /// Sessions, oldest first.
    pub sessions: Vec<Session>,
    /// Registered artifacts.
    pub artifacts: Vec<Artifact>,
    /// Creation to end, once ended.
    pub total_duration_ms: Option<i64>,
    /// Presigned link to the JSON-lines event log.
    pub events_url: String,
    /// When `events_url` stops working.
    pub events_url_expires_at: DateTime<Utc>,
}

/// Builds replay bundles.
#[derive(Debug, Clone)]
pub struct ReplayAssembler {
    backends: Backends,
    presign_ttl: std::time::Duration,
}

impl ReplayAssembler {
    /// Create an assembler presigning event-log links for `presign_ttl`.
    pub fn new(backends: Backends, presign_ttl: std::time::Duration) -> Self {
        Self {
            backends,
            presign_ttl,
        }
    }

    /// Assemble the replay of `sandbox_id` for `viewer_org`.
    ///
    /// Private replays are only visible to the owning org; anyone else,
    /// including anonymous viewers, gets not-found. Expired replays are
    /// refused with [`ControlError::Gone`] before any assembly.
    pub async fn get_replay(
        &self,
        viewer_org: Option<&str>,
        sandbox_id: &str,
    ) -> Result<ReplayBundle> {
        let sandbox = self
            .backends
            .sandboxes
            .find_by_id(sandbox_id)
            .await?
            .ok_or_else(|| ControlError::sandbox_not_found(sandbox_id))?;

        if !sandbox.replay_public && viewer_org != Some(sandbox.org_id.as_str()) {
            return Err(ControlError::sandbox_not_found(sandbox_id));
        }
        let now = self.backends.clock.now();
        if sandbox.replay_expires_at.is_expired(now) {
            return Err(ControlError::Gone(sandbox.id));
        }

        let members = self.backends.sandboxes.list_tree(&sandbox.root_id).await?;
        let root = find_root(&members).ok_or_else(|| {
            ControlError::Repository(format!("fork tree {} has no root", sandbox.root_id))
        })?;
        let fork_tree = nest(root, &children_index(&members));

        let execs = self.backends.activity.list_execs(&sandbox.id).await?;
        let sessions = self.backends.activity.list_sessions(&sandbox.id).await?;
        let artifacts = self.backends.artifacts.list_artifacts(&sandbox.id).await?;

        let events_url = self
            .backends
            .objects
            .get_presigned_url(&event_log_key(&sandbox.id), self.presign_ttl)
            .await?;
        let events_url_expires_at = now + crate::config::to_delta(self.presign_ttl);

        let status = if sandbox.status.is_terminal() {
            ReplayStatus::Complete
        } else {
            ReplayStatus::InProgress
        };

        tracing::debug!(sandbox_id = %sandbox.id, execs = execs.len(), "replay assembled");
        Ok(ReplayBundle {
            version: REPLAY_VERSION,
            sandbox_id: sandbox.id.clone(),
            sandbox_status: sandbox.status,
            status,
            fork_tree,
            execs,
            sessions,
            artifacts,
            total_duration_ms: sandbox.total_duration_ms(),
            events_url,
            events_url_expires_at,
        })
    }
}

fn nest(sandbox: &Sandbox, index: &HashMap<&str, Vec<&Sandbox>>) -> ReplayTreeNode {
    ReplayTreeNode {
        sandbox_id: sandbox.id.clone(),
        forked_at: sandbox.forked_from.as_ref().map(|_| sandbox.created_at),
        children: index
            .get(sandbox.id.as_str())
            .map(|children| children.iter().map(|child| nest(child, index)).collect())
            .unwrap_or_default(),
    }
}
