//! In-memory repository implementation for testing.
//!
//! This module provides [`InMemoryRepository`], a single struct implementing
//! every repository trait. Conditional updates are checked and applied under
//! one write lock, so they behave like the row-level `UPDATE ... WHERE status =`
//! a relational backend would run.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use super::{
    ActivityRepository, ArtifactRepository, CatalogRepository, IdempotencyRepository,
    NodeRepository, Reservation, SandboxFilter, SandboxPage, SandboxRepository, StatusFields,
};
use crate::error::{ControlError, Result};
use crate::ids;
use crate::model::{
    Artifact, Exec, FailureReason, IdempotencyRecord, IdempotencyStatus, Image, Node, Profile,
    ReplayExpiry, Sandbox, SandboxStatus, Session, SessionStatus,
};

/// Image every fresh repository knows about.
pub const DEFAULT_IMAGE: &str = "ubuntu-22.04";

/// Converts a lock poison error to a repository error.
fn poison_err<T>(_: PoisonError<T>) -> ControlError {
    ControlError::Repository("lock poisoned".to_string())
}

#[derive(Debug, Default)]
struct ExecTable {
    rows: BTreeMap<String, Exec>,
    next_seq: HashMap<String, u64>,
}

/// In-memory repository for testing and development.
///
/// Rows are keyed by their time-ordered ids, so map order is creation order.
#[derive(Debug)]
pub struct InMemoryRepository {
    sandboxes: RwLock<BTreeMap<String, Sandbox>>,
    execs: RwLock<ExecTable>,
    sessions: RwLock<BTreeMap<String, Session>>,
    artifacts: RwLock<BTreeMap<String, Artifact>>,
    idempotency: RwLock<HashMap<(String, String), IdempotencyRecord>>,
    nodes: RwLock<BTreeMap<String, Node>>,
    images: RwLock<Vec<Image>>,
    profiles: RwLock<Vec<Profile>>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    /// Creates an empty repository with the default image and built-in profiles.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sandboxes: RwLock::new(BTreeMap::new()),
            execs: RwLock::new(ExecTable::default()),
            sessions: RwLock::new(BTreeMap::new()),
            artifacts: RwLock::new(BTreeMap::new()),
            idempotency: RwLock::new(HashMap::new()),
            nodes: RwLock::new(BTreeMap::new()),
            images: RwLock::new(vec![Image {
                id: format!("{}{DEFAULT_IMAGE}", ids::IMAGE_PREFIX),
                name: DEFAULT_IMAGE.to_string(),
            }]),
            profiles: RwLock::new(Profile::builtin()),
        }
    }

    /// Adds an image to the catalog.
    pub fn add_image(&self, image: Image) -> Result<()> {
        self.images.write().map_err(poison_err)?.push(image);
        Ok(())
    }

    /// Returns the number of sandbox rows, in any status.
    pub fn sandbox_count(&self) -> Result<usize> {
        Ok(self.sandboxes.read().map_err(poison_err)?.len())
    }

    /// Overwrites a sandbox row as-is.
    ///
    /// Bypasses the status machine; tests use it to stage rows.
    pub fn put_sandbox(&self, sandbox: Sandbox) -> Result<()> {
        self.sandboxes
            .write()
            .map_err(poison_err)?
            .insert(sandbox.id.clone(), sandbox);
        Ok(())
    }

    /// Returns every idempotency record.
    pub fn idempotency_records(&self) -> Result<Vec<IdempotencyRecord>> {
        Ok(self
            .idempotency
            .read()
            .map_err(poison_err)?
            .values()
            .cloned()
            .collect())
    }
}

fn idempotency_key(org_id: &str, key: &str) -> (String, String) {
    (org_id.to_string(), key.to_string())
}

#[async_trait]
impl SandboxRepository for InMemoryRepository {
    async fn create(&self, sandbox: Sandbox) -> Result<Sandbox> {
        let mut sandboxes = self.sandboxes.write().map_err(poison_err)?;
        if sandboxes.contains_key(&sandbox.id) {
            return Err(ControlError::Repository(format!(
                "duplicate sandbox id {}",
                sandbox.id
            )));
        }
        sandboxes.insert(sandbox.id.clone(), sandbox.clone());
        Ok(sandbox)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Sandbox>> {
        Ok(self.sandboxes.read().map_err(poison_err)?.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        expected: SandboxStatus,
        new: SandboxStatus,
        fields: StatusFields,
    ) -> Result<Option<Sandbox>> {
        let mut sandboxes = self.sandboxes.write().map_err(poison_err)?;
        let Some(sandbox) = sandboxes.get_mut(id) else {
            return Ok(None);
        };
        if sandbox.status != expected {
            return Ok(None);
        }

        sandbox.status = new;
        if let Some(node_id) = fields.node_id {
            sandbox.node_id = Some(node_id);
        }
        if let Some(started_at) = fields.started_at {
            sandbox.started_at = Some(started_at);
        }
        if let Some(ended_at) = fields.ended_at {
            sandbox.ended_at = Some(ended_at);
        }
        if let Some(reason) = fields.failure_reason {
            sandbox.failure_reason = Some(reason);
        }
        Ok(Some(sandbox.clone()))
    }

    async fn list(&self, filter: &SandboxFilter) -> Result<SandboxPage> {
        let sandboxes = self.sandboxes.read().map_err(poison_err)?;
        let page_size = filter.page_size();

        let mut matching = sandboxes.values().rev().filter(|s| filter.matches(s));
        let page: Vec<Sandbox> = matching.by_ref().take(page_size).cloned().collect();
        let next_cursor = if matching.next().is_some() {
            page.last().map(|s| s.id.clone())
        } else {
            None
        };

        Ok(SandboxPage {
            sandboxes: page,
            next_cursor,
        })
    }

    async fn list_by_status(&self, status: SandboxStatus) -> Result<Vec<Sandbox>> {
        let sandboxes = self.sandboxes.read().map_err(poison_err)?;
        Ok(sandboxes
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn count_active(&self, org_id: &str) -> Result<u64> {
        let sandboxes = self.sandboxes.read().map_err(poison_err)?;
        Ok(sandboxes
            .values()
            .filter(|s| s.org_id == org_id && s.status.is_active())
            .count() as u64)
    }

    async fn count_active_on_node(&self, node_id: &str) -> Result<u64> {
        let sandboxes = self.sandboxes.read().map_err(poison_err)?;
        Ok(sandboxes
            .values()
            .filter(|s| s.node_id.as_deref() == Some(node_id) && s.status.is_active())
            .count() as u64)
    }

    async fn create_fork(&self, child: Sandbox) -> Result<Sandbox> {
        let mut sandboxes = self.sandboxes.write().map_err(poison_err)?;
        let Some(parent_id) = child.forked_from.as_deref() else {
            return Err(ControlError::Repository(format!(
                "fork {} has no parent",
                child.id
            )));
        };
        if !sandboxes.contains_key(parent_id) {
            return Err(ControlError::Repository(format!(
                "fork parent {parent_id} does not exist"
            )));
        }
        if sandboxes.contains_key(&child.id) {
            return Err(ControlError::Repository(format!(
                "duplicate sandbox id {}",
                child.id
            )));
        }
        sandboxes.insert(child.id.clone(), child.clone());
        Ok(child)
    }

    async fn increment_fork_count(&self, parent_id: &str, limit: u32) -> Result<Option<u32>> {
        let mut sandboxes = self.sandboxes.write().map_err(poison_err)?;
        let Some(parent) = sandboxes.get_mut(parent_id) else {
            return Ok(None);
        };
        if parent.fork_count >= limit {
            return Ok(None);
        }
        parent.fork_count += 1;
        Ok(Some(parent.fork_count))
    }

    async fn list_tree(&self, root_id: &str) -> Result<Vec<Sandbox>> {
        let sandboxes = self.sandboxes.read().map_err(poison_err)?;
        Ok(sandboxes
            .values()
            .filter(|s| s.root_id == root_id)
            .cloned()
            .collect())
    }

    async fn list_unset_replay_expiry(&self, limit: usize) -> Result<Vec<Sandbox>> {
        let sandboxes = self.sandboxes.read().map_err(poison_err)?;
        Ok(sandboxes
            .values()
            .filter(|s| s.ended_at.is_some() && s.replay_expires_at == ReplayExpiry::Unset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_expired_replays(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Sandbox>> {
        let sandboxes = self.sandboxes.read().map_err(poison_err)?;
        Ok(sandboxes
            .values()
            .filter(|s| matches!(s.replay_expires_at, ReplayExpiry::At(at) if at <= now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_replay_expires_at(
        &self,
        id: &str,
        expected: ReplayExpiry,
        new: ReplayExpiry,
    ) -> Result<bool> {
        let mut sandboxes = self.sandboxes.write().map_err(poison_err)?;
        let Some(sandbox) = sandboxes.get_mut(id) else {
            return Ok(false);
        };
        if sandbox.replay_expires_at == ReplayExpiry::Purged
            || sandbox.replay_expires_at != expected
            || sandbox.ended_at.is_none()
        {
            return Ok(false);
        }
        sandbox.replay_expires_at = new;
        Ok(true)
    }

    async fn soft_delete(
        &self,
        id: &str,
        ended_at: DateTime<Utc>,
        reason: FailureReason,
    ) -> Result<Option<Sandbox>> {
        let mut sandboxes = self.sandboxes.write().map_err(poison_err)?;
        let Some(sandbox) = sandboxes.get_mut(id) else {
            return Ok(None);
        };
        if sandbox.status == SandboxStatus::Deleted {
            return Ok(None);
        }
        if sandbox.ended_at.is_none() {
            sandbox.ended_at = Some(ended_at);
            sandbox.failure_reason = Some(reason);
        }
        sandbox.status = SandboxStatus::Deleted;
        Ok(Some(sandbox.clone()))
    }

    async fn touch_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut sandboxes = self.sandboxes.write().map_err(poison_err)?;
        if let Some(sandbox) = sandboxes.get_mut(id)
            && sandbox.last_activity_at < at
        {
            sandbox.last_activity_at = at;
        }
        Ok(())
    }

    async fn set_replay_public(&self, id: &str, public: bool) -> Result<Option<Sandbox>> {
        let mut sandboxes = self.sandboxes.write().map_err(poison_err)?;
        Ok(sandboxes.get_mut(id).map(|sandbox| {
            sandbox.replay_public = public;
            sandbox.clone()
        }))
    }
}

#[async_trait]
impl ActivityRepository for InMemoryRepository {
    async fn create_exec(&self, mut exec: Exec) -> Result<Exec> {
        let mut table = self.execs.write().map_err(poison_err)?;
        let next = table.next_seq.entry(exec.sandbox_id.clone()).or_insert(0);
        *next += 1;
        exec.seq = *next;
        table.rows.insert(exec.id.clone(), exec.clone());
        Ok(exec)
    }

    async fn update_exec(&self, exec: Exec) -> Result<()> {
        let mut table = self.execs.write().map_err(poison_err)?;
        match table.rows.get_mut(&exec.id) {
            Some(row) => {
                *row = exec;
                Ok(())
            }
            None => Err(ControlError::NotFound {
                resource: "exec",
                id: exec.id,
            }),
        }
    }

    async fn list_execs(&self, sandbox_id: &str) -> Result<Vec<Exec>> {
        let table = self.execs.read().map_err(poison_err)?;
        let mut execs: Vec<Exec> = table
            .rows
            .values()
            .filter(|e| e.sandbox_id == sandbox_id)
            .cloned()
            .collect();
        execs.sort_by_key(|e| e.seq);
        Ok(execs)
    }

    async fn create_session(&self, session: Session, limit: u32) -> Result<Option<Session>> {
        let mut sessions = self.sessions.write().map_err(poison_err)?;
        let running = sessions
            .values()
            .filter(|s| s.sandbox_id == session.sandbox_id && s.status == SessionStatus::Running)
            .count();
        if running >= limit as usize {
            return Ok(None);
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(Some(session))
    }

    async fn find_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().map_err(poison_err)?.get(id).cloned())
    }

    async fn destroy_session(&self, id: &str, at: DateTime<Utc>) -> Result<Option<Session>> {
        let mut sessions = self.sessions.write().map_err(poison_err)?;
        Ok(sessions.get_mut(id).map(|session| {
            if session.status == SessionStatus::Running {
                session.status = SessionStatus::Destroyed;
                session.destroyed_at = Some(at);
            }
            session.clone()
        }))
    }

    async fn list_sessions(&self, sandbox_id: &str) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().map_err(poison_err)?;
        Ok(sessions
            .values()
            .filter(|s| s.sandbox_id == sandbox_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ArtifactRepository for InMemoryRepository {
    async fn register_artifacts(
        &self,
        sandbox_id: &str,
        names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<Artifact>> {
        let mut artifacts = self.artifacts.write().map_err(poison_err)?;
        let mut created = Vec::new();
        for name in names {
            let exists = artifacts
                .values()
                .chain(created.iter())
                .any(|a| a.sandbox_id == sandbox_id && a.name == *name);
            if exists {
                continue;
            }
            created.push(Artifact {
                id: ids::artifact_id(),
                sandbox_id: sandbox_id.to_string(),
                name: name.clone(),
                bytes: 0,
                sha256: None,
                storage_ref: None,
                retention_until: None,
                created_at: now,
            });
        }
        for artifact in &created {
            artifacts.insert(artifact.id.clone(), artifact.clone());
        }
        Ok(created)
    }

    async fn list_artifacts(&self, sandbox_id: &str) -> Result<Vec<Artifact>> {
        let artifacts = self.artifacts.read().map_err(poison_err)?;
        Ok(artifacts
            .values()
            .filter(|a| a.sandbox_id == sandbox_id)
            .cloned()
            .collect())
    }

    async fn update_artifact(&self, artifact: Artifact) -> Result<()> {
        let mut artifacts = self.artifacts.write().map_err(poison_err)?;
        match artifacts.get_mut(&artifact.id) {
            Some(row) => {
                *row = artifact;
                Ok(())
            }
            None => Err(ControlError::NotFound {
                resource: "artifact",
                id: artifact.id,
            }),
        }
    }

    async fn list_expired_artifacts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Artifact>> {
        let artifacts = self.artifacts.read().map_err(poison_err)?;
        Ok(artifacts
            .values()
            .filter(|a| a.retention_until.is_some_and(|until| until < now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_artifact(&self, id: &str) -> Result<bool> {
        Ok(self
            .artifacts
            .write()
            .map_err(poison_err)?
            .remove(id)
            .is_some())
    }
}

#[async_trait]
impl IdempotencyRepository for InMemoryRepository {
    async fn reserve(
        &self,
        org_id: &str,
        key: &str,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> Result<Reservation> {
        let mut records = self.idempotency.write().map_err(poison_err)?;
        let map_key = idempotency_key(org_id, key);

        if let Some(record) = records.get(&map_key)
            && record.created_at + window > now
        {
            return Ok(match record.status {
                IdempotencyStatus::InProgress => Reservation::InProgress,
                IdempotencyStatus::Completed => Reservation::Completed(record.clone()),
            });
        }

        records.insert(
            map_key,
            IdempotencyRecord {
                key: key.to_string(),
                org_id: org_id.to_string(),
                status: IdempotencyStatus::InProgress,
                response_status: None,
                response_body: None,
                created_at: now,
            },
        );
        Ok(Reservation::Reserved)
    }

    async fn complete(&self, org_id: &str, key: &str, status: u16, body: Value) -> Result<()> {
        let mut records = self.idempotency.write().map_err(poison_err)?;
        if let Some(record) = records.get_mut(&idempotency_key(org_id, key)) {
            record.status = IdempotencyStatus::Completed;
            record.response_status = Some(status);
            record.response_body = Some(body);
        }
        Ok(())
    }

    async fn release(&self, org_id: &str, key: &str) -> Result<()> {
        let mut records = self.idempotency.write().map_err(poison_err)?;
        let map_key = idempotency_key(org_id, key);
        if records
            .get(&map_key)
            .is_some_and(|r| r.status == IdempotencyStatus::InProgress)
        {
            records.remove(&map_key);
        }
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = self.idempotency.write().map_err(poison_err)?;
        let before = records.len();
        records.retain(|_, record| record.created_at >= cutoff);
        Ok(before - records.len())
    }
}

#[async_trait]
impl NodeRepository for InMemoryRepository {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self
            .nodes
            .read()
            .map_err(poison_err)?
            .values()
            .cloned()
            .collect())
    }

    async fn find_node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.nodes.read().map_err(poison_err)?.get(id).cloned())
    }

    async fn upsert_node(&self, node: Node) -> Result<()> {
        self.nodes
            .write()
            .map_err(poison_err)?
            .insert(node.id.clone(), node);
        Ok(())
    }
}

#[async_trait]
impl CatalogRepository for InMemoryRepository {
    async fn resolve_image(&self, name_or_id: &str) -> Result<Option<Image>> {
        let images = self.images.read().map_err(poison_err)?;
        Ok(images
            .iter()
            .find(|i| i.id == name_or_id || i.name == name_or_id)
            .cloned())
    }

    async fn resolve_profile(&self, name_or_id: &str) -> Result<Option<Profile>> {
        let profiles = self.profiles.read().map_err(poison_err)?;
        Ok(profiles
            .iter()
            .find(|p| p.id == name_or_id || p.name == name_or_id)
            .cloned())
    }
}
