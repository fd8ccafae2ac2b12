//! Jobs that expire stored data.

use std::time::Duration;

use async_trait::async_trait;

use super::BATCH_SIZE;
use crate::backends::Backends;
use crate::config::to_delta;
use crate::error::Result;
use crate::lifecycle::SandboxManager;
use crate::model::ReplayExpiry;
use crate::object_store::event_log_key;
use crate::worker::Worker;

/// Deletes idempotency keys older than the idempotency window.
#[derive(Debug, Clone)]
pub struct IdempotencyCleanupJob {
    manager: SandboxManager,
    interval: Duration,
}

impl IdempotencyCleanupJob {
    /// Create the job.
    pub fn new(manager: SandboxManager, interval: Duration) -> Self {
        Self { manager, interval }
    }
}

#[async_trait]
impl Worker for IdempotencyCleanupJob {
    fn name(&self) -> &'static str {
        "idempotency_cleanup"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        let backends = self.manager.backends();
        let cutoff = backends.clock.now() - to_delta(self.manager.config().idempotency_window);
        backends.idempotency.delete_older_than(cutoff).await
    }
}

/// Deletes artifacts whose retention has lapsed, object first.
#[derive(Debug, Clone)]
pub struct ArtifactRetentionJob {
    backends: Backends,
    interval: Duration,
}

impl ArtifactRetentionJob {
    /// Create the job.
    pub fn new(backends: Backends, interval: Duration) -> Self {
        Self { backends, interval }
    }
}

#[async_trait]
impl Worker for ArtifactRetentionJob {
    fn name(&self) -> &'static str {
        "artifact_retention"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        let now = self.backends.clock.now();
        let mut deleted = 0;
        for artifact in self
            .backends
            .artifacts
            .list_expired_artifacts(now, BATCH_SIZE)
            .await?
        {
            if let Some(storage_ref) = artifact.storage_ref.as_deref()
                && let Err(err) = self.backends.objects.delete_object(storage_ref).await
            {
                // Keep the row so the object is retried.
                tracing::warn!(artifact_id = %artifact.id, error = %err, "artifact object delete failed");
                continue;
            }
            if self.backends.artifacts.delete_artifact(&artifact.id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Two-phase replay retention.
///
/// Phase one gives every ended sandbox an expiry of `ended_at` plus its org's
/// retention. Phase two deletes the event log and exec output logs of every
/// expired replay and marks it purged; purged rows are never selected again.
/// Both phases run on every tick, so a row can move through both at once, and
/// each change counts.
#[derive(Debug, Clone)]
pub struct ReplayRetentionJob {
    backends: Backends,
    interval: Duration,
}

impl ReplayRetentionJob {
    /// Create the job.
    pub fn new(backends: Backends, interval: Duration) -> Self {
        Self { backends, interval }
    }

    async fn assign_expiries(&self) -> Result<usize> {
        let mut assigned = 0;
        for sandbox in self
            .backends
            .sandboxes
            .list_unset_replay_expiry(BATCH_SIZE)
            .await?
        {
            let Some(ended_at) = sandbox.ended_at else {
                continue;
            };
            let retention = self
                .backends
                .quotas
                .get_org_quota(&sandbox.org_id)
                .await?
                .replay_retention();
            if self
                .backends
                .sandboxes
                .set_replay_expires_at(
                    &sandbox.id,
                    ReplayExpiry::Unset,
                    ReplayExpiry::At(ended_at + retention),
                )
                .await?
            {
                assigned += 1;
            }
        }
        Ok(assigned)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.backends.clock.now();
        let mut purged = 0;
        for sandbox in self
            .backends
            .sandboxes
            .list_expired_replays(now, BATCH_SIZE)
            .await?
        {
            if let Err(err) = self
                .backends
                .objects
                .delete_object(&event_log_key(&sandbox.id))
                .await
            {
                tracing::warn!(sandbox_id = %sandbox.id, error = %err, "event log delete failed");
                continue;
            }
            if !self.purge_exec_logs(&sandbox.id).await? {
                continue;
            }
            if self
                .backends
                .sandboxes
                .set_replay_expires_at(&sandbox.id, sandbox.replay_expires_at, ReplayExpiry::Purged)
                .await?
            {
                tracing::info!(sandbox_id = %sandbox.id, "replay purged");
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Delete every exec output log of a sandbox. False if any delete failed.
    async fn purge_exec_logs(&self, sandbox_id: &str) -> Result<bool> {
        let mut clean = true;
        for exec in self.backends.activity.list_execs(sandbox_id).await? {
            let Some(log_ref) = exec.log_ref.as_deref() else {
                continue;
            };
            if let Err(err) = self.backends.objects.delete_object(log_ref).await {
                tracing::warn!(sandbox_id = %sandbox_id, exec_id = %exec.id, error = %err, "exec log delete failed");
                clean = false;
            }
        }
        Ok(clean)
    }
}

#[async_trait]
impl Worker for ReplayRetentionJob {
    fn name(&self) -> &'static str {
        "replay_retention"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        let assigned = self.assign_expiries().await?;
        let purged = self.purge_expired().await?;
        Ok(assigned + purged)
    }
}

/// Placeholder for permanent org erasure after the compliance window.
#[derive(Debug, Clone)]
pub struct OrgHardDeleteJob {
    interval: Duration,
}

impl OrgHardDeleteJob {
    /// Create the job.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Worker for OrgHardDeleteJob {
    fn name(&self) -> &'static str {
        "org_hard_delete"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        Ok(0)
    }
}
