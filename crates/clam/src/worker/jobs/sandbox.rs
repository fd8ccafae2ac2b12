//! Jobs that move sandboxes through their status machine.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;

use crate::config::to_delta;
use crate::error::Result;
use crate::lifecycle::{SandboxManager, StopDisposition, Transition};
use crate::model::{FailureReason, Sandbox, SandboxStatus};
use crate::repo::StatusFields;
use crate::worker::Worker;

/// Stops running sandboxes whose TTL has run out.
#[derive(Debug, Clone)]
pub struct TtlEnforcementJob {
    manager: SandboxManager,
    interval: Duration,
}

impl TtlEnforcementJob {
    /// Create the job.
    pub fn new(manager: SandboxManager, interval: Duration) -> Self {
        Self { manager, interval }
    }
}

#[async_trait]
impl Worker for TtlEnforcementJob {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        let backends = self.manager.backends();
        let now = backends.clock.now();
        let mut stopped = 0;
        for sandbox in backends
            .sandboxes
            .list_by_status(SandboxStatus::Running)
            .await?
        {
            if sandbox.ttl_deadline().is_some_and(|deadline| deadline <= now)
                && stop(&self.manager, sandbox, FailureReason::TtlExceeded).await
            {
                stopped += 1;
            }
        }
        Ok(stopped)
    }
}

/// Stops running sandboxes with no activity inside their org's idle window.
#[derive(Debug, Clone)]
pub struct IdleShutdownJob {
    manager: SandboxManager,
    interval: Duration,
}

impl IdleShutdownJob {
    /// Create the job.
    pub fn new(manager: SandboxManager, interval: Duration) -> Self {
        Self { manager, interval }
    }
}

#[async_trait]
impl Worker for IdleShutdownJob {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        let backends = self.manager.backends();
        let now = backends.clock.now();
        let mut windows: HashMap<String, TimeDelta> = HashMap::new();
        let mut stopped = 0;

        for sandbox in backends
            .sandboxes
            .list_by_status(SandboxStatus::Running)
            .await?
        {
            let window = match windows.get(&sandbox.org_id) {
                Some(window) => *window,
                None => {
                    let window = backends
                        .quotas
                        .get_org_quota(&sandbox.org_id)
                        .await?
                        .idle_timeout();
                    windows.insert(sandbox.org_id.clone(), window);
                    window
                }
            };
            if now - sandbox.last_activity_at >= window
                && stop(&self.manager, sandbox, FailureReason::IdleTimeout).await
            {
                stopped += 1;
            }
        }
        Ok(stopped)
    }
}

/// Fails sandboxes that have sat in the queue past the configured bound.
#[derive(Debug, Clone)]
pub struct QueueTimeoutJob {
    manager: SandboxManager,
    interval: Duration,
}

impl QueueTimeoutJob {
    /// Create the job.
    pub fn new(manager: SandboxManager, interval: Duration) -> Self {
        Self { manager, interval }
    }
}

#[async_trait]
impl Worker for QueueTimeoutJob {
    fn name(&self) -> &'static str {
        "queue_timeout"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        let backends = self.manager.backends();
        let cutoff = backends.clock.now() - to_delta(self.manager.config().queue_timeout);
        let mut failed = 0;
        for sandbox in backends
            .sandboxes
            .list_by_status(SandboxStatus::Queued)
            .await?
        {
            if sandbox.created_at <= cutoff
                && fail(&self.manager, &sandbox, FailureReason::QueueTimeout).await
            {
                failed += 1;
            }
        }
        Ok(failed)
    }
}

/// Fails running sandboxes whose node has stopped heartbeating.
///
/// Liveness is heartbeat presence only. The node's maintenance status is not
/// consulted since it does not change when a node crashes.
#[derive(Debug, Clone)]
pub struct OrphanReconcileJob {
    manager: SandboxManager,
    interval: Duration,
}

impl OrphanReconcileJob {
    /// Create the job.
    pub fn new(manager: SandboxManager, interval: Duration) -> Self {
        Self { manager, interval }
    }
}

#[async_trait]
impl Worker for OrphanReconcileJob {
    fn name(&self) -> &'static str {
        "orphan"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        let backends = self.manager.backends();
        let mut alive: HashMap<String, bool> = HashMap::new();
        let mut failed = 0;

        for sandbox in backends
            .sandboxes
            .list_by_status(SandboxStatus::Running)
            .await?
        {
            let Some(node_id) = sandbox.node_id.clone() else {
                continue;
            };
            let live = match alive.get(&node_id) {
                Some(live) => *live,
                None => {
                    let live = backends.store.has_heartbeat(&node_id).await?;
                    alive.insert(node_id.clone(), live);
                    live
                }
            };
            if live {
                continue;
            }
            tracing::warn!(sandbox_id = %sandbox.id, node_id = %node_id, "node heartbeat missing");
            if fail(&self.manager, &sandbox, FailureReason::NodeLost).await {
                failed += 1;
            }
        }
        Ok(failed)
    }
}

/// Returns whether this call stopped the sandbox.
async fn stop(manager: &SandboxManager, sandbox: Sandbox, reason: FailureReason) -> bool {
    let id = sandbox.id.clone();
    match manager.stop_with_reason(sandbox, reason).await {
        Ok(outcome) => outcome.disposition == StopDisposition::Stopped,
        Err(err) => {
            tracing::warn!(sandbox_id = %id, reason = %reason, error = %err, "stop failed, retrying next tick");
            false
        }
    }
}

/// Returns whether this call failed the sandbox.
async fn fail(manager: &SandboxManager, sandbox: &Sandbox, reason: FailureReason) -> bool {
    let fields = StatusFields {
        failure_reason: Some(reason),
        ..StatusFields::default()
    };
    match manager
        .transition(sandbox, SandboxStatus::Failed, fields)
        .await
    {
        Ok(Transition::Applied(_)) => true,
        Ok(Transition::Superseded(_)) => false,
        Err(err) => {
            tracing::warn!(sandbox_id = %sandbox.id, reason = %reason, error = %err, "fail transition failed, retrying next tick");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backends::MemoryBackends;
    use crate::clock::{Clock, ManualClock};
    use crate::config::ControlPlaneConfig;
    use crate::lifecycle::CreateSandboxParams;
    use crate::quota::OrgQuota;
    use crate::repo::SandboxRepository;

    const HEARTBEAT: Duration = Duration::from_secs(45);

    struct Harness {
        memory: MemoryBackends,
        clock: Arc<ManualClock>,
        manager: SandboxManager,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::default());
        let memory = MemoryBackends::new(clock.clone());
        memory.add_node("node_1", 8, HEARTBEAT).await.unwrap();
        let manager = SandboxManager::new(memory.backends(), ControlPlaneConfig::default());
        Harness {
            memory,
            clock,
            manager,
        }
    }

    async fn running(h: &Harness, ttl_seconds: u64) -> Sandbox {
        h.manager
            .create(
                "org_a",
                CreateSandboxParams {
                    ttl_seconds: Some(ttl_seconds),
                    ..CreateSandboxParams::default()
                },
            )
            .await
            .unwrap()
    }

    async fn status_of(h: &Harness, id: &str) -> Sandbox {
        h.manager.get("org_a", id).await.unwrap()
    }

    // ==================== TTL Tests ====================

    #[tokio::test]
    async fn test_ttl_stops_expired_sandboxes_once() {
        let h = harness().await;
        let short = running(&h, 60).await;
        let long = running(&h, 3600).await;
        let job = TtlEnforcementJob::new(h.manager.clone(), Duration::from_secs(10));

        assert_eq!(job.run().await.unwrap(), 0);
        h.clock.advance(TimeDelta::seconds(60));

        assert_eq!(job.run().await.unwrap(), 1);
        let stopped = status_of(&h, &short.id).await;
        assert_eq!(stopped.status, SandboxStatus::Stopped);
        assert_eq!(stopped.failure_reason, Some(FailureReason::TtlExceeded));
        assert!(stopped.ended_at.is_some());
        assert_eq!(status_of(&h, &long.id).await.status, SandboxStatus::Running);

        assert_eq!(job.run().await.unwrap(), 0);
    }

    // ==================== Idle Tests ====================

    #[tokio::test]
    async fn test_idle_uses_org_window_and_activity() {
        let h = harness().await;
        h.memory.quotas.set_org_quota(
            "org_a",
            OrgQuota {
                idle_timeout_seconds: 300,
                ..OrgQuota::default()
            },
        );
        let idle = running(&h, 3600).await;
        let busy = running(&h, 3600).await;
        let job = IdleShutdownJob::new(h.manager.clone(), Duration::from_secs(30));

        h.clock.advance(TimeDelta::seconds(200));
        h.manager
            .put_file("org_a", &busy.id, "/tmp/x", b"x".to_vec())
            .await
            .unwrap();
        h.clock.advance(TimeDelta::seconds(100));

        assert_eq!(job.run().await.unwrap(), 1);
        let stopped = status_of(&h, &idle.id).await;
        assert_eq!(stopped.failure_reason, Some(FailureReason::IdleTimeout));
        assert_eq!(status_of(&h, &busy.id).await.status, SandboxStatus::Running);
    }

    // ==================== Queue Timeout Tests ====================

    #[tokio::test]
    async fn test_queue_timeout_fails_stale_queued_sandboxes() {
        let clock = Arc::new(ManualClock::default());
        let memory = MemoryBackends::new(clock.clone());
        let manager = SandboxManager::new(memory.backends(), ControlPlaneConfig::default());

        // No nodes: create leaves the sandbox queued.
        assert!(manager.create("org_a", CreateSandboxParams::default()).await.is_err());
        let queued = memory
            .repo
            .list_by_status(SandboxStatus::Queued)
            .await
            .unwrap()
            .remove(0);

        let job = QueueTimeoutJob::new(manager.clone(), Duration::from_secs(15));
        assert_eq!(job.run().await.unwrap(), 0);

        clock.advance(to_delta(manager.config().queue_timeout));
        assert_eq!(job.run().await.unwrap(), 1);
        let failed = manager.get("org_a", &queued.id).await.unwrap();
        assert_eq!(failed.status, SandboxStatus::Failed);
        assert_eq!(failed.failure_reason, Some(FailureReason::QueueTimeout));
        assert!(failed.ended_at.is_some());

        assert_eq!(job.run().await.unwrap(), 0);
    }

    // ==================== Orphan Tests ====================

    #[tokio::test]
    async fn test_orphan_fails_only_sandboxes_on_dead_nodes() {
        let h = harness().await;
        let live = running(&h, 3600).await;

        // Stage a running sandbox on a node that never heartbeated.
        let mut orphan = live.clone();
        orphan.id = "sb_orphan".to_string();
        orphan.root_id = orphan.id.clone();
        orphan.node_id = Some("node_dead".to_string());
        h.memory.repo.put_sandbox(orphan).unwrap();

        let job = OrphanReconcileJob::new(h.manager.clone(), Duration::from_secs(15));
        assert_eq!(job.run().await.unwrap(), 1);

        let failed = status_of(&h, "sb_orphan").await;
        assert_eq!(failed.status, SandboxStatus::Failed);
        assert_eq!(failed.failure_reason, Some(FailureReason::NodeLost));
        assert!(failed.ended_at.is_some());
        assert_eq!(status_of(&h, &live.id).await.status, SandboxStatus::Running);

        assert_eq!(job.run().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_orphan_follows_heartbeat_expiry() {
        let h = harness().await;
        let sandbox = running(&h, 7200).await;
        let job = OrphanReconcileJob::new(h.manager.clone(), Duration::from_secs(15));

        assert_eq!(job.run().await.unwrap(), 0);
        h.clock.advance(TimeDelta::seconds(46));
        assert_eq!(job.run().await.unwrap(), 1);
        let failed = status_of(&h, &sandbox.id).await;
        assert_eq!(failed.ended_at, Some(h.clock.now()));
    }
}
