//! The collaborator set every component is built from.

use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditLog, BillingGate, InMemoryAuditLog, InMemoryBillingGate};
use crate::clock::Clock;
use crate::error::Result;
use crate::model::{Node, NodeStatus};
use crate::node_client::{LoopbackNodeClient, NodeClient};
use crate::object_store::{InMemoryObjectStorage, ObjectStorage};
use crate::quota::{OrgQuota, QuotaResolver, StaticQuotaResolver};
use crate::repo::{
    ActivityRepository, ArtifactRepository, CatalogRepository, IdempotencyRepository,
    InMemoryRepository, NodeRepository, SandboxRepository,
};
use crate::store::{EphemeralStore, InMemoryEphemeralStore};

/// Handles to every external collaborator.
#[derive(Debug, Clone)]
pub struct Backends {
    /// Sandbox rows.
    pub sandboxes: Arc<dyn SandboxRepository>,
    /// Execs and sessions.
    pub activity: Arc<dyn ActivityRepository>,
    /// Registered artifacts.
    pub artifacts: Arc<dyn ArtifactRepository>,
    /// Idempotency keys.
    pub idempotency: Arc<dyn IdempotencyRepository>,
    /// Execution nodes.
    pub nodes: Arc<dyn NodeRepository>,
    /// Images and profiles.
    pub catalog: Arc<dyn CatalogRepository>,
    /// Leases, heartbeats, rate limits and event buffers.
    pub store: Arc<dyn EphemeralStore>,
    /// Hypervisor RPCs.
    pub node_client: Arc<dyn NodeClient>,
    /// Event logs and artifacts.
    pub objects: Arc<dyn ObjectStorage>,
    /// Per-org limits.
    pub quotas: Arc<dyn QuotaResolver>,
    /// Audit sink.
    pub audit: Arc<dyn AuditLog>,
    /// Plan enforcement.
    pub billing: Arc<dyn BillingGate>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// In-memory implementations of every collaborator, with typed handles kept
/// for inspection.
#[derive(Debug, Clone)]
pub struct MemoryBackends {
    /// Every repository.
    pub repo: Arc<InMemoryRepository>,
    /// Ephemeral store.
    pub store: Arc<InMemoryEphemeralStore>,
    /// Loopback node.
    pub node: Arc<LoopbackNodeClient>,
    /// Object storage.
    pub objects: Arc<InMemoryObjectStorage>,
    /// Quotas.
    pub quotas: Arc<StaticQuotaResolver>,
    /// Audit entries.
    pub audit: Arc<InMemoryAuditLog>,
    /// Billing gate.
    pub billing: Arc<InMemoryBillingGate>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl MemoryBackends {
    /// Fresh backends reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            repo: Arc::new(InMemoryRepository::new()),
            store: Arc::new(InMemoryEphemeralStore::new(clock.clone())),
            node: Arc::new(LoopbackNodeClient::new()),
            objects: Arc::new(InMemoryObjectStorage::new("clam", clock.clone())),
            quotas: Arc::new(StaticQuotaResolver::new(OrgQuota::default())),
            audit: Arc::new(InMemoryAuditLog::default()),
            billing: Arc::new(InMemoryBillingGate::default()),
            clock,
        }
    }

    /// Register an online node with a live heartbeat.
    pub async fn add_node(&self, node_id: &str, slots_total: u32, heartbeat: Duration) -> Result<()> {
        self.repo
            .upsert_node(Node {
                id: node_id.to_string(),
                status: NodeStatus::Online,
                slots_total,
            })
            .await?;
        self.store.register_heartbeat(node_id, heartbeat).await?;
        Ok(())
    }

    /// Type-erased handles for the lifecycle manager and workers.
    pub fn backends(&self) -> Backends {
        Backends {
            sandboxes: self.repo.clone(),
            activity: self.repo.clone(),
            artifacts: self.repo.clone(),
            idempotency: self.repo.clone(),
            nodes: self.repo.clone(),
            catalog: self.repo.clone(),
            store: self.store.clone(),
            node_client: self.node.clone(),
            objects: self.objects.clone(),
            quotas: self.quotas.clone(),
            audit: self.audit.clone(),
            billing: self.billing.clone(),
            clock: self.clock.clone(),
        }
    }
}
