//! The reconciliation jobs every instance runs.
//!
//! | Job | Acts on | Effect |
//! |---|---|---|
//! | `ttl` | running sandboxes past their TTL | stop, `ttl_exceeded` |
//! | `idle` | running sandboxes idle past the org window | stop, `idle_timeout` |
//! | `queue_timeout` | sandboxes queued too long | fail, `queue_timeout` |
//! | `orphan` | running sandboxes on a node with no heartbeat | fail, `node_lost` |
//! | `idempotency_cleanup` | idempotency keys past the window | delete |
//! | `artifact_retention` | artifacts past `retention_until` | delete object and row |
//! | `replay_retention` | ended sandboxes | compute expiry, then purge the event log |
//! | `org_hard_delete` | nothing yet | none |
//!
//! Every job tolerates per-item failures: the item is logged and left for the
//! next tick, and only items actually changed are counted.

mod retention;
mod sandbox;

use std::sync::Arc;

pub use retention::{ArtifactRetentionJob, IdempotencyCleanupJob, OrgHardDeleteJob, ReplayRetentionJob};
pub use sandbox::{IdleShutdownJob, OrphanReconcileJob, QueueTimeoutJob, TtlEnforcementJob};

use super::Worker;
use crate::lifecycle::SandboxManager;

/// Upper bound on rows one retention tick reads per query.
pub const BATCH_SIZE: usize = 500;

/// Every job, wired to `manager` and ticking on its configured intervals.
pub fn standard_workers(manager: &SandboxManager) -> Vec<Arc<dyn Worker>> {
    let intervals = manager.config().intervals.clone();
    vec![
        Arc::new(TtlEnforcementJob::new(manager.clone(), intervals.ttl)),
        Arc::new(IdleShutdownJob::new(manager.clone(), intervals.idle)),
        Arc::new(QueueTimeoutJob::new(manager.clone(), intervals.queue_timeout)),
        Arc::new(OrphanReconcileJob::new(manager.clone(), intervals.orphan)),
        Arc::new(IdempotencyCleanupJob::new(manager.clone(), intervals.idempotency)),
        Arc::new(ArtifactRetentionJob::new(
            manager.backends().clone(),
            intervals.artifact_retention,
        )),
        Arc::new(ReplayRetentionJob::new(
            manager.backends().clone(),
            intervals.replay_retention,
        )),
        Arc::new(OrgHardDeleteJob::new(intervals.org_hard_delete)),
    ]
}
