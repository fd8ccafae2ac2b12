//! Leader-elected background workers.
//!
//! Any number of control plane instances run the same set of workers. Each
//! tick first takes or renews a lease named after the worker in the
//! [`EphemeralStore`]; only the holder runs the handler. A crashed holder
//! stops renewing and another instance takes over once the lease expires.
//!
//! Handlers are reconciliation passes over shared state, so running one zero,
//! one or many times must leave the same result.

pub mod jobs;
mod scheduler;

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::Result;
use crate::store::EphemeralStore;

pub use scheduler::WorkerScheduler;

/// Count reported when another instance holds the lease.
pub const NOT_LEADER: i64 = -1;

/// Count reported when the handler returned an error or panicked.
pub const HANDLER_FAILED: i64 = -2;

/// A named, periodically ticked reconciliation handler.
#[async_trait]
pub trait Worker: Send + Sync + std::fmt::Debug {
    /// Unique name; also the lease key.
    fn name(&self) -> &'static str;

    /// Time between ticks.
    fn interval(&self) -> Duration;

    /// How long a lease taken for one tick stays live.
    ///
    /// Must be at least [`Worker::interval`] so the holder renews before it
    /// lapses.
    fn lease_ttl(&self) -> Duration {
        self.interval().saturating_mul(2)
    }

    /// Run one pass. Returns the number of items acted on.
    async fn run(&self) -> Result<usize>;
}

/// What happened on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// This instance held the lease and the handler acted on this many items.
    Processed(usize),
    /// Another instance holds the lease; the handler did not run.
    NotLeader,
    /// The lease could not be taken or the handler failed.
    Failed,
}

impl TickOutcome {
    /// The integer form: item count, [`NOT_LEADER`] or [`HANDLER_FAILED`].
    pub fn as_count(&self) -> i64 {
        match self {
            Self::Processed(count) => i64::try_from(*count).unwrap_or(i64::MAX),
            Self::NotLeader => NOT_LEADER,
            Self::Failed => HANDLER_FAILED,
        }
    }
}

/// The lease key for a worker.
pub fn lease_name(worker: &str) -> String {
    format!("worker:{worker}")
}

/// Run one tick of `worker` as `instance_id`.
///
/// Never fails: errors and panics in the handler are logged and reported as
/// [`TickOutcome::Failed`].
pub async fn run_worker_tick(
    worker: &dyn Worker,
    store: &dyn EphemeralStore,
    instance_id: &str,
) -> TickOutcome {
    let name = worker.name();
    let lease = match store
        .acquire_or_renew_lease(&lease_name(name), instance_id, worker.lease_ttl())
        .await
    {
        Ok(lease) => lease,
        Err(err) => {
            tracing::error!(worker = name, error = %err, "lease acquisition failed");
            return TickOutcome::Failed;
        }
    };
    if !lease.is_leader() {
        tracing::debug!(worker = name, instance_id = %instance_id, lease = ?lease, "not leader, skipping tick");
        return TickOutcome::NotLeader;
    }
    tracing::debug!(worker = name, instance_id = %instance_id, lease = ?lease, "holding lease");

    match AssertUnwindSafe(worker.run()).catch_unwind().await {
        Ok(Ok(count)) => {
            if count > 0 {
                tracing::info!(worker = name, count, "worker tick processed items");
            }
            TickOutcome::Processed(count)
        }
        Ok(Err(err)) => {
            tracing::error!(worker = name, error = %err, "worker tick failed");
            TickOutcome::Failed
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(worker = name, panic = %message, "worker tick panicked");
            TickOutcome::Failed
        }
    }
}
