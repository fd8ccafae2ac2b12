//! Control plane configuration.
//!
//! All durations serialize as whole seconds so a config file reads naturally:
//!
//! ```json
//! {
//!   "heartbeat_ttl": 45,
//!   "queue_timeout": 600,
//!   "intervals": { "orphan": 15 }
//! }
//! ```
//!
//! Missing fields fall back to [`ControlPlaneConfig::default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Tunables shared by the lifecycle manager, event buffer and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// How long a node heartbeat key lives. Nodes beat every 15s, so the
    /// default tolerates two missed beats before a node is considered lost.
    #[serde(with = "duration_secs")]
    pub heartbeat_ttl: Duration,
    /// How long a sandbox may sit in `queued` before it is failed.
    #[serde(with = "duration_secs")]
    pub queue_timeout: Duration,
    /// How long idempotency keys are honored.
    #[serde(with = "duration_secs")]
    pub idempotency_window: Duration,
    /// How long buffered events survive in the ephemeral store.
    #[serde(with = "duration_secs")]
    pub event_ttl: Duration,
    /// Lifetime of presigned event log URLs in replay bundles.
    #[serde(with = "duration_secs")]
    pub presign_ttl: Duration,
    /// Upper bound on a caller-supplied exec timeout.
    #[serde(with = "duration_secs")]
    pub max_exec_timeout: Duration,
    /// Exec timeout when the caller supplies none.
    #[serde(with = "duration_secs")]
    pub default_exec_timeout: Duration,
    /// Tick interval per worker.
    pub intervals: WorkerIntervals,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_secs(45),
            queue_timeout: Duration::from_secs(600),
            idempotency_window: Duration::from_secs(24 * 60 * 60),
            event_ttl: Duration::from_secs(60 * 60),
            presign_ttl: Duration::from_secs(60 * 60),
            max_exec_timeout: Duration::from_secs(300),
            default_exec_timeout: Duration::from_secs(30),
            intervals: WorkerIntervals::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Reject configurations the workers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_ttl.is_zero() {
            return Err(ControlError::Validation(
                "heartbeat_ttl must be greater than zero".to_string(),
            ));
        }
        if self.default_exec_timeout > self.max_exec_timeout {
            return Err(ControlError::Validation(format!(
                "default_exec_timeout ({}s) exceeds max_exec_timeout ({}s)",
                self.default_exec_timeout.as_secs(),
                self.max_exec_timeout.as_secs()
            )));
        }
        if let Some(name) = self.intervals.first_zero() {
            return Err(ControlError::Validation(format!(
                "worker interval `{name}` must be greater than zero"
            )));
        }
        Ok(())
    }
}

/// Tick interval for each reconciliation worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerIntervals {
    /// TTL enforcement.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Idle shutdown.
    #[serde(with = "duration_secs")]
    pub idle: Duration,
    /// Queue timeout.
    #[serde(with = "duration_secs")]
    pub queue_timeout: Duration,
    /// Orphan reconciliation.
    #[serde(with = "duration_secs")]
    pub orphan: Duration,
    /// Idempotency key cleanup.
    #[serde(with = "duration_secs")]
    pub idempotency: Duration,
    /// Artifact retention.
    #[serde(with = "duration_secs")]
    pub artifact_retention: Duration,
    /// Replay retention.
    #[serde(with = "duration_secs")]
    pub replay_retention: Duration,
    /// Org hard delete.
    #[serde(with = "duration_secs")]
    pub org_hard_delete: Duration,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            idle: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(15),
            orphan: Duration::from_secs(15),
            idempotency: Duration::from_secs(60 * 60),
            artifact_retention: Duration::from_secs(60 * 60),
            replay_retention: Duration::from_secs(5 * 60),
            org_hard_delete: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl WorkerIntervals {
    fn first_zero(&self) -> Option<&'static str> {
        [
            ("ttl", self.ttl),
            ("idle", self.idle),
            ("queue_timeout", self.queue_timeout),
            ("orphan", self.orphan),
            ("idempotency", self.idempotency),
            ("artifact_retention", self.artifact_retention),
            ("replay_retention", self.replay_retention),
            ("org_hard_delete", self.org_hard_delete),
        ]
        .into_iter()
        .find(|(_, interval)| interval.is_zero())
        .map(|(name, _)| name)
    }
}

/// Convert a std duration into a chrono delta, capped at a century.
pub(crate) fn to_delta(duration: Duration) -> chrono::TimeDelta {
    let cap = chrono::TimeDelta::days(36_500);
    chrono::TimeDelta::from_std(duration).map_or(cap, |delta| delta.min(cap))
}

/// Helper for serializing Duration as whole seconds
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
