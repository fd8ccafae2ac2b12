//! The sandbox record and its status machine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a sandbox.
///
/// The main line only moves forward:
///
/// ```text
/// queued -> provisioning -> running -> stopping -> stopped
/// ```
///
/// `failed` is reachable from any non-terminal status and `deleted` from any
/// status other than itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// Accepted, waiting for a node.
    Queued,
    /// The node is booting the VM.
    Provisioning,
    /// The VM is up.
    Running,
    /// Teardown in progress.
    Stopping,
    /// Torn down normally.
    Stopped,
    /// Ended abnormally.
    Failed,
    /// Soft-deleted.
    Deleted,
}

impl SandboxStatus {
    /// Statuses that count against the concurrency quota.
    pub const ACTIVE: [SandboxStatus; 4] = [
        Self::Queued,
        Self::Provisioning,
        Self::Running,
        Self::Stopping,
    ];

    /// Statuses after which the sandbox never runs again.
    pub const TERMINAL: [SandboxStatus; 3] = [Self::Stopped, Self::Failed, Self::Deleted];

    /// Returns true for stopped, failed and deleted.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Returns true for statuses that count against the concurrency quota.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// The string form used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    fn main_line_rank(&self) -> Option<u8> {
        match self {
            Self::Queued => Some(0),
            Self::Provisioning => Some(1),
            Self::Running => Some(2),
            Self::Stopping => Some(3),
            Self::Stopped => Some(4),
            Self::Failed | Self::Deleted => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Self-loops are not transitions; callers treat them as no-ops.
    pub fn can_transition_to(&self, next: SandboxStatus) -> bool {
        match (self, next) {
            (Self::Deleted, _) => false,
            (_, Self::Deleted) => true,
            (current, Self::Failed) => !current.is_terminal(),
            (current, _) if current.is_terminal() => false,
            (current, next) => match (current.main_line_rank(), next.main_line_rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a sandbox ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No node capacity became available in time.
    CapacityTimeout,
    /// The node stopped heartbeating.
    NodeLost,
    /// The node failed to boot the VM.
    ProvisionFailed,
    /// Stopped on request.
    SandboxStopped,
    /// Deleted on request.
    SandboxDeleted,
    /// Ran past its TTL.
    TtlExceeded,
    /// No activity within the org's idle window.
    IdleTimeout,
    /// Sat in the queue too long.
    QueueTimeout,
}

impl FailureReason {
    /// The string form used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CapacityTimeout => "capacity_timeout",
            Self::NodeLost => "node_lost",
            Self::ProvisionFailed => "provision_failed",
            Self::SandboxStopped => "sandbox_stopped",
            Self::SandboxDeleted => "sandbox_deleted",
            Self::TtlExceeded => "ttl_exceeded",
            Self::IdleTimeout => "idle_timeout",
            Self::QueueTimeout => "queue_timeout",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The far-future instant that column-backed repositories store for
/// [`ReplayExpiry::Purged`]: 9999-12-31T23:59:59Z.
pub fn purge_sentinel() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// When a sandbox's replay stops being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "at", rename_all = "snake_case")]
pub enum ReplayExpiry {
    /// Retention not computed yet.
    #[default]
    Unset,
    /// Replay is served until this instant.
    At(DateTime<Utc>),
    /// The durable event log has been deleted. Never reset.
    Purged,
}

impl ReplayExpiry {
    /// Whether the replay must be refused at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Unset => false,
            Self::At(at) => *at <= now,
            Self::Purged => true,
        }
    }

    /// Encode for a nullable timestamp column.
    pub fn to_column(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Unset => None,
            Self::At(at) => Some(*at),
            Self::Purged => Some(purge_sentinel()),
        }
    }

    /// Decode from a nullable timestamp column.
    pub fn from_column(value: Option<DateTime<Utc>>) -> Self {
        match value {
            None => Self::Unset,
            Some(at) if at >= purge_sentinel() => Self::Purged,
            Some(at) => Self::At(at),
        }
    }
}

/// An ephemeral compute sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    /// Time-ordered identifier.
    pub id: String,
    /// Owning organization.
    pub org_id: String,
    /// Node hosting the VM, once scheduled.
    pub node_id: Option<String>,
    /// Catalog image.
    pub image_id: String,
    /// Catalog profile id.
    pub profile_id: String,
    /// Catalog profile name.
    pub profile_name: String,
    /// Lifecycle status.
    pub status: SandboxStatus,
    /// Environment passed to the VM.
    pub env: BTreeMap<String, String>,
    /// Parent sandbox, for forks.
    pub forked_from: Option<String>,
    /// Root of the fork tree this sandbox belongs to (itself for roots).
    pub root_id: String,
    /// Zero for roots, parent depth + 1 for forks.
    pub fork_depth: u32,
    /// Direct children created from this sandbox.
    pub fork_count: u32,
    /// Maximum runtime once running.
    pub ttl_seconds: u64,
    /// Whether anyone may fetch the replay.
    pub replay_public: bool,
    /// Why the sandbox ended, once it has.
    pub failure_reason: Option<FailureReason>,
    /// Replay retention state.
    pub replay_expires_at: ReplayExpiry,
    /// Last exec, session or file activity.
    pub last_activity_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the sandbox reached `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the sandbox reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Sandbox {
    /// Whether this sandbox is the root of its fork tree.
    pub fn is_root(&self) -> bool {
        self.forked_from.is_none()
    }

    /// The instant the TTL runs out, if the sandbox has started.
    pub fn ttl_deadline(&self) -> Option<DateTime<Utc>> {
        let ttl = TimeDelta::try_seconds(i64::try_from(self.ttl_seconds).ok()?)?;
        self.started_at?.checked_add_signed(ttl)
    }

    /// Wall-clock lifetime in milliseconds, once ended.
    pub fn total_duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|ended| (ended - self.created_at).num_milliseconds())
    }
}
