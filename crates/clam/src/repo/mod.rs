//! Durable persistence facades.
//!
//! The control plane never touches a database directly; it talks to these
//! traits. Every mutation that can race with another instance is expressed as
//! a conditional update (an expected prior value plus the new one) so callers
//! never need an in-process lock on a row.
//!
//! [`memory::InMemoryRepository`] implements every trait here and backs the
//! tests and the development worker.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::model::{
    Artifact, Exec, FailureReason, IdempotencyRecord, Image, Node, Profile, ReplayExpiry, Sandbox,
    SandboxStatus, Session,
};

pub use memory::InMemoryRepository;

/// Default page size for [`SandboxRepository::list`].
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page [`SandboxRepository::list`] will return.
pub const MAX_PAGE_SIZE: usize = 200;

/// Fields written alongside a status change.
///
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusFields {
    /// Node assignment.
    pub node_id: Option<String>,
    /// When the sandbox reached `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the sandbox reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the sandbox ended.
    pub failure_reason: Option<FailureReason>,
}

/// Filter and cursor for listing sandboxes, newest first.
#[derive(Debug, Clone, Default)]
pub struct SandboxFilter {
    /// Only this org's sandboxes.
    pub org_id: Option<String>,
    /// Only these statuses (empty means any).
    pub statuses: Vec<SandboxStatus>,
    /// Only direct children of this sandbox.
    pub forked_from: Option<String>,
    /// Only this image.
    pub image_id: Option<String>,
    /// Resume after this sandbox id (exclusive).
    pub cursor: Option<String>,
    /// Page size, clamped to [`MAX_PAGE_SIZE`]; zero means [`DEFAULT_PAGE_SIZE`].
    pub limit: usize,
}

impl SandboxFilter {
    /// Filter scoped to one org.
    pub fn for_org(org_id: impl Into<String>) -> Self {
        Self {
            org_id: Some(org_id.into()),
            ..Self::default()
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }

    pub(crate) fn matches(&self, sandbox: &Sandbox) -> bool {
        self.org_id.as_ref().is_none_or(|org| *org == sandbox.org_id)
            && (self.statuses.is_empty() || self.statuses.contains(&sandbox.status))
            && self
                .forked_from
                .as_ref()
                .is_none_or(|parent| sandbox.forked_from.as_ref() == Some(parent))
            && self
                .image_id
                .as_ref()
                .is_none_or(|image| *image == sandbox.image_id)
            && self.cursor.as_ref().is_none_or(|cursor| sandbox.id < *cursor)
    }
}

/// One page of sandboxes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxPage {
    /// Sandboxes, newest first.
    pub sandboxes: Vec<Sandbox>,
    /// Pass as [`SandboxFilter::cursor`] to fetch the next page.
    pub next_cursor: Option<String>,
}

/// Sandbox rows.
#[async_trait]
pub trait SandboxRepository: Send + Sync + std::fmt::Debug {
    /// Insert a new root sandbox.
    async fn create(&self, sandbox: Sandbox) -> Result<Sandbox>;

    /// Look up a sandbox by id, whatever its status.
    async fn find_by_id(&self, id: &str) -> Result<Option<Sandbox>>;

    /// Move `id` from `expected` to `new`, writing `fields`.
    ///
    /// Returns `None` when the stored status is not `expected`; the caller
    /// should re-read rather than treat it as an error.
    async fn update_status(
        &self,
        id: &str,
        expected: SandboxStatus,
        new: SandboxStatus,
        fields: StatusFields,
    ) -> Result<Option<Sandbox>>;

    /// List sandboxes matching `filter`, newest first.
    async fn list(&self, filter: &SandboxFilter) -> Result<SandboxPage>;

    /// Every sandbox in `status`, across all orgs.
    async fn list_by_status(&self, status: SandboxStatus) -> Result<Vec<Sandbox>>;

    /// Sandboxes in queued/provisioning/running/stopping for an org.
    async fn count_active(&self, org_id: &str) -> Result<u64>;

    /// Active sandboxes placed on a node.
    async fn count_active_on_node(&self, node_id: &str) -> Result<u64>;

    /// Insert a child sandbox. The parent must exist.
    async fn create_fork(&self, child: Sandbox) -> Result<Sandbox>;

    /// Increment the parent's fork count if it is below `limit`.
    ///
    /// Returns the new count, or `None` if the limit was already reached.
    async fn increment_fork_count(&self, parent_id: &str, limit: u32) -> Result<Option<u32>>;

    /// Every sandbox whose root is `root_id`, including the root.
    async fn list_tree(&self, root_id: &str) -> Result<Vec<Sandbox>>;

    /// Terminal sandboxes whose replay retention has not been computed.
    async fn list_unset_replay_expiry(&self, limit: usize) -> Result<Vec<Sandbox>>;

    /// Sandboxes whose replay expired at or before `now` and is not purged.
    async fn list_expired_replays(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<Sandbox>>;

    /// Replace `replay_expires_at` if it still equals `expected`.
    ///
    /// A purged expiry is never replaced.
    async fn set_replay_expires_at(
        &self,
        id: &str,
        expected: ReplayExpiry,
        new: ReplayExpiry,
    ) -> Result<bool>;

    /// Mark a sandbox deleted, keeping the row.
    ///
    /// `ended_at` and `reason` are written only if the sandbox had not
    /// already ended. Returns `None` if it was already deleted or does not
    /// exist.
    async fn soft_delete(
        &self,
        id: &str,
        ended_at: DateTime<Utc>,
        reason: FailureReason,
    ) -> Result<Option<Sandbox>>;

    /// Record activity for idle tracking.
    async fn touch_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Set whether the replay is public.
    async fn set_replay_public(&self, id: &str, public: bool) -> Result<Option<Sandbox>>;
}

/// Execs and sessions.
#[async_trait]
pub trait ActivityRepository: Send + Sync + std::fmt::Debug {
    /// Insert an exec, assigning the next per-sandbox `seq`.
    async fn create_exec(&self, exec: Exec) -> Result<Exec>;

    /// Overwrite an exec row.
    async fn update_exec(&self, exec: Exec) -> Result<()>;

    /// Execs for a sandbox ordered by `seq`.
    async fn list_execs(&self, sandbox_id: &str) -> Result<Vec<Exec>>;

    /// Insert a session unless the sandbox already has `limit` running.
    ///
    /// Returns `None` when the limit is reached.
    async fn create_session(&self, session: Session, limit: u32) -> Result<Option<Session>>;

    /// Look up a session.
    async fn find_session(&self, id: &str) -> Result<Option<Session>>;

    /// Mark a session destroyed. Destroying twice keeps the first timestamp.
    async fn destroy_session(&self, id: &str, at: DateTime<Utc>) -> Result<Option<Session>>;

    /// Sessions for a sandbox, oldest first.
    async fn list_sessions(&self, sandbox_id: &str) -> Result<Vec<Session>>;
}

/// Registered artifacts.
#[async_trait]
pub trait ArtifactRepository: Send + Sync + std::fmt::Debug {
    /// Register paths for collection. Names already registered are skipped.
    ///
    /// Returns only the newly created rows.
    async fn register_artifacts(
        &self,
        sandbox_id: &str,
        names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<Artifact>>;

    /// Artifacts for a sandbox, oldest first.
    async fn list_artifacts(&self, sandbox_id: &str) -> Result<Vec<Artifact>>;

    /// Overwrite an artifact row.
    async fn update_artifact(&self, artifact: Artifact) -> Result<()>;

    /// Artifacts whose `retention_until` is before `now`.
    async fn list_expired_artifacts(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<Artifact>>;

    /// Delete an artifact row. Returns whether it existed.
    async fn delete_artifact(&self, id: &str) -> Result<bool>;
}

/// Outcome of reserving an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The key is new; the caller owns the request.
    Reserved,
    /// A request with this key is still being served.
    InProgress,
    /// A request with this key already completed.
    Completed(IdempotencyRecord),
}

/// Idempotency keys for retried mutating requests.
#[async_trait]
pub trait IdempotencyRepository: Send + Sync + std::fmt::Debug {
    /// Claim `key` for `org_id`. Records older than `window` are ignored and replaced.
    async fn reserve(
        &self,
        org_id: &str,
        key: &str,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> Result<Reservation>;

    /// Record the response for a reserved key.
    async fn complete(&self, org_id: &str, key: &str, status: u16, body: Value) -> Result<()>;

    /// Drop a reservation whose request failed so a retry can run.
    async fn release(&self, org_id: &str, key: &str) -> Result<()>;

    /// Delete records created before `cutoff`. Returns how many were removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Execution nodes.
#[async_trait]
pub trait NodeRepository: Send + Sync + std::fmt::Debug {
    /// Every registered node.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Look up a node.
    async fn find_node(&self, id: &str) -> Result<Option<Node>>;

    /// Insert or replace a node.
    async fn upsert_node(&self, node: Node) -> Result<()>;
}

/// Images and profiles.
#[async_trait]
pub trait CatalogRepository: Send + Sync + std::fmt::Debug {
    /// Find an image by id or name.
    async fn resolve_image(&self, name_or_id: &str) -> Result<Option<Image>>;

    /// Find a profile by id or name.
    async fn resolve_profile(&self, name_or_id: &str) -> Result<Option<Profile>>;
}
