//! Sandbox lifecycle and fork management.
//!
//! [`SandboxManager`] owns the status machine. Every status change goes
//! through a conditional update keyed on the status the caller last saw, so
//! two instances racing to move the same sandbox cannot both win; the loser
//! re-reads and reports the current state instead of failing.
//!
//! Admission (billing, catalog, TTL, quota) is checked before anything is
//! written. Side effects that must not block a transition, like artifact
//! collection or node teardown on stop, go through [`best_effort`].

mod activity;
pub mod fork_tree;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditAction, AuditEntry, BillableAction, BillingDecision};
use crate::backends::Backends;
use crate::config::{ControlPlaneConfig, to_delta};
use crate::error::{ControlError, Result};
use crate::events::{EventBuffer, EventKey, append_to_log, status_payload};
use crate::ids;
use crate::model::{FailureReason, Node, NodeStatus, ReplayExpiry, Sandbox, SandboxStatus};
use crate::node_client::{CreateSandboxRequest, ForkSandboxRequest};
use crate::object_store::event_log_key;
use crate::quota::OrgQuota;
use crate::repo::memory::DEFAULT_IMAGE;
use crate::repo::{Reservation, SandboxFilter, SandboxPage, StatusFields};

pub use activity::{
    ExecOutcome, ExecParams, FileWrite, SessionExecParams, SessionParams,
};
pub use fork_tree::{ForkTree, ForkTreeNode};

/// Profile used when a create request names none.
pub const DEFAULT_PROFILE: &str = "small";

/// Response status recorded for a completed create or fork.
const CREATED: u16 = 201;

/// Parameters for creating a root sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateSandboxParams {
    /// Image name or id. Defaults to `ubuntu-22.04`.
    pub image: Option<String>,
    /// Profile name or id. Defaults to `small`.
    pub profile: Option<String>,
    /// Environment for the guest.
    pub env: BTreeMap<String, String>,
    /// Maximum runtime. Defaults to the org's default TTL.
    pub ttl_seconds: Option<u64>,
    /// Deduplicates retried requests.
    pub idempotency_key: Option<String>,
}

/// Parameters for forking a running sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkSandboxParams {
    /// Overrides merged over the parent's environment.
    pub env: BTreeMap<String, String>,
    /// Maximum runtime. Defaults to the parent's TTL.
    pub ttl_seconds: Option<u64>,
    /// Deduplicates retried requests.
    pub idempotency_key: Option<String>,
}

/// How a stop request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopDisposition {
    /// The sandbox had already ended; nothing was done.
    AlreadyTerminal,
    /// Another stop is in flight; nothing was re-issued.
    InProgress,
    /// This call stopped the sandbox.
    Stopped,
}

impl StopDisposition {
    /// HTTP status the routing layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InProgress => 202,
            Self::AlreadyTerminal | Self::Stopped => 200,
        }
    }
}

/// Result of [`SandboxManager::stop`].
#[derive(Debug, Clone, PartialEq)]
pub struct StopOutcome {
    /// The sandbox as it stands after the call.
    pub sandbox: Sandbox,
    /// What the call did.
    pub disposition: StopDisposition,
}

/// Result of a conditional status update.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The update applied.
    Applied(Sandbox),
    /// Someone else moved the sandbox first; this is its current state.
    Superseded(Sandbox),
}

impl Transition {
    /// The sandbox after the attempt, whichever way it went.
    pub fn into_sandbox(self) -> Sandbox {
        match self {
            Self::Applied(sandbox) | Self::Superseded(sandbox) => sandbox,
        }
    }

    /// Whether this call's update applied.
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Run a side effect whose failure must not stop the caller.
///
/// Failures are logged at `warn` and swallowed.
pub(crate) async fn best_effort<T, E, F>(what: &str, sandbox_id: &str, fut: F) -> Option<T>
where
    E: Display,
    F: Future<Output = std::result::Result<T, E>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(sandbox_id = %sandbox_id, error = %err, "{what} failed, continuing");
            None
        }
    }
}

/// Creates, forks, stops and deletes sandboxes.
#[derive(Debug, Clone)]
pub struct SandboxManager {
    backends: Backends,
    config: ControlPlaneConfig,
    events: EventBuffer,
}

impl SandboxManager {
    /// Build a manager over `backends`.
    pub fn new(backends: Backends, config: ControlPlaneConfig) -> Self {
        let events = EventBuffer::new(backends.store.clone(), config.event_ttl);
        Self {
            backends,
            config,
            events,
        }
    }

    /// The collaborators this manager was built with.
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// The event buffer transitions and output are written to.
    pub fn events(&self) -> &EventBuffer {
        &self.events
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Fetch a sandbox owned by `org_id`.
    ///
    /// Sandboxes of other orgs are reported as not found.
    pub async fn get(&self, org_id: &str, sandbox_id: &str) -> Result<Sandbox> {
        self.backends
            .sandboxes
            .find_by_id(sandbox_id)
            .await?
            .filter(|sandbox| sandbox.org_id == org_id)
            .ok_or_else(|| ControlError::sandbox_not_found(sandbox_id))
    }

    /// List an org's sandboxes, newest first.
    pub async fn list(&self, org_id: &str, mut filter: SandboxFilter) -> Result<SandboxPage> {
        filter.org_id = Some(org_id.to_string());
        self.backends.sandboxes.list(&filter).await
    }

    /// The fork tree containing `sandbox_id`, keyed at its root.
    pub async fn fork_tree(&self, org_id: &str, sandbox_id: &str) -> Result<ForkTree> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        let members = self.backends.sandboxes.list_tree(&sandbox.root_id).await?;
        fork_tree::build(&members).ok_or_else(|| {
            ControlError::Repository(format!("fork tree {} has no root", sandbox.root_id))
        })
    }

    // ---------------------------------------------------------------------
    // Create and fork
    // ---------------------------------------------------------------------

    /// Create a root sandbox and boot it.
    ///
    /// On return the sandbox is `running`. If no node has capacity the
    /// sandbox is left `queued` and [`ControlError::NoCapacity`] is returned;
    /// the queue-timeout worker fails it later.
    pub async fn create(&self, org_id: &str, params: CreateSandboxParams) -> Result<Sandbox> {
        let key = params.idempotency_key.clone();
        if let Some(key) = key.as_deref()
            && let Some(existing) = self.begin_idempotent(org_id, key).await?
        {
            return Ok(existing);
        }

        let result = self.create_inner(org_id, params).await;
        if let Some(key) = key.as_deref() {
            self.finish_idempotent(org_id, key, &result).await;
        }
        result
    }

    async fn create_inner(&self, org_id: &str, params: CreateSandboxParams) -> Result<Sandbox> {
        validate_env(&params.env)?;
        self.check_billing(org_id, BillableAction::SandboxCreate)
            .await?;

        let image_name = params.image.as_deref().unwrap_or(DEFAULT_IMAGE);
        let image = self
            .backends
            .catalog
            .resolve_image(image_name)
            .await?
            .ok_or_else(|| ControlError::Validation(format!("unknown image: {image_name}")))?;
        let profile_name = params.profile.as_deref().unwrap_or(DEFAULT_PROFILE);
        let profile = self
            .backends
            .catalog
            .resolve_profile(profile_name)
            .await?
            .ok_or_else(|| ControlError::Validation(format!("unknown profile: {profile_name}")))?;

        let quota = self.backends.quotas.get_org_quota(org_id).await?;
        let ttl_seconds = params.ttl_seconds.unwrap_or_else(|| quota.default_ttl());
        quota.check_ttl(ttl_seconds)?;
        self.check_concurrency(org_id, &quota).await?;

        let now = self.backends.clock.now();
        let id = ids::sandbox_id();
        let sandbox = self
            .backends
            .sandboxes
            .create(Sandbox {
                root_id: id.clone(),
                id,
                org_id: org_id.to_string(),
                node_id: None,
                image_id: image.id.clone(),
                profile_id: profile.id.clone(),
                profile_name: profile.name.clone(),
                status: SandboxStatus::Queued,
                env: params.env,
                forked_from: None,
                fork_depth: 0,
                fork_count: 0,
                ttl_seconds,
                replay_public: false,
                failure_reason: None,
                replay_expires_at: ReplayExpiry::Unset,
                last_activity_at: now,
                created_at: now,
                started_at: None,
                ended_at: None,
            })
            .await?;
        tracing::info!(
            sandbox_id = %sandbox.id,
            org_id = %org_id,
            image = %image.name,
            profile = %profile.name,
            "sandbox queued"
        );

        let node = match self.select_node().await {
            Ok(node) => node,
            Err(err) => {
                tracing::warn!(sandbox_id = %sandbox.id, error = %err, "no node available, sandbox left queued");
                return Err(err);
            }
        };

        let sandbox = match self
            .transition(
                &sandbox,
                SandboxStatus::Provisioning,
                StatusFields {
                    node_id: Some(node.id.clone()),
                    ..StatusFields::default()
                },
            )
            .await?
        {
            Transition::Applied(sandbox) => sandbox,
            Transition::Superseded(current) => return Err(superseded(&current)),
        };

        let request = CreateSandboxRequest {
            sandbox_id: sandbox.id.clone(),
            image_id: image.id,
            profile,
            env: sandbox.env.clone(),
            ttl_seconds,
        };
        if let Err(err) = self
            .backends
            .node_client
            .create_sandbox(&node.id, &request)
            .await
        {
            tracing::warn!(sandbox_id = %sandbox.id, node_id = %node.id, error = %err, "provisioning failed");
            self.transition(
                &sandbox,
                SandboxStatus::Failed,
                StatusFields {
                    failure_reason: Some(FailureReason::ProvisionFailed),
                    ..StatusFields::default()
                },
            )
            .await?;
            return Err(err.into());
        }

        let sandbox = match self
            .transition(
                &sandbox,
                SandboxStatus::Running,
                StatusFields {
                    started_at: Some(self.backends.clock.now()),
                    ..StatusFields::default()
                },
            )
            .await?
        {
            Transition::Applied(sandbox) => sandbox,
            Transition::Superseded(current) => {
                self.discard_vm(&node.id, &current).await;
                return Err(superseded(&current));
            }
        };

        self.audit(org_id, AuditAction::SandboxCreate, &sandbox.id, json!({
            "image": image_name,
            "profile": profile_name,
            "ttlSeconds": ttl_seconds,
        }))
        .await;
        best_effort(
            "billing track",
            &sandbox.id,
            self.backends
                .billing
                .track(org_id, BillableAction::SandboxCreate),
        )
        .await;
        Ok(sandbox)
    }

    /// Fork a running sandbox onto the same node.
    ///
    /// The parent's fork count is consumed before the node is asked to fork.
    /// If the node call fails the count is not returned and the child stays
    /// `queued` until the queue-timeout worker fails it.
    pub async fn fork(
        &self,
        org_id: &str,
        parent_id: &str,
        params: ForkSandboxParams,
    ) -> Result<Sandbox> {
        let key = params.idempotency_key.clone();
        if let Some(key) = key.as_deref()
            && let Some(existing) = self.begin_idempotent(org_id, key).await?
        {
            return Ok(existing);
        }

        let result = self.fork_inner(org_id, parent_id, params).await;
        if let Some(key) = key.as_deref() {
            self.finish_idempotent(org_id, key, &result).await;
        }
        result
    }

    async fn fork_inner(
        &self,
        org_id: &str,
        parent_id: &str,
        params: ForkSandboxParams,
    ) -> Result<Sandbox> {
        validate_env(&params.env)?;
        let parent = self.get(org_id, parent_id).await?;
        if parent.status != SandboxStatus::Running {
            return Err(ControlError::NotRunning {
                id: parent.id,
                status: parent.status,
            });
        }
        let Some(node_id) = parent.node_id.clone() else {
            return Err(ControlError::Conflict(format!(
                "sandbox {} has no node assignment",
                parent.id
            )));
        };
        self.check_billing(org_id, BillableAction::SandboxFork)
            .await?;

        let quota = self.backends.quotas.get_org_quota(org_id).await?;
        let depth = quota.check_fork(&parent)?;
        let ttl_seconds = params.ttl_seconds.unwrap_or(parent.ttl_seconds);
        quota.check_ttl(ttl_seconds)?;
        self.check_concurrency(org_id, &quota).await?;

        // Conditional: concurrent forks of the same parent cannot overshoot.
        if self
            .backends
            .sandboxes
            .increment_fork_count(&parent.id, quota.max_forks_per_sandbox)
            .await?
            .is_none()
        {
            return Err(ControlError::ForkLimitExceeded {
                id: parent.id,
                limit: quota.max_forks_per_sandbox,
            });
        }

        let mut env = parent.env.clone();
        env.extend(params.env);

        let now = self.backends.clock.now();
        let child = self
            .backends
            .sandboxes
            .create_fork(Sandbox {
                id: ids::sandbox_id(),
                org_id: org_id.to_string(),
                node_id: Some(node_id.clone()),
                image_id: parent.image_id.clone(),
                profile_id: parent.profile_id.clone(),
                profile_name: parent.profile_name.clone(),
                status: SandboxStatus::Queued,
                env,
                forked_from: Some(parent.id.clone()),
                root_id: parent.root_id.clone(),
                fork_depth: depth,
                fork_count: 0,
                ttl_seconds,
                replay_public: false,
                failure_reason: None,
                replay_expires_at: ReplayExpiry::Unset,
                last_activity_at: now,
                created_at: now,
                started_at: None,
                ended_at: None,
            })
            .await?;
        tracing::info!(
            sandbox_id = %child.id,
            parent_id = %parent.id,
            depth,
            "fork queued"
        );

        let request = ForkSandboxRequest {
            source_sandbox_id: parent.id.clone(),
            new_sandbox_id: child.id.clone(),
            env: child.env.clone(),
        };
        if let Err(err) = self
            .backends
            .node_client
            .fork_sandbox(&node_id, &request)
            .await
        {
            tracing::warn!(
                sandbox_id = %child.id,
                parent_id = %parent.id,
                error = %err,
                "fork rpc failed, child left queued"
            );
            return Err(err.into());
        }

        let child = match self
            .transition(
                &child,
                SandboxStatus::Running,
                StatusFields {
                    started_at: Some(self.backends.clock.now()),
                    ..StatusFields::default()
                },
            )
            .await?
        {
            Transition::Applied(child) => child,
            Transition::Superseded(current) => {
                self.discard_vm(&node_id, &current).await;
                return Err(superseded(&current));
            }
        };

        self.audit(org_id, AuditAction::SandboxFork, &child.id, json!({
            "forkedFrom": parent.id,
            "forkDepth": depth,
        }))
        .await;
        best_effort(
            "billing track",
            &child.id,
            self.backends.billing.track(org_id, BillableAction::SandboxFork),
        )
        .await;
        Ok(child)
    }

    /// Tear down a VM booted for a sandbox that moved on while it booted,
    /// e.g. deleted or failed by the queue-timeout job.
    async fn discard_vm(&self, node_id: &str, current: &Sandbox) {
        tracing::warn!(
            sandbox_id = %current.id,
            node_id = %node_id,
            status = %current.status,
            "sandbox moved on during boot, destroying vm"
        );
        best_effort(
            "node destroy",
            &current.id,
            self.backends
                .node_client
                .destroy_sandbox(node_id, &current.id),
        )
        .await;
    }

    // ---------------------------------------------------------------------
    // Stop and delete
    // ---------------------------------------------------------------------

    /// Stop a sandbox. Idempotent.
    pub async fn stop(&self, org_id: &str, sandbox_id: &str) -> Result<StopOutcome> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        let outcome = self
            .stop_with_reason(sandbox, FailureReason::SandboxStopped)
            .await?;
        if outcome.disposition == StopDisposition::Stopped {
            self.audit(org_id, AuditAction::SandboxStop, sandbox_id, json!({}))
                .await;
        }
        Ok(outcome)
    }

    /// Drive a sandbox through `stopping` to `stopped`, recording `reason`.
    ///
    /// Artifact collection, node teardown and event archival are best-effort;
    /// the sandbox reaches `stopped` whatever they do.
    pub async fn stop_with_reason(
        &self,
        sandbox: Sandbox,
        reason: FailureReason,
    ) -> Result<StopOutcome> {
        if sandbox.status.is_terminal() {
            return Ok(StopOutcome {
                sandbox,
                disposition: StopDisposition::AlreadyTerminal,
            });
        }
        if sandbox.status == SandboxStatus::Stopping {
            return Ok(StopOutcome {
                sandbox,
                disposition: StopDisposition::InProgress,
            });
        }

        let stopping = match self
            .transition(&sandbox, SandboxStatus::Stopping, StatusFields::default())
            .await?
        {
            Transition::Applied(stopping) => stopping,
            Transition::Superseded(current) => {
                let disposition = if current.status.is_terminal() {
                    StopDisposition::AlreadyTerminal
                } else {
                    StopDisposition::InProgress
                };
                return Ok(StopOutcome {
                    sandbox: current,
                    disposition,
                });
            }
        };

        if let Some(node_id) = stopping.node_id.as_deref() {
            best_effort(
                "artifact collection",
                &stopping.id,
                self.collect_artifacts(&stopping, node_id),
            )
            .await;
            best_effort(
                "node stop",
                &stopping.id,
                self.backends
                    .node_client
                    .stop_sandbox(node_id, &stopping.id),
            )
            .await;
        }

        let stopped = self
            .transition(
                &stopping,
                SandboxStatus::Stopped,
                StatusFields {
                    failure_reason: Some(reason),
                    ..StatusFields::default()
                },
            )
            .await?
            .into_sandbox();
        best_effort(
            "event archive",
            &stopped.id,
            self.events
                .archive(&stopped.id, self.backends.objects.as_ref()),
        )
        .await;

        tracing::info!(sandbox_id = %stopped.id, reason = %reason, "sandbox stopped");
        Ok(StopOutcome {
            sandbox: stopped,
            disposition: StopDisposition::Stopped,
        })
    }

    /// Soft-delete a sandbox. Idempotent.
    ///
    /// An active sandbox's VM is destroyed first, best-effort.
    pub async fn delete(&self, org_id: &str, sandbox_id: &str) -> Result<Sandbox> {
        let sandbox = self.get(org_id, sandbox_id).await?;
        if sandbox.status == SandboxStatus::Deleted {
            return Ok(sandbox);
        }

        if sandbox.status.is_active()
            && let Some(node_id) = sandbox.node_id.as_deref()
        {
            best_effort(
                "node destroy",
                &sandbox.id,
                self.backends
                    .node_client
                    .destroy_sandbox(node_id, &sandbox.id),
            )
            .await;
        }

        let now = self.backends.clock.now();
        let Some(deleted) = self
            .backends
            .sandboxes
            .soft_delete(&sandbox.id, now, FailureReason::SandboxDeleted)
            .await?
        else {
            // Lost a race with another delete.
            return self.get(org_id, sandbox_id).await;
        };

        let reason = sandbox
            .status
            .is_active()
            .then_some(FailureReason::SandboxDeleted);
        self.record_transition(&deleted, sandbox.status, SandboxStatus::Deleted, reason)
            .await;
        // A stopped sandbox was archived on stop; its buffer may have expired.
        if sandbox.status.is_active() && deleted.replay_expires_at != ReplayExpiry::Purged {
            best_effort(
                "event archive",
                &deleted.id,
                self.events
                    .archive(&deleted.id, self.backends.objects.as_ref()),
            )
            .await;
        }
        self.audit(org_id, AuditAction::SandboxDelete, &deleted.id, json!({}))
            .await;
        Ok(deleted)
    }

    /// Make a sandbox's replay public or private.
    pub async fn set_replay_visibility(
        &self,
        org_id: &str,
        sandbox_id: &str,
        public: bool,
    ) -> Result<Sandbox> {
        self.get(org_id, sandbox_id).await?;
        self.backends
            .sandboxes
            .set_replay_public(sandbox_id, public)
            .await?
            .ok_or_else(|| ControlError::sandbox_not_found(sandbox_id))
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    /// Conditionally move `sandbox` from the status it was read with to `to`.
    ///
    /// Terminal targets get `ended_at` stamped if the caller did not supply
    /// one. If the stored status no longer matches, the sandbox is re-read
    /// and returned as [`Transition::Superseded`].
    pub async fn transition(
        &self,
        sandbox: &Sandbox,
        to: SandboxStatus,
        mut fields: StatusFields,
    ) -> Result<Transition> {
        if !sandbox.status.can_transition_to(to) {
            return Err(ControlError::Conflict(format!(
                "sandbox {} cannot move from {} to {to}",
                sandbox.id, sandbox.status
            )));
        }
        if to.is_terminal() && fields.ended_at.is_none() {
            fields.ended_at = Some(self.backends.clock.now());
        }
        let reason = fields.failure_reason;

        match self
            .backends
            .sandboxes
            .update_status(&sandbox.id, sandbox.status, to, fields)
            .await?
        {
            Some(updated) => {
                tracing::info!(
                    sandbox_id = %updated.id,
                    from = %sandbox.status,
                    to = %to,
                    "sandbox transitioned"
                );
                self.record_transition(&updated, sandbox.status, to, reason)
                    .await;
                Ok(Transition::Applied(updated))
            }
            None => {
                let current = self
                    .backends
                    .sandboxes
                    .find_by_id(&sandbox.id)
                    .await?
                    .ok_or_else(|| ControlError::sandbox_not_found(&sandbox.id))?;
                tracing::debug!(
                    sandbox_id = %current.id,
                    expected = %sandbox.status,
                    actual = %current.status,
                    "transition superseded"
                );
                Ok(Transition::Superseded(current))
            }
        }
    }

    /// Buffer a lifecycle event and append it to the durable log.
    ///
    /// A purged log is never written again.
    async fn record_transition(
        &self,
        sandbox: &Sandbox,
        from: SandboxStatus,
        to: SandboxStatus,
        reason: Option<FailureReason>,
    ) {
        let Some(event) = best_effort(
            "lifecycle event",
            &sandbox.id,
            self.events.push(
                &EventKey::Sandbox(sandbox.id.clone()),
                status_payload(from, to, reason),
            ),
        )
        .await
        else {
            return;
        };
        if sandbox.replay_expires_at == ReplayExpiry::Purged {
            return;
        }
        best_effort(
            "event log append",
            &sandbox.id,
            append_to_log(
                self.backends.objects.as_ref(),
                &event_log_key(&sandbox.id),
                std::slice::from_ref(&event),
            ),
        )
        .await;
    }

    // ---------------------------------------------------------------------
    // Admission helpers
    // ---------------------------------------------------------------------

    async fn check_billing(&self, org_id: &str, action: BillableAction) -> Result<()> {
        match self.backends.billing.check(org_id, action).await? {
            BillingDecision::Allowed => Ok(()),
            BillingDecision::Denied { reason } => Err(ControlError::BillingLimit(reason)),
        }
    }

    async fn check_concurrency(&self, org_id: &str, quota: &OrgQuota) -> Result<()> {
        let active = self.backends.sandboxes.count_active(org_id).await?;
        quota.check_concurrency(active)
    }

    /// Pick the online, heartbeating node with the most free slots.
    async fn select_node(&self) -> Result<Node> {
        let mut best: Option<(u64, Node)> = None;
        for node in self.backends.nodes.list_nodes().await? {
            if node.status != NodeStatus::Online
                || !self.backends.store.has_heartbeat(&node.id).await?
            {
                continue;
            }
            let active = self
                .backends
                .sandboxes
                .count_active_on_node(&node.id)
                .await?;
            if active >= u64::from(node.slots_total) {
                continue;
            }
            if best.as_ref().is_none_or(|(fewest, _)| active < *fewest) {
                best = Some((active, node));
            }
        }
        best.map(|(_, node)| node).ok_or(ControlError::NoCapacity)
    }

    async fn begin_idempotent(&self, org_id: &str, key: &str) -> Result<Option<Sandbox>> {
        let now = self.backends.clock.now();
        let window = to_delta(self.config.idempotency_window);
        match self
            .backends
            .idempotency
            .reserve(org_id, key, now, window)
            .await?
        {
            Reservation::Reserved => Ok(None),
            Reservation::InProgress => Err(ControlError::Conflict(format!(
                "a request with idempotency key {key} is still in progress"
            ))),
            Reservation::Completed(record) => {
                let id = record
                    .response_body
                    .as_ref()
                    .and_then(|body| body.get("id"))
                    .and_then(|id| id.as_str())
                    .ok_or_else(|| {
                        ControlError::Repository(format!(
                            "idempotency record {key} has no sandbox id"
                        ))
                    })?;
                tracing::debug!(org_id = %org_id, key = %key, sandbox_id = %id, "idempotent replay");
                self.get(org_id, id).await.map(Some)
            }
        }
    }

    async fn finish_idempotent(&self, org_id: &str, key: &str, result: &Result<Sandbox>) {
        let idempotency = &self.backends.idempotency;
        match result {
            Ok(sandbox) => {
                best_effort(
                    "idempotency complete",
                    &sandbox.id,
                    idempotency.complete(org_id, key, CREATED, json!({ "id": sandbox.id })),
                )
                .await;
            }
            Err(_) => {
                best_effort("idempotency release", "-", idempotency.release(org_id, key)).await;
            }
        }
    }

    async fn audit(
        &self,
        org_id: &str,
        action: AuditAction,
        sandbox_id: &str,
        metadata: serde_json::Value,
    ) {
        let entry = AuditEntry {
            org_id: org_id.to_string(),
            action,
            resource_id: sandbox_id.to_string(),
            at: self.backends.clock.now(),
            metadata,
        };
        best_effort("audit append", sandbox_id, self.backends.audit.append(entry)).await;
    }
}

fn superseded(current: &Sandbox) -> ControlError {
    ControlError::Conflict(format!(
        "sandbox {} is {} and can no longer be started",
        current.id, current.status
    ))
}

fn validate_env(env: &BTreeMap<String, String>) -> Result<()> {
    if let Some(key) = env.keys().find(|key| key.is_empty() || key.contains('=')) {
        return Err(ControlError::Validation(format!(
            "invalid environment variable name: {key:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests;
