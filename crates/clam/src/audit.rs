//! Audit trail and billing hooks.
//!
//! Both are consulted by the lifecycle manager but owned elsewhere. Audit
//! appends and billing tracking are best-effort; only [`BillingGate::check`]
//! can block an operation.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::Result;

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    /// `sandbox.create`
    #[serde(rename = "sandbox.create")]
    SandboxCreate,
    /// `sandbox.fork`
    #[serde(rename = "sandbox.fork")]
    SandboxFork,
    /// `sandbox.stop`
    #[serde(rename = "sandbox.stop")]
    SandboxStop,
    /// `sandbox.delete`
    #[serde(rename = "sandbox.delete")]
    SandboxDelete,
}

impl AuditAction {
    /// The dotted name used in audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SandboxCreate => "sandbox.create",
            Self::SandboxFork => "sandbox.fork",
            Self::SandboxStop => "sandbox.stop",
            Self::SandboxDelete => "sandbox.delete",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Org that performed the action.
    pub org_id: String,
    /// Action.
    pub action: AuditAction,
    /// Affected sandbox.
    pub resource_id: String,
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Action-specific detail.
    pub metadata: Value,
}

/// Append-only audit sink.
#[async_trait]
pub trait AuditLog: Send + Sync + std::fmt::Debug {
    /// Record an entry.
    async fn append(&self, entry: AuditEntry) -> Result<()>;
}

/// Writes audit entries as `tracing` events on the `clam::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        info!(
            target: "clam::audit",
            org_id = %entry.org_id,
            action = entry.action.as_str(),
            resource_id = %entry.resource_id,
            metadata = %entry.metadata,
            "audit"
        );
        Ok(())
    }
}

/// Keeps audit entries in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    /// Entries recorded so far, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

/// Something an org can be billed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillableAction {
    /// Starting a root sandbox.
    SandboxCreate,
    /// Forking a sandbox.
    SandboxFork,
}

/// Answer from [`BillingGate::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingDecision {
    /// Go ahead.
    Allowed,
    /// The plan does not permit it.
    Denied {
        /// Human-readable reason.
        reason: String,
    },
}

/// Plan enforcement and usage metering.
#[async_trait]
pub trait BillingGate: Send + Sync + std::fmt::Debug {
    /// Whether `org_id` may perform `action`.
    async fn check(&self, org_id: &str, action: BillableAction) -> Result<BillingDecision>;

    /// Record that `org_id` performed `action`.
    async fn track(&self, org_id: &str, action: BillableAction) -> Result<()>;
}

/// Allows everything, tracks nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnmeteredBilling;

#[async_trait]
impl BillingGate for UnmeteredBilling {
    async fn check(&self, _org_id: &str, _action: BillableAction) -> Result<BillingDecision> {
        Ok(BillingDecision::Allowed)
    }

    async fn track(&self, _org_id: &str, _action: BillableAction) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Ledger {
    denied: HashSet<String>,
    usage: HashMap<(String, BillableAction), u64>,
}

/// In-memory gate with per-org denial and usage counters.
#[derive(Debug, Default)]
pub struct InMemoryBillingGate {
    ledger: Mutex<Ledger>,
}

impl InMemoryBillingGate {
    /// Deny every billable action for `org_id`.
    pub fn deny(&self, org_id: impl Into<String>) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .denied
            .insert(org_id.into());
    }

    /// How many times `action` was tracked for `org_id`.
    pub fn usage(&self, org_id: &str, action: BillableAction) -> u64 {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .usage
            .get(&(org_id.to_string(), action))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl BillingGate for InMemoryBillingGate {
    async fn check(&self, org_id: &str, _action: BillableAction) -> Result<BillingDecision> {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        if ledger.denied.contains(org_id) {
            return Ok(BillingDecision::Denied {
                reason: format!("org {org_id} has no remaining sandbox allowance"),
            });
        }
        Ok(BillingDecision::Allowed)
    }

    async fn track(&self, org_id: &str, action: BillableAction) -> Result<()> {
        *self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .usage
            .entry((org_id.to_string(), action))
            .or_insert(0) += 1;
        Ok(())
    }
}
