//! The shared ephemeral key-value store.
//!
//! Everything here is short-lived coordination state: leader leases, rate
//! limit counters, node heartbeats and buffered events. All of it carries a
//! TTL and is allowed to vanish; durable state lives in the repositories.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

pub use memory::InMemoryEphemeralStore;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One entry in an event buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEvent {
    /// Monotonic per key, assigned by the store.
    pub seq: u64,
    /// When the event was buffered.
    pub ts: DateTime<Utc>,
    /// Event body.
    pub payload: Value,
}

/// Outcome of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// No live lease existed; the caller now holds it.
    Acquired,
    /// The caller already held the lease and extended it.
    Renewed,
    /// Another holder has a live lease.
    HeldBy(String),
}

impl LeaseOutcome {
    /// Returns true if the caller holds the lease after the call.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired | Self::Renewed)
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether this request fits in the window.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Seconds until the window resets.
    pub reset_after_secs: u64,
}

/// Shared coordination store.
#[async_trait]
pub trait EphemeralStore: Send + Sync + std::fmt::Debug {
    /// Take or extend the lease `name` for `holder`.
    ///
    /// Succeeds when no lease exists, the lease has expired, or `holder`
    /// already holds it.
    async fn acquire_or_renew_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<LeaseOutcome>;

    /// Drop the lease if `holder` holds it. Returns whether it was released.
    async fn release_lease(&self, name: &str, holder: &str) -> StoreResult<bool>;

    /// Count one request against a fixed-window limit.
    async fn check_rate_limit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> StoreResult<RateLimitDecision>;

    /// Record that `node_id` is alive for the next `ttl`.
    async fn register_heartbeat(&self, node_id: &str, ttl: Duration) -> StoreResult<()>;

    /// Whether `node_id` has a live heartbeat.
    async fn has_heartbeat(&self, node_id: &str) -> StoreResult<bool>;

    /// Append to the event list at `key`, refreshing its TTL.
    async fn push_event(&self, key: &str, payload: Value, ttl: Duration)
    -> StoreResult<BufferedEvent>;

    /// Events at `key` with `seq > after`, in order.
    async fn get_events_after(&self, key: &str, after: u64) -> StoreResult<Vec<BufferedEvent>>;
}
