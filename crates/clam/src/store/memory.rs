//! In-memory ephemeral store for testing.
//!
//! Expiry is evaluated lazily against the injected [`Clock`], so tests can move
//! a [`ManualClock`](crate::clock::ManualClock) forward to expire leases and
//! heartbeats without sleeping. Writes also sweep expired entries out of the
//! maps, at most once per [`SWEEP_INTERVAL`] of clock time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use super::{BufferedEvent, EphemeralStore, LeaseOutcome, RateLimitDecision, StoreResult};
use crate::clock::{Clock, SystemClock};
use crate::config::to_delta;
use crate::error::StoreError;

/// Oldest events are trimmed past this many per key.
pub const MAX_BUFFERED_EVENTS: usize = 10_000;

/// Minimum clock time between two sweeps triggered by writes.
pub const SWEEP_INTERVAL: TimeDelta = TimeDelta::seconds(60);

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::new("lock poisoned")
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    ends_at: DateTime<Utc>,
    count: u64,
}

impl Window {
    fn starting(now: DateTime<Utc>, length: TimeDelta) -> Self {
        Self {
            ends_at: now + length,
            count: 0,
        }
    }
}

#[derive(Debug, Default)]
struct EventList {
    events: Vec<BufferedEvent>,
    last_seq: u64,
    expires_at: Option<DateTime<Utc>>,
    ttl: TimeDelta,
}

#[derive(Debug, Default)]
struct State {
    leases: HashMap<String, Lease>,
    windows: HashMap<String, Window>,
    heartbeats: HashMap<String, DateTime<Utc>>,
    events: HashMap<String, EventList>,
    last_sweep: Option<DateTime<Utc>>,
}

impl State {
    /// Drop everything that has expired by `now`; returns the entries removed.
    ///
    /// An expired event list is emptied but its seq counter is kept for one
    /// more ttl, so a reader reconnecting shortly after expiry never sees a
    /// seq reused. After that the whole list goes.
    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.leases.len() + self.windows.len() + self.heartbeats.len();
        self.leases.retain(|_, lease| lease.expires_at > now);
        self.windows.retain(|_, window| window.ends_at > now);
        self.heartbeats.retain(|_, expires_at| *expires_at > now);
        let mut removed =
            before - (self.leases.len() + self.windows.len() + self.heartbeats.len());

        let lists = self.events.len();
        self.events.retain(|_, list| match list.expires_at {
            Some(at) if at + list.ttl <= now => false,
            Some(at) if at <= now => {
                list.events = Vec::new();
                true
            }
            _ => true,
        });
        removed += lists - self.events.len();

        self.last_sweep = Some(now);
        removed
    }

    fn maybe_sweep(&mut self, now: DateTime<Utc>) {
        if self.last_sweep.is_none_or(|at| at + SWEEP_INTERVAL <= now) {
            let removed = self.sweep(now);
            if removed > 0 {
                tracing::debug!(removed, "swept expired store entries");
            }
        }
    }
}

/// In-memory [`EphemeralStore`].
#[derive(Debug)]
pub struct InMemoryEphemeralStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryEphemeralStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryEphemeralStore {
    /// Creates an empty store reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    /// Remove every expired lease, heartbeat, rate-limit window and event
    /// list now, regardless of when the last sweep ran.
    pub fn sweep_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        Ok(self.state.lock().map_err(poison_err)?.sweep(now))
    }

    /// Current holder of a live lease, if any.
    pub fn lease_holder(&self, name: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state
            .leases
            .get(name)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder.clone()))
    }
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn acquire_or_renew_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<LeaseOutcome> {
        let now = self.clock.now();
        let mut state = self.state.lock().map_err(poison_err)?;
        state.maybe_sweep(now);

        let outcome = match state.leases.get(name) {
            Some(lease) if lease.expires_at > now && lease.holder != holder => {
                return Ok(LeaseOutcome::HeldBy(lease.holder.clone()));
            }
            Some(lease) if lease.expires_at > now => LeaseOutcome::Renewed,
            _ => LeaseOutcome::Acquired,
        };

        state.leases.insert(
            name.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at: now + to_delta(ttl),
            },
        );
        Ok(outcome)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if state.leases.get(name).is_some_and(|l| l.holder == holder) {
            state.leases.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    async fn check_rate_limit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> StoreResult<RateLimitDecision> {
        let now = self.clock.now();
        let window = to_delta(window);
        let mut state = self.state.lock().map_err(poison_err)?;
        state.maybe_sweep(now);

        let entry = state
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window::starting(now, window));
        if entry.ends_at <= now {
            *entry = Window::starting(now, window);
        }

        let allowed = entry.count < limit;
        if allowed {
            entry.count += 1;
        }
        let reset_after = (entry.ends_at - now).num_seconds().max(0);

        Ok(RateLimitDecision {
            allowed,
            remaining: limit.saturating_sub(entry.count),
            reset_after_secs: u64::try_from(reset_after).unwrap_or(0),
        })
    }

    async fn register_heartbeat(&self, node_id: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().map_err(poison_err)?;
        state.maybe_sweep(now);
        state
            .heartbeats
            .insert(node_id.to_string(), now + to_delta(ttl));
        Ok(())
    }

    async fn has_heartbeat(&self, node_id: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state
            .heartbeats
            .get(node_id)
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn push_event(
        &self,
        key: &str,
        payload: Value,
        ttl: Duration,
    ) -> StoreResult<BufferedEvent> {
        let now = self.clock.now();
        let mut state = self.state.lock().map_err(poison_err)?;
        state.maybe_sweep(now);
        let list = state.events.entry(key.to_string()).or_default();

        // The seq counter outlives an expired list so reconnecting readers
        // never see a seq reused.
        if list.expires_at.is_some_and(|at| at <= now) {
            list.events.clear();
        }

        list.last_seq += 1;
        let event = BufferedEvent {
            seq: list.last_seq,
            ts: now,
            payload,
        };
        list.events.push(event.clone());
        if list.events.len() > MAX_BUFFERED_EVENTS {
            let excess = list.events.len() - MAX_BUFFERED_EVENTS;
            list.events.drain(..excess);
        }
        list.ttl = to_delta(ttl);
        list.expires_at = Some(now + list.ttl);
        Ok(event)
    }

    async fn get_events_after(&self, key: &str, after: u64) -> StoreResult<Vec<BufferedEvent>> {
        let now = self.clock.now();
        let state = self.state.lock().map_err(poison_err)?;
        let Some(list) = state.events.get(key) else {
            return Ok(Vec::new());
        };
        if list.expires_at.is_some_and(|at| at <= now) {
            return Ok(Vec::new());
        }
        let start = list.events.partition_point(|e| e.seq <= after);
        Ok(list.events[start..].to_vec())
    }
}
