//! Per-sandbox and per-exec event buffers.
//!
//! Lifecycle transitions and process output are appended to short-lived lists
//! in the [`EphemeralStore`], each entry stamped with a store-assigned `seq`.
//! Readers resume with "everything after seq N", which is what SSE reconnects
//! need. The buffer is not the durable record: lifecycle events are also
//! appended to a JSON-lines log in object storage as they happen, and the
//! whole buffer is merged into that log again on stop.

pub mod replay;
pub mod sse;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use serde_json::{Value, json};

use crate::error::{ObjectStorageError, Result};
use crate::model::{FailureReason, SandboxStatus};
use crate::node_client::OutputStream;
use crate::object_store::{ObjectStorage, event_log_key};
use crate::store::{BufferedEvent, EphemeralStore};

pub use replay::{ReplayAssembler, ReplayBundle};

/// Content type of archived event logs.
pub const EVENT_LOG_CONTENT_TYPE: &str = "application/x-ndjson";

/// Which buffer an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// Lifecycle events of a sandbox.
    Sandbox(String),
    /// Output of a one-shot exec.
    Exec(String),
    /// Output of commands run in a session.
    Session(String),
}

impl EventKey {
    /// The key in the ephemeral store.
    pub fn store_key(&self) -> String {
        match self {
            Self::Sandbox(id) => format!("events:sandbox:{id}"),
            Self::Exec(id) => format!("events:exec:{id}"),
            Self::Session(id) => format!("events:session:{id}"),
        }
    }
}

/// `{"t": "status", "from", "to", "reason"?}`
pub fn status_payload(
    from: SandboxStatus,
    to: SandboxStatus,
    reason: Option<FailureReason>,
) -> Value {
    let mut payload = json!({ "t": "status", "from": from, "to": to });
    if let Some(reason) = reason {
        payload["reason"] = json!(reason);
    }
    payload
}

/// `{"t": "stdout" | "stderr", "data"}`
pub fn output_payload(stream: OutputStream, data: &str) -> Value {
    json!({ "t": stream.as_str(), "data": data })
}

/// `{"t": "exit", "code", "durationMs"}`
pub fn exit_payload(code: i32, duration_ms: u64) -> Value {
    json!({ "t": "exit", "code": code, "durationMs": duration_ms })
}

/// Appends to and reads from event buffers.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
}

impl EventBuffer {
    /// Buffer events in `store`, each list living `ttl` past its last write.
    pub fn new(store: Arc<dyn EphemeralStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Append one event.
    pub async fn push(&self, key: &EventKey, payload: Value) -> Result<BufferedEvent> {
        Ok(self
            .store
            .push_event(&key.store_key(), payload, self.ttl)
            .await?)
    }

    /// Events with `seq > after`; `None` reads from the start.
    pub async fn events_after(
        &self,
        key: &EventKey,
        after: Option<u64>,
    ) -> Result<Vec<BufferedEvent>> {
        Ok(self
            .store
            .get_events_after(&key.store_key(), after.unwrap_or(0))
            .await?)
    }

    /// Follow a buffer: emit everything after `after`, then poll for new
    /// events every `poll_interval`.
    ///
    /// The stream ends only on a store error (after yielding it) or when the
    /// consumer drops it.
    pub fn follow(
        &self,
        key: &EventKey,
        after: u64,
        poll_interval: Duration,
    ) -> impl Stream<Item = Result<BufferedEvent>> + Send + use<> {
        stream::unfold(
            FollowState {
                store: self.store.clone(),
                key: key.store_key(),
                cursor: after,
                poll_interval,
                initial: true,
                done: false,
            },
            |mut state| async move {
                if state.done {
                    return None;
                }
                if !state.initial {
                    tokio::time::sleep(state.poll_interval).await;
                }
                state.initial = false;

                let batch: Vec<Result<BufferedEvent>> =
                    match state.store.get_events_after(&state.key, state.cursor).await {
                        Ok(events) => {
                            if let Some(last) = events.last() {
                                state.cursor = last.seq;
                            }
                            events.into_iter().map(Ok).collect()
                        }
                        Err(err) => {
                            state.done = true;
                            vec![Err(err.into())]
                        }
                    };
                Some((stream::iter(batch), state))
            },
        )
        .flatten()
    }

    /// Merge the sandbox's buffered lifecycle events into its durable log.
    ///
    /// Events already in the log are kept, so anything that expired from the
    /// buffer survives. Returns the number of events in the log afterwards.
    pub async fn archive(&self, sandbox_id: &str, objects: &dyn ObjectStorage) -> Result<usize> {
        let events = self
            .events_after(&EventKey::Sandbox(sandbox_id.to_string()), None)
            .await?;
        append_to_log(objects, &event_log_key(sandbox_id), &events).await
    }
}

/// Merge `events` into the JSON-lines log at `object_key`. A missing log
/// starts empty.
///
/// Entries are identified and ordered by `(ts, seq)`: a buffer whose list was
/// swept restarts its seq, and those events must not replace older ones.
/// Returns the number of events in the log afterwards.
pub async fn append_to_log(
    objects: &dyn ObjectStorage,
    object_key: &str,
    events: &[BufferedEvent],
) -> Result<usize> {
    let mut merged = BTreeMap::new();
    match objects.get_object(object_key).await {
        Ok(body) => {
            for line in body.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
                let event: BufferedEvent = serde_json::from_slice(line)?;
                merged.insert((event.ts, event.seq), event);
            }
        }
        Err(ObjectStorageError::NotFound(_)) => {}
        Err(err) => return Err(err.into()),
    }
    for event in events {
        merged.insert((event.ts, event.seq), event.clone());
    }

    let mut body = Vec::new();
    for event in merged.values() {
        serde_json::to_writer(&mut body, event)?;
        body.push(b'\n');
    }
    objects
        .put_object(object_key, body, EVENT_LOG_CONTENT_TYPE)
        .await?;
    Ok(merged.len())
}

struct FollowState {
    store: Arc<dyn EphemeralStore>,
    key: String,
    cursor: u64,
    poll_interval: Duration,
    initial: bool,
    done: bool,
}
