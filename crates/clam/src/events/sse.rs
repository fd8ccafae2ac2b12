//! Server-sent event framing.
//!
//! Each buffered event becomes one frame:
//!
//! ```text
//! id: 7
//! data: {"t":"stdout","data":"hello\n"}
//!
//! ```
//!
//! The `id` is the buffer `seq`, so a client that reconnects with
//! `Last-Event-ID: 7` resumes at seq 8.

use futures::stream::{Stream, StreamExt};

use crate::error::Result;
use crate::store::BufferedEvent;

/// Response headers for an event stream.
pub const SSE_HEADERS: [(&str, &str); 3] = [
    ("content-type", "text/event-stream"),
    ("cache-control", "no-cache"),
    ("connection", "keep-alive"),
];

/// Encode one event as an SSE frame.
pub fn encode_frame(event: &BufferedEvent) -> Result<String> {
    let data = serde_json::to_string(&event.payload)?;
    Ok(format!("id: {}\ndata: {data}\n\n", event.seq))
}

/// The seq to resume after, from a `Last-Event-ID` header value.
///
/// Missing or malformed values resume from the start.
pub fn parse_last_event_id(header: Option<&str>) -> u64 {
    header
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Map a stream of events to SSE frames.
pub fn frames<S>(events: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = Result<BufferedEvent>> + Send,
{
    events.map(|event| event.and_then(|event| encode_frame(&event)))
}
