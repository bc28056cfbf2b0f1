//! Relay events as Server-Sent Events.
//!
//! ```text
//! event: message
//! data: Hello world.
//!
//! event: done
//! data: {"turn_id":42}
//!
//! event: error
//! data: {"kind":"stream_interrupted","error":"..."}
//! ```

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use rebecca_core::{RelayEvent, RelayStream};

pub const KEEP_ALIVE_SECONDS: u64 = 15;

pub fn to_sse_event(event: RelayEvent) -> Event {
    match event {
        RelayEvent::Sentence(text) => Event::default().event("message").data(sse_safe(&text)),
        RelayEvent::Completed { turn_id } => Event::default()
            .event("done")
            .data(serde_json::json!({ "turn_id": turn_id }).to_string()),
        RelayEvent::Failed(e) => Event::default().event("error").data(
            serde_json::json!({
                "kind": e.kind(),
                "error": e.to_string(),
            })
            .to_string(),
        ),
    }
}

/// SSE fields cannot carry carriage returns; newlines become extra data lines.
fn sse_safe(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

pub fn relay_sse(events: RelayStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = events.map(|event| Ok::<_, Infallible>(to_sse_event(event)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEP_ALIVE_SECONDS)))
}
