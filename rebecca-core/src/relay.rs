//! Streaming chat relay.
//!
//! Drives one model call for one request: pulls raw chunks from the backend,
//! re-chunks their fragments into sentence events for the client, keeps the
//! full reply, and appends exactly one turn once the stream has been fully
//! consumed without error.
//!
//! State flow:
//!
//! ```text
//! Idle -> Assembling -> Streaming -> Completing -> Done
//!              |             |             |
//!              +-------------+-------------+--> Failed
//! ```
//!
//! The returned event stream is lazy and single-use. Dropping it (client
//! disconnect) drops the backend stream with it and nothing is stored.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};

use crate::error::ChatError;
use crate::llm::{BackendError, ChatBackend, ChatMessage, Chunk, ChunkStream};
use crate::store::ConversationStore;

pub const SENTENCE_TERMINATOR: char = '.';

// ============================================================================
// Sentence reassembly
// ============================================================================

/// Splits accumulated text at each terminator, first occurrence first.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    buffer: String,
}

impl SentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every sentence it completes.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut sentences = Vec::new();
        while let Some(idx) = self.buffer.find(SENTENCE_TERMINATOR) {
            let rest = self.buffer.split_off(idx + SENTENCE_TERMINATOR.len_utf8());
            let head = std::mem::replace(&mut self.buffer, rest);
            sentences.push(format!("{}{}", head[..idx].trim(), SENTENCE_TERMINATOR));
        }
        sentences
    }

    /// Drain the residual text; `None` when only whitespace is left.
    pub fn finish(&mut self) -> Option<String> {
        let residual = std::mem::take(&mut self.buffer);
        let residual = residual.trim();
        if residual.is_empty() {
            None
        } else {
            Some(residual.to_string())
        }
    }
}

// ============================================================================
// Session state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Assembling,
    Streaming,
    Completing,
    Done,
    Failed,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RelayState::Done | RelayState::Failed)
    }

    fn allows(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Idle, Assembling)
                | (Assembling, Streaming)
                | (Streaming, Completing)
                | (Completing, Done)
                | (Assembling, Failed)
                | (Streaming, Failed)
                | (Completing, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid relay transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RelayState,
    pub to: RelayState,
}

/// Per-request relay state. Never shared between requests.
#[derive(Debug)]
pub struct StreamSession {
    state: RelayState,
    sentences: SentenceBuffer,
    full_response: String,
    chunks: usize,
    anomalous_chunks: usize,
    events: usize,
    flushed: bool,
    persist_attempted: bool,
    started: Instant,
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSession {
    pub fn new() -> Self {
        Self {
            state: RelayState::Idle,
            sentences: SentenceBuffer::new(),
            full_response: String::new(),
            chunks: 0,
            anomalous_chunks: 0,
            events: 0,
            flushed: false,
            persist_attempted: false,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn transition(&mut self, next: RelayState) -> Result<(), InvalidTransition> {
        if !self.state.allows(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(from = ?self.state, to = ?next, "Relay state transition");
        self.state = next;
        Ok(())
    }

    /// `transition` for the relay driver: an invalid move is logged and fails
    /// the session.
    pub fn advance(&mut self, next: RelayState) -> bool {
        match self.transition(next) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Relay state machine violated");
                self.fail();
                false
            }
        }
    }

    /// Move to `Failed` from any non-terminal state.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!(from = ?self.state, "Relay failed");
            self.state = RelayState::Failed;
        }
    }

    /// Feed one raw chunk; returns the sentence events it completes.
    pub fn accept(&mut self, chunk: &Chunk) -> Vec<String> {
        self.chunks += 1;

        let sentences = match chunk.fragment() {
            Some("") => Vec::new(),
            None if chunk.is_final() => Vec::new(),
            Some(fragment) => {
                self.full_response.push_str(fragment);
                self.sentences.push(fragment)
            }
            None => {
                self.anomalous_chunks += 1;
                match chunk {
                    Chunk::Malformed(raw) => tracing::warn!(
                        chunk_index = self.chunks,
                        raw = %raw,
                        "Skipping malformed model chunk"
                    ),
                    Chunk::Json(value) => tracing::warn!(
                        chunk_index = self.chunks,
                        chunk = %value,
                        "Skipping model chunk without message.content"
                    ),
                }
                Vec::new()
            }
        };

        self.events += sentences.len();
        sentences
    }

    /// Flush the trailing partial sentence. Yields at most once per session.
    pub fn finish(&mut self) -> Option<String> {
        if self.flushed {
            return None;
        }
        self.flushed = true;
        let residual = self.sentences.finish();
        if residual.is_some() {
            self.events += 1;
        }
        residual
    }

    /// True the first time only; guards the single turn write.
    pub fn claim_persist(&mut self) -> bool {
        !std::mem::replace(&mut self.persist_attempted, true)
    }

    pub fn full_response(&self) -> &str {
        &self.full_response
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn anomalous_chunks(&self) -> usize {
        self.anomalous_chunks
    }

    pub fn events(&self) -> usize {
        self.events
    }

    pub fn metadata(&self, model: &str) -> serde_json::Value {
        serde_json::json!({
            "model": model,
            "chunks": self.chunks,
            "anomalous_chunks": self.anomalous_chunks,
            "events": self.events,
            "duration_ms": self.started.elapsed().as_millis() as u64,
        })
    }
}

// ============================================================================
// Relay
// ============================================================================

/// Client-visible output of one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Sentence(String),
    /// The turn was stored; always the last event of a successful relay.
    Completed { turn_id: i64 },
    /// Always the last event of a failed relay.
    Failed(ChatError),
}

pub type RelayStream = Pin<Box<dyn Stream<Item = RelayEvent> + Send + 'static>>;

/// Holds the injected backend and store; cheap to clone per request.
#[derive(Clone)]
pub struct StreamRelay {
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn ConversationStore>,
}

impl StreamRelay {
    pub fn new(backend: Arc<dyn ChatBackend>, store: Arc<dyn ConversationStore>) -> Self {
        Self { backend, store }
    }

    /// Start the backend call now and return the event stream, or fail with
    /// `BackendUnavailable` before any event exists.
    pub async fn start(
        &self,
        user_id: i64,
        context: Vec<ChatMessage>,
        new_input: String,
    ) -> Result<RelayStream, ChatError> {
        let mut session = StreamSession::new();
        session.advance(RelayState::Assembling);

        match self.backend.stream_chat(&context).await {
            Ok(chunks) => {
                session.advance(RelayState::Streaming);
                Ok(self.drive(session, chunks, user_id, new_input))
            }
            Err(e) => {
                session.fail();
                tracing::error!(user_id, backend = self.backend.name(), error = %e, "Model call could not start");
                Err(ChatError::BackendUnavailable(e.to_string()))
            }
        }
    }

    /// Fully lazy variant: nothing happens until the stream is polled, and a
    /// backend that cannot start is reported as an in-band `Failed` event.
    pub fn relay(&self, user_id: i64, context: Vec<ChatMessage>, new_input: String) -> RelayStream {
        let relay = self.clone();
        Box::pin(async_stream::stream! {
            match relay.start(user_id, context, new_input).await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        yield event;
                    }
                }
                Err(e) => {
                    yield RelayEvent::Failed(e);
                }
            }
        })
    }

    fn drive(
        &self,
        mut session: StreamSession,
        chunks: ChunkStream,
        user_id: i64,
        new_input: String,
    ) -> RelayStream {
        let store = self.store.clone();
        let model = self.backend.name().to_string();

        Box::pin(async_stream::stream! {
            let mut chunks = chunks;
            let mut interrupted: Option<BackendError> = None;

            while let Some(item) = chunks.next().await {
                match item {
                    Ok(chunk) => {
                        for sentence in session.accept(&chunk) {
                            yield RelayEvent::Sentence(sentence);
                        }
                    }
                    Err(e) => {
                        interrupted = Some(e);
                        break;
                    }
                }
            }
            // Release the backend connection before touching storage.
            drop(chunks);

            if let Some(e) = interrupted {
                session.fail();
                tracing::error!(
                    user_id,
                    model = %model,
                    chunks = session.chunks(),
                    error = %e,
                    "Model stream interrupted; turn not stored"
                );
                yield RelayEvent::Failed(ChatError::StreamInterrupted(e.to_string()));
                return;
            }

            if let Some(residual) = session.finish() {
                yield RelayEvent::Sentence(residual);
            }

            if !session.advance(RelayState::Completing) || !session.claim_persist() {
                return;
            }

            let metadata = session.metadata(&model);
            match store
                .append(user_id, &new_input, session.full_response(), Some(&metadata))
                .await
            {
                Ok(turn) => {
                    session.advance(RelayState::Done);
                    tracing::info!(
                        user_id,
                        turn_id = turn.id,
                        chunks = session.chunks(),
                        anomalous_chunks = session.anomalous_chunks(),
                        events = session.events(),
                        "Relay completed"
                    );
                    yield RelayEvent::Completed { turn_id: turn.id };
                }
                Err(e) => {
                    session.fail();
                    tracing::error!(
                        user_id,
                        response_len = session.full_response().len(),
                        error = %e,
                        "Inconsistency: reply was delivered but the turn could not be stored"
                    );
                    yield RelayEvent::Failed(ChatError::StorageFailure(e.to_string()));
                }
            }
        })
    }
}
