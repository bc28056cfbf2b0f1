//! Streaming chat-completion backend.
//!
//! The relay only depends on the `ChatBackend` trait. Starting a call is an
//! explicit result: either a chunk stream or the reason it could not start.
//! Once started, each stream item is either a raw chunk or a mid-stream
//! failure.
//!
//! `OllamaChatClient` talks to an Ollama-compatible `/api/chat` endpoint,
//! which answers with newline-delimited JSON objects shaped like
//! `{"message": {"role": "assistant", "content": "..."}, "done": false}`.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

use crate::config::ModelConfig;

/// Longest NDJSON line accepted from the backend.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// Chunks and errors
// ============================================================================

/// One raw item of backend output.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Json(serde_json::Value),
    /// A line that was not valid JSON.
    Malformed(String),
}

impl Chunk {
    /// The incremental content at `message.content`, if the chunk has one.
    pub fn fragment(&self) -> Option<&str> {
        match self {
            Chunk::Json(value) => value.get("message")?.get("content")?.as_str(),
            Chunk::Malformed(_) => None,
        }
    }

    /// True for the closing `{"done": true}` object.
    pub fn is_final(&self) -> bool {
        match self {
            Chunk::Json(value) => value.get("done").and_then(|d| d.as_bool()) == Some(true),
            Chunk::Malformed(_) => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The call could not be started (connect failure, non-2xx status).
    #[error("{0}")]
    Unavailable(String),

    /// The call started but failed before the stream finished.
    #[error("{0}")]
    Interrupted(String),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, BackendError>> + Send + 'static>>;

// ============================================================================
// ChatBackend trait
// ============================================================================

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start a streaming completion for `messages`.
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<ChunkStream, BackendError>;

    /// Model or backend name, recorded in turn metadata and logs.
    fn name(&self) -> &str;
}

// ============================================================================
// Ollama client
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Clone)]
pub struct OllamaChatClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaChatClient {
    pub fn new(config: &ModelConfig) -> Result<Self, BackendError> {
        // No overall timeout: a healthy stream may run for minutes.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()
            .map_err(|e| BackendError::Unavailable(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ChatBackend for OllamaChatClient {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<ChunkStream, BackendError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(code = status.as_u16(), body = %body, "Model backend rejected chat request");
            return Err(BackendError::Unavailable(format!(
                "model backend returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let bytes = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut lines = Box::pin(FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        ));

        let chunks = async_stream::stream! {
            while let Some(line) = lines.next().await {
                let item = match line {
                    Ok(line) => match decode_line(&line) {
                        Some(item) => item,
                        None => continue,
                    },
                    Err(LinesCodecError::MaxLineLengthExceeded) => Err(BackendError::Interrupted(
                        format!("model stream line exceeded {} bytes", MAX_LINE_BYTES),
                    )),
                    Err(e) => Err(BackendError::Interrupted(format!(
                        "model stream read failed: {}",
                        e
                    ))),
                };

                match item {
                    Ok(chunk) => {
                        let last = chunk.is_final();
                        yield Ok(chunk);
                        if last {
                            return;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            // Body closed without the `done: true` marker.
            yield Err(BackendError::Interrupted(
                "stream ended before completion".to_string(),
            ));
        };

        Ok(Box::pin(chunks))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Decode one NDJSON line. Blank lines are skipped; an `{"error": ...}`
/// object is a mid-stream failure.
fn decode_line(line: &str) -> Option<Result<Chunk, BackendError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) => {
            if let Some(message) = value.get("error") {
                let message = message
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| message.to_string());
                return Some(Err(BackendError::Interrupted(message)));
            }
            Some(Ok(Chunk::Json(value)))
        }
        Err(_) => Some(Ok(Chunk::Malformed(line.to_string()))),
    }
}

// ============================================================================
// TESTS
// ============================================================================
