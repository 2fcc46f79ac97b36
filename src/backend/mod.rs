//! Inference backend abstraction.
//!
//! - [`ChatBackend`]: a streaming chat call taking a model and a message list
//! - [`ollama`]: the Ollama `/api/chat` implementation

pub mod ollama;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

pub use ollama::{NdjsonDecoder, OllamaBackend};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Error reported by the model server itself. Displayed verbatim.
    #[error("{0}")]
    Model(String),

    #[error("malformed backend chunk: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("backend produced no output for {0:?}")]
    Timeout(Duration),

    #[error("backend stream ended before completion")]
    Truncated,
}

/// Message author. Only user turns are ever sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Arguments of a single streaming backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
}

/// One incremental piece of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub content: String,
}

impl Chunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Lazy, finite, non-restartable chunk sequence. An `Err` item is always the last one.
pub type ChunkStream = BoxStream<'static, Result<Chunk, BackendError>>;

/// A language-model backend that can stream a chat completion.
///
/// Implementations must be safe to share across concurrent requests; each
/// call is independent.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Open a streaming call. Errors returned here happen before any output
    /// exists; errors inside the stream happen after.
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, BackendError>;
}
