//! Ollama chat backend.
//!
//! Calls `POST /api/chat` with `stream: true` and decodes the
//! newline-delimited JSON body into [`Chunk`]s as bytes arrive.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{BackendError, ChatBackend, ChatRequest, Chunk, ChunkStream, Message};
use crate::config::BackendConfig;

/// Ollama HTTP client. Cheap to share; `reqwest::Client` pools internally.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    http: reqwest::Client,
    base_url: String,
}

impl OllamaBackend {
    /// Build a client from configuration.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self::with_client(http, config.base_url()))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

/// One NDJSON record of a streaming `/api/chat` response.
#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, BackendError> {
        let body = ChatBody {
            model: &request.model,
            messages: &request.messages,
            stream: true,
        };

        debug!(
            url = %self.chat_url(),
            model = %request.model,
            messages = request.messages.len(),
            "Opening backend stream"
        );

        let resp = self.http.post(self.chat_url()).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = match resp.text().await {
                Ok(body) => body,
                Err(e) => {
                    debug!(
                        status = status.as_u16(),
                        error = %e,
                        "Failed to read backend error body"
                    );
                    String::new()
                }
            };
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(chunk_stream(resp.bytes_stream().boxed()))
    }
}

struct StreamState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<Result<Chunk, BackendError>>,
    done: bool,
    finished: bool,
}

impl StreamState {
    /// Turn decoded lines into pending items. Stops at the first error or at `done`.
    fn absorb(&mut self, lines: Vec<Vec<u8>>) {
        for line in lines {
            if self.finished {
                break;
            }
            match parse_line(&line) {
                Ok(parsed) => {
                    if let Some(msg) = parsed.error {
                        self.pending.push_back(Err(BackendError::Model(msg)));
                        self.finished = true;
                        continue;
                    }
                    if let Some(message) = parsed.message {
                        if !message.content.is_empty() {
                            self.pending.push_back(Ok(Chunk::new(message.content)));
                        }
                    }
                    if parsed.done {
                        self.done = true;
                        self.finished = true;
                    }
                }
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.finished = true;
                }
            }
        }
    }
}

fn parse_line(line: &[u8]) -> Result<ChatLine, BackendError> {
    Ok(serde_json::from_slice(line)?)
}

fn chunk_stream(body: BoxStream<'static, reqwest::Result<Bytes>>) -> ChunkStream {
    let state = StreamState {
        body,
        decoder: NdjsonDecoder::new(),
        pending: VecDeque::new(),
        done: false,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }

            match st.body.next().await {
                Some(Ok(bytes)) => {
                    let lines = st.decoder.push(&bytes);
                    st.absorb(lines);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(BackendError::Transport(e)), st));
                }
                None => {
                    if let Some(line) = st.decoder.finish() {
                        st.absorb(vec![line]);
                    }
                    if !st.done && !st.finished {
                        st.pending.push_back(Err(BackendError::Truncated));
                    }
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}

/// Incremental splitter for newline-delimited JSON.
///
/// Bytes may arrive cut at arbitrary points; complete lines are returned as
/// soon as their terminating `\n` is seen. `\r\n` endings and blank lines are
/// tolerated.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let scan_from = self.buf.len();
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut i = scan_from;
        while i < self.buf.len() {
            if self.buf[i] == b'\n' {
                if let Some(line) = non_blank(&self.buf[start..i]) {
                    lines.push(line.to_vec());
                }
                start = i + 1;
            }
            i += 1;
        }
        self.buf = self.buf.split_off(start);
        lines
    }

    /// Flush a final line that had no trailing newline.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buf);
        non_blank(&rest).map(<[u8]>::to_vec)
    }
}

fn non_blank(line: &[u8]) -> Option<&[u8]> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(line)
    }
}
