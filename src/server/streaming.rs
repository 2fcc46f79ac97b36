//! Relay of backend chunks into a streamed HTTP body.
//!
//! A reader task pulls chunks from the backend and pushes their text into a
//! bounded channel; the response body drains that channel. The channel is the
//! only coupling between the two, so a slow client stalls the reader and a
//! dropped client stops it.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ChatBackend, ChatRequest, ChunkStream};

/// Knobs for a single relay.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Longest wait for the backend to answer or to produce the next chunk.
    pub chunk_timeout: Duration,
    /// Channel capacity between reader task and response body.
    pub channel_capacity: usize,
}

/// How a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Backend finished normally.
    Completed { chunks: usize },
    /// Backend failed after streaming began; `error` was written as the last fragment.
    Failed { chunks: usize, error: String },
    /// The client went away before the backend finished.
    Cancelled { chunks: usize },
}

/// Open the backend call, bounded by the chunk timeout.
///
/// Failures here happen before any response bytes exist.
pub async fn open_stream(
    backend: &dyn ChatBackend,
    request: ChatRequest,
    timeout: Duration,
) -> Result<ChunkStream, BackendError> {
    match tokio::time::timeout(timeout, backend.stream_chat(request)).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

/// Start relaying `stream` and return the response body plus the reader task.
///
/// Dropping the handle detaches the task; it still runs to completion or
/// until the body is dropped.
pub fn relay_to_body(
    stream: ChunkStream,
    request_id: String,
    settings: RelaySettings,
) -> (Body, JoinHandle<RelayOutcome>) {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(settings.channel_capacity);
    let task = tokio::spawn(pump(stream, tx, request_id, settings.chunk_timeout));
    (Body::from_stream(ReceiverStream::new(rx)), task)
}

async fn pump(
    mut stream: ChunkStream,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    request_id: String,
    chunk_timeout: Duration,
) -> RelayOutcome {
    let mut chunks: usize = 0;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                debug!(
                    request_id = %request_id,
                    chunks,
                    "Client disconnected, dropping backend stream"
                );
                return RelayOutcome::Cancelled { chunks };
            }
            next = tokio::time::timeout(chunk_timeout, stream.next()) => {
                next.unwrap_or_else(|_| Some(Err(BackendError::Timeout(chunk_timeout))))
            }
        };

        match next {
            Some(Ok(chunk)) => {
                if chunk.content.is_empty() {
                    continue;
                }
                if tx.send(Ok(Bytes::from(chunk.content))).await.is_err() {
                    debug!(
                        request_id = %request_id,
                        chunks,
                        "Client disconnected, dropping backend stream"
                    );
                    return RelayOutcome::Cancelled { chunks };
                }
                chunks += 1;
            }
            Some(Err(e)) => {
                // Headers are already out; the error text becomes the last fragment.
                let error = e.to_string();
                warn!(
                    request_id = %request_id,
                    chunks,
                    error = %error,
                    "Backend failed mid-stream"
                );
                let _ = tx.send(Ok(Bytes::from(error.clone()))).await;
                return RelayOutcome::Failed { chunks, error };
            }
            None => {
                info!(request_id = %request_id, chunks, "Relay complete");
                return RelayOutcome::Completed { chunks };
            }
        }
    }
}
