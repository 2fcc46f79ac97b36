//! HTTP API.
//!
//! - POST /generate
//! - GET /metrics
//! - GET /health

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, ChatBackend, ChatRequest, Message};
use crate::config::Config;
use crate::metrics::{track_http, Metrics};
use crate::server::streaming::{open_stream, relay_to_body, RelaySettings};

/// Application state shared across handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: Arc<dyn ChatBackend>,
    pub metrics: Arc<Metrics>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config, backend: Arc<dyn ChatBackend>) -> Result<Self, prometheus::Error> {
        let metrics = Metrics::new(env!("CARGO_PKG_VERSION"), &config.server.environment)?;
        Ok(Self {
            config: Arc::new(config),
            backend,
            metrics: Arc::new(metrics),
            start_time: Instant::now(),
        })
    }

    fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            chunk_timeout: self.config.backend.chunk_timeout(),
            channel_capacity: self.config.relay.channel_capacity,
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            track_http,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Body of `POST /generate`.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

impl GenerateRequest {
    /// Parse and validate a raw body, yielding a non-empty prompt.
    pub fn parse_prompt(body: &[u8]) -> Result<String, ApiError> {
        let req: GenerateRequest =
            serde_json::from_slice(body).map_err(|e| ApiError::InvalidBody(e.to_string()))?;
        match req.prompt {
            Some(prompt) if !prompt.is_empty() => Ok(prompt),
            _ => Err(ApiError::MissingPrompt),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub model: String,
    pub backend: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No prompt provided")]
    MissingPrompt,

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("backend unavailable: {0}")]
    Backend(#[from] BackendError),

    #[error("failed to encode metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingPrompt | ApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Backend(BackendError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Backend(_) => StatusCode::BAD_GATEWAY,
            ApiError::Metrics(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn generate(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let prompt = GenerateRequest::parse_prompt(&body)?;
    let request_id = Uuid::new_v4().to_string();
    let settings = state.relay_settings();

    let request = ChatRequest {
        model: state.config.backend.model.clone(),
        messages: vec![Message::user(prompt)],
    };

    info!(
        request_id = %request_id,
        model = %request.model,
        backend = state.backend.name(),
        "Generate request"
    );

    let stream = open_stream(state.backend.as_ref(), request, settings.chunk_timeout)
        .await
        .map_err(|e| {
            warn!(
                request_id = %request_id,
                error = %e,
                "Backend call failed before streaming"
            );
            ApiError::Backend(e)
        })?;

    let (body, _relay) = relay_to_body(stream, request_id, settings);

    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let text = state.metrics.encode()?;
    Ok(([(CONTENT_TYPE, state.metrics.content_type())], text).into_response())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        model: state.config.backend.model.clone(),
        backend: state.backend.name().to_string(),
    })
}
