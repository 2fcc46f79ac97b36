//! token-relay: streaming HTTP gateway for a local language model.
//!
//! Accepts a prompt on `POST /generate`, opens one streaming chat call to an
//! Ollama backend and forwards each generated fragment to the caller as it
//! arrives. Prometheus metrics are served on `GET /metrics`.

pub mod backend;
pub mod config;
pub mod metrics;
pub mod server;
