//! Runtime configuration for token-relay.
//!
//! Configuration is loaded from a JSON file and then patched with any
//! command-line overrides. Every section falls back to its defaults, so a
//! partial file (or no file at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "token-relay", about = "Streaming gateway for a local Ollama backend")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Backend host name (overrides `backend.host`).
    #[arg(long)]
    pub backend_host: Option<String>,

    /// Backend port (overrides `backend.port`).
    #[arg(long)]
    pub backend_port: Option<u16>,

    /// Model identifier sent to the backend (overrides `backend.model`).
    #[arg(long)]
    pub model: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Inference backend configuration.
    pub backend: BackendConfig,

    /// Relay tuning.
    pub relay: RelayConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:5000").
    pub listen: String,

    /// Deployment name reported in the `app_info` metric.
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            environment: "local".to_string(),
        }
    }
}

/// Where the Ollama backend lives and which model to ask for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,

    /// Model identifier, e.g. "llama2:7b".
    pub model: String,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Maximum wait for the backend's response headers or for the next
    /// chunk, in seconds.
    pub chunk_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "llama2:7b".to_string(),
            connect_timeout_secs: 10,
            chunk_timeout_secs: 120,
        }
    }
}

impl BackendConfig {
    /// Base URL of the backend, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

/// Relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Capacity of the channel between the backend reader and the response
    /// body. Bounds how far the reader may run ahead of a slow client.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides on top of the loaded file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(host) = &cli.backend_host {
            self.backend.host = host.clone();
        }
        if let Some(port) = cli.backend_port {
            self.backend.port = port;
        }
        if let Some(model) = &cli.model {
            self.backend.model = model.clone();
        }
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend.model.trim().is_empty() {
            bail!("backend.model must not be empty");
        }
        if self.backend.port == 0 {
            bail!("backend.port must be non-zero");
        }
        if self.backend.chunk_timeout_secs == 0 {
            bail!("backend.chunk_timeout_secs must be non-zero");
        }
        if self.relay.channel_capacity == 0 {
            bail!("relay.channel_capacity must be non-zero");
        }
        Ok(())
    }
}
