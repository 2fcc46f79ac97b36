use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use token_relay::backend::{ChatBackend, OllamaBackend};
use token_relay::config::{Cli, Config};
use token_relay::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "token_relay=debug,tower_http=debug"
    } else {
        "token_relay=info,tower_http=info"
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true);

    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("token-relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration, then let the command line win.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    config.validate()?;

    info!(
        backend = %config.backend.base_url(),
        model = %config.backend.model,
        chunk_timeout_secs = config.backend.chunk_timeout_secs,
        channel_capacity = config.relay.channel_capacity,
        "Configuration loaded"
    );

    // One backend client for the whole process.
    let backend: Arc<dyn ChatBackend> = Arc::new(OllamaBackend::new(&config.backend)?);

    let listen_addr = config.server.listen.clone();
    let state = Arc::new(AppState::new(config, backend)?);
    let app = build_router(state);

    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
