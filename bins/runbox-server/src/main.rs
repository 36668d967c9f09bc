mod dispatcher;
mod gateway;
mod runner;
mod terminal;
mod workspace;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use runbox_common::config::ServerConfig;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::gateway::AppState;
use crate::terminal::TerminalRegistry;
use crate::workspace::WorkspaceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Runbox server booting...");

    let config = ServerConfig::from_env();

    let workspaces = WorkspaceManager::new(&config.scratch_dir)
        .context("Failed to prepare scratch directory")?;
    info!(
        scratch_dir = %config.scratch_dir.display(),
        timeout_ms = config.timeout_ms,
        "Execution engine ready"
    );

    let state = Arc::new(AppState {
        dispatcher: Dispatcher::new(workspaces, Duration::from_millis(config.timeout_ms)),
        terminals: TerminalRegistry::new(config.shell.as_str(), config.term_cols, config.term_rows),
    });
    info!(shell = %config.shell, cols = config.term_cols, rows = config.term_rows, "Terminal registry ready");

    let app = gateway::routes().with_state(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!("WebSocket gateway listening on {}", config.bind_addr);

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        warn!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}
