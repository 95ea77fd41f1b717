//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::Agent;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4646,
        }
    }
}

/// Start the HTTP server for the provided agent.
pub async fn serve(config: ServerConfig, agent: Arc<Agent>) -> anyhow::Result<()> {
    let shutdown = agent.shutdown_token();
    let app = routes(Arc::clone(&agent));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting snapshot endpoint on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Server shutdown complete");

    // Cut loose any stream still relaying so its bridge settles.
    agent.trigger_shutdown();

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM, SIGINT, or the agent's own token).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This can only happen if:
/// - Called from a non-main thread without the runtime being properly configured
/// - The tokio runtime is not properly initialized
///
/// These are unrecoverable configuration errors that should fail fast at startup.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = shutdown.cancelled() => {
            info!("Agent shutdown triggered, shutting down...");
        }
    }
}
