//! CeruleanLog Binary Entry Point
//!
//! This binary runs the complete CeruleanLog system.
//! Core functionality is provided by the `ceruleanlog` library crate.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ceruleanlog::{
    CeruleanInstance, Committer,
    server::{AppState, create_router},
};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CeruleanLog - Self-hosted Log Engine
#[derive(Parser, Debug)]
#[command(name = "ceruleanlog", version, about, long_about = None)]
struct Cli {
    /// Data directory (config and shards live here)
    #[arg(short, long, default_value = "./cerulean_data", env = "CERULEAN_DATA")]
    data: PathBuf,

    /// Server bind address
    #[arg(long, default_value = "0.0.0.0", env = "CERULEAN_BIND")]
    bind: String,

    /// Server port
    #[arg(long, default_value_t = 2020, env = "CERULEAN_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ceruleanlog=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("CeruleanLog - Self-hosted Log Engine");

    let cli = Cli::parse();

    tracing::info!(data_dir = %cli.data.display(), "Opening instance");
    let instance = Arc::new(CeruleanInstance::open(&cli.data)?);
    tracing::info!(
        shard_time_spec = ?instance.config().shard_time_spec,
        flush_seconds = instance.config().memory_buffer_time_seconds,
        "Instance ready"
    );

    // Background committer flushes the staging buffer to shards.
    let committer = Committer::spawn(Arc::clone(&instance));

    let app = create_router(AppState {
        instance: Arc::clone(&instance),
    });

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    tracing::info!("Web server listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Final swap+commit before exit so a clean shutdown loses nothing.
    tracing::info!("Shutting down committer...");
    if let Err(e) = committer.shutdown() {
        tracing::error!("Failed to shutdown committer: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Setup graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
