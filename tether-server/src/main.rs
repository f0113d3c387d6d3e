//! tether server - terminal session broker daemon
//!
//! Spawns shells inside durable multiplexer sessions, streams their output
//! to the client connections that own each terminal, and rebuilds its
//! registry from multiplexer inventory after a restart.

mod backend;
mod config;
mod handlers;
mod recovery;
mod resize;
mod router;
mod server;
mod terminal;

use tracing::info;

use tether_utils::{LogConfig, Result};

use config::ConfigLoader;
use server::TetherServer;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("tether-server: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let log_config = if std::env::var("TETHER_FOREGROUND").is_ok() {
        LogConfig::development()
    } else {
        LogConfig::server()
    };
    tether_utils::init_logging_with_config(log_config)?;
    tether_utils::ensure_all_dirs()?;

    let config = ConfigLoader::load_and_validate()?;
    let socket_path = config
        .general
        .socket_path
        .clone()
        .unwrap_or_else(tether_utils::socket_path);

    let (server, exit_rx) = TetherServer::new(config);

    // Reconciliation runs before the socket opens: listings are never
    // served from a partially rebuilt registry.
    let report = server.reconcile().await;
    info!(
        "Startup recovery: {} detached terminals rebuilt",
        report.recovered
    );

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = tokio::net::UnixListener::bind(&socket_path)?;
    info!("Listening on {}", socket_path.display());

    std::fs::write(tether_utils::pid_file(), std::process::id().to_string())?;

    std::sync::Arc::clone(&server).start_exit_loop(exit_rx);

    let serve_server = std::sync::Arc::clone(&server);
    tokio::select! {
        result = serve_server.serve(listener) => {
            result?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    server.shutdown();
    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(tether_utils::pid_file());
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
