use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info};

pub mod config;
pub mod self_update_service;

/// Resolves on Ctrl-C, SIGTERM, or when `restart` is notified after a
/// self-update.
pub async fn shutdown_signal(restart: Arc<Notify>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C.");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM.");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Interrupt received, shutting down."),
        _ = terminate => info!("SIGTERM received, shutting down."),
        _ = restart.notified() => info!("Restarting into the updated binary."),
    }
}
