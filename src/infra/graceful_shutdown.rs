//! Graceful shutdown handling
//!
//! In-flight allocations are allowed to commit: axum stops accepting new
//! connections once [`shutdown_signal`] resolves and drains the rest.

use tokio::signal;
use tracing::{info, warn};

/// Resolves on SIGINT (Ctrl+C) or, on Unix, SIGTERM.
///
/// If a handler cannot be installed that signal is ignored and the other one
/// still triggers shutdown.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, draining in-flight allocations...");
        }
        _ = terminate => {
            info!("Received SIGTERM, draining in-flight allocations...");
        }
    }
}
