//! Graceful shutdown on SIGINT and SIGTERM
//!
//! A signal cancels the shared [`CancellationToken`]. Transfers observe the
//! token between parts, abort their open multipart uploads and return
//! `Cancelled`, so the process exits only after the store is cleaned up.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Install signal handlers that cancel the returned token
///
/// Must be called from within a Tokio runtime.
#[must_use]
pub fn install_signal_handlers() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        cancel.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, cancelling transfers");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, cancelling transfers");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, cancelling transfers"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            // Without a signal source the token is never cancelled.
            std::future::pending::<()>().await;
        }
    }
}
