//! Graceful shutdown: OS-signal future for the server loop.

use tracing::info;

/// Completes on SIGTERM or SIGINT (Ctrl+C).
#[cfg(unix)]
pub async fn os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT (Ctrl+C)");
        }
    }
}

/// Completes on Ctrl+C.
#[cfg(not(unix))]
pub async fn os_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    info!("Received Ctrl+C");
}
