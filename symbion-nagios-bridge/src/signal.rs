//! Signal handling for graceful shutdown.

use tracing::{info, warn};

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!(message = "Signal received.", signal = "SIGINT");
                    }
                    _ = sigterm.recv() => {
                        info!(message = "Signal received.", signal = "SIGTERM");
                    }
                }
                return;
            }
            Err(e) => warn!("Cannot install SIGTERM handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(message = "Signal received.", signal = "SIGINT"),
        Err(e) => {
            warn!("Cannot install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
