//! Shutdown signal handling.

#[cfg(not(test))]
use tokio::signal;
#[cfg(not(test))]
use tracing::info;

/// Wait for SIGTERM or SIGINT shutdown signal
#[cfg(not(test))]
pub async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl-C, shutting down");
    }
    Ok(())
}
