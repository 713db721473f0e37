//! Process signals.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Resolve on SIGTERM or Ctrl-C.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("SIGINT received, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl-C received, shutting down");
    }
    Ok(())
}

/// Cancel `token` once a signal arrives or the token is cancelled elsewhere.
///
/// If the signal handlers cannot be installed the error is logged and the token is
/// cancelled anyway.
pub async fn cancel_on_signal(token: CancellationToken) -> std::io::Result<()> {
    tokio::select! {
        res = wait_for_signal() => {
            if let Err(err) = &res {
                error!(error = %err, "failed to listen for shutdown signals");
            }
            token.cancel();
            res
        }
        _ = token.cancelled() => Ok(()),
    }
}
