//! OS signal handling: graceful shutdown and terminal resizes

use tokio::sync::mpsc;

use devloop_core::prelude::*;
use devloop_daemon::current_terminal_size;

use crate::message::DevEvent;

/// Spawn a task that sends a shutdown event for every OS termination signal.
///
/// A repeated signal retries a shutdown whose stop failed.
pub fn spawn_signal_handler(tx: mpsc::Sender<DevEvent>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = wait_for_signal().await {
                error!("Signal handler error: {}", e);
                return;
            }

            info!("Shutdown signal received");
            if tx.send(DevEvent::Shutdown).await.is_err() {
                return;
            }
        }
    });
}

/// Wait for a termination signal
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| Error::terminal(format!("Failed to create SIGINT handler: {}", e)))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| Error::terminal(format!("Failed to create SIGTERM handler: {}", e)))?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        Ok(())
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::terminal(format!("Failed to listen for Ctrl+C: {}", e)))?;
        info!("Received Ctrl+C");
        Ok(())
    }
}

/// Forward SIGWINCH as [`DevEvent::TerminalResized`]. No-op off unix.
pub fn spawn_resize_handler(tx: mpsc::Sender<DevEvent>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to create SIGWINCH handler: {}", e);
                return;
            }
        };

        while sigwinch.recv().await.is_some() {
            let size = current_terminal_size();
            trace!("Terminal resized to {}x{}", size.cols, size.rows);
            if tx.send(DevEvent::TerminalResized(size)).await.is_err() {
                break;
            }
        }
    });

    #[cfg(not(unix))]
    drop(tx);
}
