//! A cloneable shutdown signal. Long-running operations check it at safe
//! points (the sync engine at bulk-batch boundaries) and unwind cleanly.

use std::sync::Arc;

use tokio::sync::watch::{self, Receiver, Sender};
use tracing::info;

#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: Arc<Sender<bool>>,
    receiver: Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Shutdown {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Signal every holder of this handle to stop.
    pub fn shutdown(&self) {
        // Does not fail because we hold a receiver ourselves.
        let _ = self.sender.send(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the signal. Resolves immediately if the signal was already
    /// sent. The resulting future is safe to cancel by dropping.
    pub async fn await_shutdown(&self) {
        let mut watch = self.receiver.clone();
        if *watch.borrow_and_update() {
            return;
        }
        // Does not fail because the sender lives as long as self.
        let _ = watch.changed().await;
    }

    /// Trips this handle when the process receives SIGINT or SIGTERM.
    pub fn watch_signals(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            if signal_shutdown().await.is_ok() {
                handle.shutdown();
            }
        });
    }
}

#[cfg(unix)]
async fn signal_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn signal_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}
