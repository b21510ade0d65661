//! Ctrl-C and SIGTERM handling for a running operation.
//!
//! The first signal asks the operation to stop after its current volume,
//! leaving a valid partial backup. A second signal aborts it outright.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Stop,
    Abort,
}

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    tx: broadcast::Sender<ShutdownSignal>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.tx.subscribe()
    }

    /// Wait for two signals, broadcasting stop on the first and abort on the second.
    pub async fn watch_signals(&self) {
        for next in [ShutdownSignal::Stop, ShutdownSignal::Abort] {
            if let Err(e) = wait_for_signal().await {
                warn!("Failed to install signal handler: {}", e);
                return;
            }
            match next {
                ShutdownSignal::Stop => info!("Interrupt received, stopping after the current volume (repeat to abort)"),
                ShutdownSignal::Abort => info!("Second interrupt received, aborting"),
            }
            self.send(next);
        }
    }

    fn send(&self, signal: ShutdownSignal) {
        if self.tx.send(signal).is_err() {
            warn!("No operation is listening for {:?}", signal);
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
