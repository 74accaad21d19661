//! Process lifecycle signal shared by every component.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Cloneable shutting-down flag
///
/// Metric emission and dead-letter drains check it first and become silent
/// no-ops once it has fired.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Marks the process as shutting down; idempotent
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown signalled");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the signal has fired
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
