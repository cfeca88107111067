//! Coordinated shutdown signal.

use tokio::sync::watch;
use tracing::info;

/// Broadcasts a one-way shutdown signal to listeners and workers.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A receiver that resolves once shutdown is triggered.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        info!("shutdown triggered");
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_subscribers() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!*rx.borrow());

        shutdown.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_subscribe_after_trigger_sees_state() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let rx = shutdown.subscribe();
        assert!(*rx.borrow());
    }
}
