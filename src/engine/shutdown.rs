//! Process-wide stop signal
//!
//! One [`Shutdown`] is created at startup; every controller, reflector and server
//! holds a [`ShutdownSignal`] and returns at its next suspension point once
//! it fires.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};

#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A `Send + Sync` future resolving once shutdown fires, for
    /// `Controller::graceful_shutdown_on`.
    pub fn triggered(&self) -> impl Future<Output = ()> + Send + Sync + 'static {
        let (tx, rx) = oneshot::channel::<()>();
        let mut signal = self.signal();
        tokio::spawn(async move {
            signal.recv().await;
            let _ = tx.send(());
        });
        async move {
            let _ = rx.await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been triggered (immediately if it already was).
    pub async fn recv(&mut self) {
        // a dropped sender counts as shutdown
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_fires_for_late_subscribers() {
        let shutdown = Shutdown::new();
        let mut early = shutdown.signal();
        shutdown.trigger();
        let mut late = shutdown.signal();

        tokio::time::timeout(Duration::from_secs(1), early.recv())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), late.recv())
            .await
            .unwrap();
        assert!(late.is_shutdown());
    }

    #[tokio::test]
    async fn test_triggered_future_resolves() {
        let shutdown = Shutdown::new();
        let triggered = shutdown.triggered();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), triggered)
            .await
            .unwrap();
    }
}
