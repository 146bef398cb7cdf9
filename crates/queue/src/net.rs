use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network state subscription failed: {0}")]
    Subscribe(String),
}

/// Source of connectivity state: a synchronous point-in-time query plus a
/// stream of connected/disconnected transitions.
pub trait NetworkMonitor: Send + Sync {
    fn is_connected(&self) -> bool;
    fn subscribe(&self) -> Result<watch::Receiver<bool>, NetworkError>;
}

/// Watch-channel-backed monitor. The host drives it (health probe, OS
/// connectivity callbacks); the sync core only observes.
pub struct NetworkState {
    tx: watch::Sender<bool>,
}

impl NetworkState {
    pub fn new(initially_connected: bool) -> Arc<Self> {
        let (tx, _rx) = watch::channel(initially_connected);
        Arc::new(Self { tx })
    }

    /// Subscribers are only notified on actual transitions, so a periodic
    /// probe reporting the same state does not wake the scheduler.
    pub fn set_connected(&self, connected: bool) {
        let changed = self.tx.send_if_modified(|cur| {
            if *cur != connected {
                *cur = connected;
                true
            } else {
                false
            }
        });
        if changed {
            if connected {
                tracing::info!("network available");
            } else {
                tracing::warn!("network lost");
            }
        }
    }
}

impl NetworkMonitor for NetworkState {
    fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> Result<watch::Receiver<bool>, NetworkError> {
        Ok(self.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_reach_subscribers() {
        let net = NetworkState::new(false);
        assert!(!net.is_connected());

        let mut rx = net.subscribe().unwrap();
        net.set_connected(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(net.is_connected());
    }
}
