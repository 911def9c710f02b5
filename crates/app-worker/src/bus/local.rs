//! In-process bus for single-node deployments and tests.

use crate::bus::{BusError, WorkerBus, SUBSCRIPTION_BUFFER};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

const CHANNEL_CAPACITY: usize = 4096;

/// Bus backed by one `tokio::sync::broadcast` channel per bus channel.
///
/// Clones share the same channels, so two workers holding clones of one
/// `LocalBus` behave like a two-node cluster.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl WorkerBus for LocalBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        // No subscribers is not a failure: nobody is listening yet.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, BusError> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "worker.bus",
                            channel = %channel,
                            skipped = skipped,
                            "Local bus subscriber lagged, payloads lost"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_channels() {
        let bus = LocalBus::new();
        let other = bus.clone();
        let mut rx_a = bus.subscribe("__worker").await.unwrap();
        let mut rx_b = other.subscribe("__worker").await.unwrap();

        other.publish("__worker", "one".to_string()).await.unwrap();
        other.publish("__worker", "two".to_string()).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap(), "one");
        assert_eq!(rx_a.recv().await.unwrap(), "two");
        assert_eq!(rx_b.recv().await.unwrap(), "one");
    }

    #[tokio::test]
    async fn test_channels_are_separate() {
        let bus = LocalBus::new();
        let mut worker = bus.subscribe("__worker").await.unwrap();

        bus.publish("__monitor", "m".to_string()).await.unwrap();
        bus.publish("__worker", "w".to_string()).await.unwrap();

        assert_eq!(worker.recv().await.unwrap(), "w");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = LocalBus::new();
        assert!(bus.publish("__worker", "x".to_string()).await.is_ok());
    }
}
