//! Cluster bus mocks.

use app_worker::bus::{BusError, LocalBus, WorkerBus};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A [`LocalBus`] that also records every published payload.
///
/// Clones share both the channels and the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingBus {
    inner: LocalBus,
    published: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(channel, payload)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    /// Payloads published to `channel`, parsed as JSON.
    pub fn published_on(&self, channel: &str) -> Vec<Value> {
        self.published()
            .into_iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| serde_json::from_str(&payload).expect("bus payloads are JSON"))
            .collect()
    }
}

#[async_trait]
impl WorkerBus for RecordingBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.clone()));
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, BusError> {
        self.inner.subscribe(channel).await
    }
}

/// A bus whose publishes always fail. Subscriptions succeed and stay silent.
#[derive(Debug, Default)]
pub struct FailingBus {
    // Keeps subscriptions open so the package processor does not exit.
    subscribers: Mutex<Vec<mpsc::Sender<String>>>,
}

impl FailingBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerBus for FailingBus {
    async fn publish(&self, _channel: &str, _payload: String) -> Result<(), BusError> {
        Err(BusError::Unavailable("connection refused".to_string()))
    }

    async fn subscribe(&self, _channel: &str) -> Result<mpsc::Receiver<String>, BusError> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }
}
