//! Cluster bus.
//!
//! Every worker publishes and subscribes to two channels: [`WORKER_CHANNEL`]
//! for fleet commands and [`MONITOR_CHANNEL`] for operator broadcasts.
//! Delivery is at-least-once and unordered across publishers; the package
//! processor drops redeliveries by package id.

pub mod internal_channel;
pub mod local;
pub mod packages;
pub mod processor;
pub mod redis;

pub use internal_channel::InternalChannelEngine;
pub use local::LocalBus;
pub use packages::{
    MapTask, MapTaskAction, MapTaskTarget, MonitorPackage, SpecialTask, TokenUpdate,
    WorkerTask, WorkerTaskPackage,
};
pub use processor::PackageProcessor;
pub use self::redis::RedisBus;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Fleet command channel.
pub const WORKER_CHANNEL: &str = "__worker";

/// Operator broadcast channel.
pub const MONITOR_CHANNEL: &str = "__monitor";

/// Buffered payloads per subscription before the bus adapter waits.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Bus subscription closed")]
    Closed,
}

/// Publish/subscribe transport between workers.
#[async_trait]
pub trait WorkerBus: Send + Sync {
    /// Publish a serialized payload to every subscriber of `channel`,
    /// including subscribers in this process.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Subscribe to `channel`. Payloads arrive in publish order per publisher.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, BusError>;
}
