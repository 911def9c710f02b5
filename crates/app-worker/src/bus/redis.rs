//! Redis pub/sub bus.
//!
//! Publishing uses a `MultiplexedConnection`, which is cheap to clone and
//! safe to use concurrently. Each subscription opens its own pub/sub
//! connection and forwards payloads into a bounded channel.

use crate::bus::{BusError, WorkerBus, SUBSCRIPTION_BUFFER};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The URL may carry credentials.
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}

impl RedisBus {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// `BusError::Unavailable` if the client cannot be opened or connected.
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do not log redis_url, it may contain credentials
            error!(target: "worker.bus", error = %e, "Failed to open Redis client");
            BusError::Unavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "worker.bus", error = %e, "Failed to connect to Redis");
                BusError::Unavailable(format!("Failed to connect to Redis: {e}"))
            })?;

        debug!(target: "worker.bus", "Connected to Redis");
        Ok(Self { client, connection })
    }
}

#[async_trait]
impl WorkerBus for RedisBus {
    #[instrument(skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let _receivers: i64 = conn.publish(channel, payload).await.map_err(|e| {
            warn!(target: "worker.bus", error = %e, "Redis publish failed");
            BusError::Unavailable(format!("Redis publish failed: {e}"))
        })?;
        Ok(())
    }

    #[instrument(skip_all, fields(channel = %channel))]
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            error!(target: "worker.bus", error = %e, "Failed to open Redis pub/sub connection");
            BusError::Unavailable(format!("Failed to open pub/sub connection: {e}"))
        })?;
        pubsub.subscribe(channel).await.map_err(|e| {
            error!(target: "worker.bus", error = %e, "Redis subscribe failed");
            BusError::Unavailable(format!("Redis subscribe failed: {e}"))
        })?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "worker.bus", channel = %channel, error = %e, "Non-text payload skipped");
                    }
                }
            }
            warn!(target: "worker.bus", channel = %channel, "Redis subscription ended");
        });

        Ok(rx)
    }
}
