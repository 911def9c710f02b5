//! Publishing side of the cluster bus.
//!
//! Failed publishes are logged with their payload and returned as
//! `BusUnavailable`; they never take the worker down.

use crate::bus::packages::{
    MapTask, MapTaskAction, MapTaskTarget, MonitorPackage, SpecialTask, TokenUpdate, WorkerTask,
    WorkerTaskPackage,
};
use crate::bus::{WorkerBus, MONITOR_CHANNEL, WORKER_CHANNEL};
use crate::errors::WorkerError;
use crate::observability::metrics;
use crate::token::ObjectEditAction;
use common::types::{AuthId, SocketId};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, instrument};

#[derive(Clone)]
pub struct InternalChannelEngine {
    bus: Arc<dyn WorkerBus>,
    worker_id: String,
}

impl fmt::Debug for InternalChannelEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalChannelEngine")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl InternalChannelEngine {
    #[must_use]
    pub fn new(bus: Arc<dyn WorkerBus>, worker_id: impl Into<String>) -> Self {
        Self {
            bus,
            worker_id: worker_id.into(),
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Tell every worker to apply `action` to its sockets matching `target`
    /// and `ids`, skipping `except_socket_sids`.
    ///
    /// # Errors
    ///
    /// `BusUnavailable` if the publish fails.
    #[instrument(skip_all, fields(task_target = ?target, task_action = ?action))]
    pub async fn publish_map_task_to_worker(
        &self,
        target: MapTaskTarget,
        action: MapTaskAction,
        ids: Vec<Value>,
        except_socket_sids: Vec<SocketId>,
        data: Value,
    ) -> Result<(), WorkerError> {
        self.publish_task(WorkerTask::Map(MapTask {
            target,
            action,
            ids,
            except_socket_sids,
            data,
        }))
        .await
    }

    /// Apply `operations` to every live token of `auth_id` in the cluster.
    ///
    /// # Errors
    ///
    /// `BusUnavailable` if the publish fails.
    #[instrument(skip_all, fields(auth_id = %auth_id.key()))]
    pub async fn publish_update_user_token_worker_task(
        &self,
        operations: Vec<ObjectEditAction>,
        auth_id: AuthId,
        except_socket_sids: Vec<SocketId>,
    ) -> Result<(), WorkerError> {
        self.publish_task(WorkerTask::Special(SpecialTask::UpdateUserTokens(
            TokenUpdate {
                operations,
                target: auth_id,
                except_socket_sids,
            },
        )))
        .await
    }

    /// Apply `operations` to every live token authorized in `group`.
    ///
    /// # Errors
    ///
    /// `BusUnavailable` if the publish fails.
    #[instrument(skip_all, fields(group = %group))]
    pub async fn publish_update_group_token_worker_task(
        &self,
        operations: Vec<ObjectEditAction>,
        group: String,
        except_socket_sids: Vec<SocketId>,
    ) -> Result<(), WorkerError> {
        self.publish_task(WorkerTask::Special(SpecialTask::UpdateGroupTokens(
            TokenUpdate {
                operations,
                target: group,
                except_socket_sids,
            },
        )))
        .await
    }

    /// Broadcast an application message to every worker.
    ///
    /// # Errors
    ///
    /// `BusUnavailable` if the publish fails.
    pub async fn publish_worker_message(&self, data: Value) -> Result<(), WorkerError> {
        self.publish_task(WorkerTask::Special(SpecialTask::Message(data)))
            .await
    }

    /// Broadcast an event on the monitor channel.
    ///
    /// # Errors
    ///
    /// `BusUnavailable` if the publish fails.
    pub async fn publish_to_monitor(
        &self,
        event: impl Into<String>,
        data: Value,
    ) -> Result<(), WorkerError> {
        let package = MonitorPackage {
            origin: self.worker_id.clone(),
            event: event.into(),
            data,
        };
        self.publish(MONITOR_CHANNEL, &package).await
    }

    async fn publish_task(&self, task: WorkerTask) -> Result<(), WorkerError> {
        let kind = task.kind();
        let package = WorkerTaskPackage::new(self.worker_id.clone(), task);
        let pid = package.pid;
        self.publish(WORKER_CHANNEL, &package).await?;
        metrics::record_bus_package("published", kind);
        debug!(target: "worker.bus", pid = %pid, task_type = kind, "Worker task published");
        Ok(())
    }

    async fn publish<P: Serialize>(&self, channel: &str, package: &P) -> Result<(), WorkerError> {
        let payload = serde_json::to_string(package)
            .map_err(|e| WorkerError::Internal(format!("bus package serialization failed: {e}")))?;

        if let Err(e) = self.bus.publish(channel, payload.clone()).await {
            metrics::record_bus_publish_failure(channel);
            error!(
                target: "worker.bus",
                channel = channel,
                error = %e,
                payload = %payload,
                "Bus publish failed"
            );
            return Err(WorkerError::BusUnavailable(e.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bus::{BusError, LocalBus};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct DownBus;

    #[async_trait]
    impl WorkerBus for DownBus {
        async fn publish(&self, _channel: &str, _payload: String) -> Result<(), BusError> {
            Err(BusError::Unavailable("connection refused".to_string()))
        }

        async fn subscribe(&self, _channel: &str) -> Result<mpsc::Receiver<String>, BusError> {
            Err(BusError::Closed)
        }
    }

    #[tokio::test]
    async fn test_user_token_update_reaches_subscribers() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe(WORKER_CHANNEL).await.unwrap();
        let engine = InternalChannelEngine::new(Arc::new(bus), "worker-1");

        engine
            .publish_update_user_token_worker_task(
                vec![ObjectEditAction::set("nick", "y")],
                AuthId::from(42),
                vec![SocketId::from("sidA")],
            )
            .await
            .unwrap();

        let package: WorkerTaskPackage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(package.origin, "worker-1");
        assert_eq!(
            package.task,
            WorkerTask::Special(SpecialTask::UpdateUserTokens(TokenUpdate {
                operations: vec![ObjectEditAction::set("nick", "y")],
                target: AuthId::from(42),
                except_socket_sids: vec![SocketId::from("sidA")],
            }))
        );
    }

    #[tokio::test]
    async fn test_each_publish_gets_its_own_pid() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe(WORKER_CHANNEL).await.unwrap();
        let engine = InternalChannelEngine::new(Arc::new(bus), "worker-1");

        engine.publish_worker_message(json!(1)).await.unwrap();
        engine.publish_worker_message(json!(1)).await.unwrap();

        let a: WorkerTaskPackage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let b: WorkerTaskPackage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_ne!(a.pid, b.pid);
    }

    #[tokio::test]
    async fn test_monitor_goes_to_monitor_channel() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe(MONITOR_CHANNEL).await.unwrap();
        let engine = InternalChannelEngine::new(Arc::new(bus), "worker-1");

        engine.publish_to_monitor("started", json!({})).await.unwrap();

        let package: MonitorPackage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(package.event, "started");
        assert_eq!(package.origin, "worker-1");
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned() {
        let engine = InternalChannelEngine::new(Arc::new(DownBus), "worker-1");

        let result = engine
            .publish_map_task_to_worker(
                MapTaskTarget::AllSockets,
                MapTaskAction::Disconnect,
                Vec::new(),
                Vec::new(),
                Value::Null,
            )
            .await;

        assert!(matches!(result, Err(WorkerError::BusUnavailable(_))));
    }
}
