//! Receiving side of the cluster bus.
//!
//! Every worker, including the publisher, applies each package to its own
//! sockets. Map tasks act on the selected sockets directly. Token edits run
//! as mid tasks so they never interleave with request processing. Worker
//! messages are re-broadcast to local listeners.

use crate::auth::AuthEngine;
use crate::bus::packages::{
    MapTask, MapTaskAction, SpecialTask, TokenUpdate, WorkerTask, WorkerTaskPackage,
};
use crate::observability::metrics;
use crate::scheduling::MidTaskScheduler;
use crate::socket::{ClientEvent, SocketRegistry};
use crate::token::ObjectEditAction;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Package ids remembered for redelivery detection.
pub const DEDUP_WINDOW: usize = 1024;

const SERVER_DISCONNECT_REASON: &str = "disconnected by server";

/// Bounded set of recently seen package ids.
#[derive(Debug)]
struct RecentPackages {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl RecentPackages {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// `true` the first time `pid` is offered while it is in the window.
    fn first_sighting(&mut self, pid: Uuid) -> bool {
        if !self.seen.insert(pid) {
            return false;
        }
        self.order.push_back(pid);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Applies worker-channel packages to this worker's sockets.
#[derive(Debug)]
pub struct PackageProcessor {
    registry: Arc<SocketRegistry>,
    scheduler: MidTaskScheduler,
    messages: broadcast::Sender<Value>,
    recent: RecentPackages,
}

impl PackageProcessor {
    #[must_use]
    pub fn new(
        registry: Arc<SocketRegistry>,
        scheduler: MidTaskScheduler,
        messages: broadcast::Sender<Value>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            messages,
            recent: RecentPackages::new(DEDUP_WINDOW),
        }
    }

    /// Process payloads until the subscription ends or `cancel` fires.
    pub async fn run(mut self, mut payloads: mpsc::Receiver<String>, cancel: CancellationToken) {
        info!(target: "worker.bus", "Package processor started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                payload = payloads.recv() => match payload {
                    Some(payload) => self.process(&payload),
                    None => {
                        warn!(target: "worker.bus", "Worker channel subscription closed");
                        break;
                    }
                },
            }
        }
        info!(target: "worker.bus", "Package processor stopped");
    }

    /// Decode and apply one payload. Malformed payloads and redeliveries
    /// are dropped.
    pub fn process(&mut self, payload: &str) {
        let package: WorkerTaskPackage = match serde_json::from_str(payload) {
            Ok(package) => package,
            Err(e) => {
                warn!(target: "worker.bus", error = %e, "Malformed worker package dropped");
                return;
            }
        };

        if !self.recent.first_sighting(package.pid) {
            debug!(target: "worker.bus", pid = %package.pid, "Duplicate worker package dropped");
            return;
        }
        metrics::record_bus_package("received", package.task.kind());

        match package.task {
            WorkerTask::Map(task) if task.action == MapTaskAction::Deauthenticate => {
                self.schedule_deauthentication(task);
            }
            WorkerTask::Map(task) => self.apply_map_task(&task),
            WorkerTask::Special(SpecialTask::UpdateUserTokens(TokenUpdate {
                operations,
                target,
                except_socket_sids,
            })) => {
                self.schedule_edits(operations, move |registry| {
                    registry.select_user(&target, &except_socket_sids)
                });
            }
            WorkerTask::Special(SpecialTask::UpdateGroupTokens(TokenUpdate {
                operations,
                target,
                except_socket_sids,
            })) => {
                self.schedule_edits(operations, move |registry| {
                    registry.select_group(&target, &except_socket_sids)
                });
            }
            WorkerTask::Special(SpecialTask::Message(data)) => {
                // No local listeners is fine.
                let _ = self.messages.send(data);
            }
        }
    }

    fn apply_map_task(&self, task: &MapTask) {
        let targets = self
            .registry
            .select(task.target, &task.ids, &task.except_socket_sids);
        debug!(
            target: "worker.bus",
            action = ?task.action,
            sockets = targets.len(),
            "Applying map task"
        );

        for engine in targets {
            match task.action {
                MapTaskAction::Disconnect => {
                    engine.socket().close(SERVER_DISCONNECT_REASON);
                    self.registry.remove(engine.socket().sid());
                }
                MapTaskAction::KickOut => {
                    if let Some(channel) = task.data.get("channel").and_then(Value::as_str) {
                        engine.socket().kick_out(channel);
                    }
                }
                MapTaskAction::Emit => {
                    if let Some(event) = task.data.get("event").and_then(Value::as_str) {
                        engine.socket().emit(ClientEvent::Emit {
                            event: event.to_string(),
                            data: task.data.get("data").cloned().unwrap_or(Value::Null),
                        });
                    }
                }
                // Scheduled as a mid task by `process`.
                MapTaskAction::Deauthenticate => {}
            }
        }
    }

    /// Sign the selected sockets out inside a mid task, selecting them only
    /// once the task runs.
    fn schedule_deauthentication(&self, task: MapTask) {
        let registry = Arc::clone(&self.registry);
        self.scheduler.schedule_mid_task(async move {
            let targets = registry.select(task.target, &task.ids, &task.except_socket_sids);
            debug!(target: "worker.bus", sockets = targets.len(), "Deauthenticating sockets");
            for engine in targets {
                if let Err(e) = engine.auth_out().await {
                    warn!(
                        target: "worker.bus",
                        sid = %engine.socket().sid(),
                        error = %e,
                        "Deauthentication failed"
                    );
                }
            }
        });
    }

    /// Targets are resolved when the mid task starts, so identity changes
    /// made while it was queued are honored.
    fn schedule_edits<F>(&self, operations: Vec<ObjectEditAction>, select: F)
    where
        F: FnOnce(&SocketRegistry) -> Vec<AuthEngine> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        self.scheduler.schedule_mid_task(async move {
            for engine in select(&registry) {
                if let Err(e) = engine.tokens().apply_edits(&operations) {
                    warn!(
                        target: "worker.bus",
                        sid = %engine.socket().sid(),
                        error = %e,
                        "Token edit from bus rejected"
                    );
                }
            }
        });
    }
}
