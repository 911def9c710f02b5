//! Worker context.
//!
//! One [`Worker`] per process, constructed explicitly and passed to the
//! transport. It owns the socket registry, the scheduler, the token
//! collaborators and the cluster bus tasks.
//!
//! Requests and receiver packages run as tasks on the [`MidTaskScheduler`];
//! token edits arriving over the bus and token-store sweeps run as mid
//! tasks, so the two never interleave.

use crate::auth::{AuthEngine, AuthState};
use crate::bus::{InternalChannelEngine, PackageProcessor, WorkerBus, WORKER_CHANNEL};
use crate::config::Config;
use crate::controller::{ControllerRegistry, ControllerReqHandler, ReqHandlerSettings, Response};
use crate::databox::{DataboxHost, DataboxRegistry};
use crate::errors::{BackErrorBag, DehydratedError, DehydrationPolicy, WorkerError};
use crate::scheduling::MidTaskScheduler;
use crate::socket::{ClientEvent, HandshakeInfo, Protocol, Socket, SocketRegistry};
use crate::token::{TokenInfoStore, TokenServices};
use common::jwt::{unix_now, TokenSigner};
use common::types::SocketId;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Capacity of the local worker-message broadcast.
const WORKER_MESSAGE_BUFFER: usize = 256;

const SHUTDOWN_REASON: &str = "server shutting down";

/// Application pieces plugged into a worker.
#[derive(Debug, Default)]
pub struct WorkerApp {
    pub controllers: ControllerRegistry,
    pub databoxes: DataboxRegistry,
}

/// A new connection as handed to the transport.
#[derive(Debug)]
pub struct Connection {
    pub engine: AuthEngine,
    pub events: mpsc::Receiver<ClientEvent>,
}

pub struct Worker {
    worker_id: String,
    services: Arc<TokenServices>,
    registry: Arc<SocketRegistry>,
    scheduler: MidTaskScheduler,
    channel: InternalChannelEngine,
    requests: ControllerReqHandler,
    databoxes: DataboxHost,
    messages: broadcast::Sender<Value>,
    dehydration: DehydrationPolicy,
    cancel: CancellationToken,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("sockets", &self.registry.len())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Build the worker, subscribe to the worker channel and spawn the
    /// package processor and the token-store sweep. Both stop when `cancel`
    /// fires.
    ///
    /// # Errors
    ///
    /// - `Signing` - the token secret is unusable
    /// - `BusUnavailable` - the worker channel subscription failed
    #[instrument(skip_all, fields(worker_id = %config.worker_id))]
    pub async fn start(
        config: &Config,
        app: WorkerApp,
        bus: Arc<dyn WorkerBus>,
        store: Arc<dyn TokenInfoStore>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, WorkerError> {
        let signer = TokenSigner::new(&config.token_secret)?;
        let services = Arc::new(TokenServices::new(
            signer,
            Arc::clone(&store),
            Arc::new(config.auth_config()),
        ));
        let registry = Arc::new(SocketRegistry::new());
        let scheduler = MidTaskScheduler::new();
        let channel = InternalChannelEngine::new(Arc::clone(&bus), config.worker_id.clone());
        let dehydration = config.dehydration_policy();
        let requests = ControllerReqHandler::new(
            Arc::new(app.controllers),
            channel.clone(),
            ReqHandlerSettings {
                auth_controller: config.auth_controller.clone(),
                default_api_level: config.default_api_level,
                validation_check_limit: config.validation_check_limit,
                use_token_state_check: config.use_token_state_check,
                dehydration,
            },
        );
        let databoxes = DataboxHost::new(app.databoxes, channel.clone(), dehydration);
        let (messages, _) = broadcast::channel(WORKER_MESSAGE_BUFFER);

        let payloads = bus
            .subscribe(WORKER_CHANNEL)
            .await
            .map_err(|e| WorkerError::BusUnavailable(e.to_string()))?;
        let processor =
            PackageProcessor::new(Arc::clone(&registry), scheduler.clone(), messages.clone());
        tokio::spawn(processor.run(payloads, cancel.child_token()));

        tokio::spawn(run_token_sweep(
            store,
            scheduler.clone(),
            Duration::from_secs(config.token_sweep_interval_seconds.max(1)),
            cancel.child_token(),
        ));

        let worker = Arc::new(Self {
            worker_id: config.worker_id.clone(),
            services,
            registry,
            scheduler,
            channel,
            requests,
            databoxes,
            messages,
            dehydration,
            cancel,
        });

        if let Err(e) = worker
            .channel
            .publish_to_monitor("workerStarted", json!({"workerId": worker.worker_id}))
            .await
        {
            warn!(target: "worker.bus", error = %e, "Monitor announcement failed");
        }
        info!(target: "worker.transport", "Worker started");
        Ok(worker)
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn scheduler(&self) -> &MidTaskScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn channel(&self) -> &InternalChannelEngine {
        &self.channel
    }

    #[must_use]
    pub fn services(&self) -> &Arc<TokenServices> {
        &self.services
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Client-facing form of a framework error under this worker's policy.
    #[must_use]
    pub fn dehydrate(&self, err: WorkerError) -> Vec<DehydratedError> {
        BackErrorBag::from(err).dehydrate(self.dehydration)
    }

    /// Application messages published by any worker.
    #[must_use]
    pub fn worker_messages(&self) -> broadcast::Receiver<Value> {
        self.messages.subscribe()
    }

    /// Accept a connection.
    ///
    /// A handshake token is verified (and checked against the token-info
    /// store when token-state checking is enabled) before the socket
    /// exists. A token with a missing or unconfigured auth group signs the
    /// socket out and rejects it.
    ///
    /// # Errors
    ///
    /// `InvalidToken`, `TokenExpired`, `TokenBlocked`,
    /// `TokenWithoutAuthGroup`, `SavedAuthGroupNotFound` or `TokenStore`.
    #[instrument(skip_all, fields(protocol = protocol.as_str()))]
    pub async fn connect(
        &self,
        protocol: Protocol,
        handshake: HandshakeInfo,
        signed_token: Option<&str>,
    ) -> Result<Connection, WorkerError> {
        let config = self.services.auth_config();
        let token = match signed_token {
            Some(signed) => {
                let token = self.services.verify(signed)?;
                if config.use_token_state_check
                    && !self.services.store().is_token_id_valid(&token.token_id).await?
                {
                    return Err(WorkerError::TokenBlocked);
                }
                Some((token, signed.to_string()))
            }
            None => None,
        };

        let (socket, events) = Socket::new(protocol, handshake, AuthState::default_for(config));
        let engine = AuthEngine::init(Arc::new(socket), Arc::clone(&self.services), token).await?;
        self.registry.insert(engine.clone());

        debug!(
            target: "worker.transport",
            sid = %engine.socket().sid(),
            group = %engine.group(),
            "Socket connected"
        );
        Ok(Connection { engine, events })
    }

    /// Run a request as a scheduler task and wait for its response.
    pub async fn handle_request(&self, engine: &AuthEngine, raw: Value) -> Response {
        let (tx, rx) = oneshot::channel();
        let requests = self.requests.clone();
        let engine = engine.clone();
        self.scheduler.schedule_task(async move {
            let response = requests.handle_request(&engine, raw).await;
            let _ = tx.send(response);
        });

        rx.await.unwrap_or_else(|_| Response {
            errors: self.dehydrate(WorkerError::Internal("request task dropped".to_string())),
            result: None,
        })
    }

    /// Run a receiver package as a scheduler task.
    pub fn handle_receiver(&self, engine: &AuthEngine, raw: Value) {
        let requests = self.requests.clone();
        let engine = engine.clone();
        self.scheduler.schedule_task(async move {
            requests.handle_receiver(&engine, raw).await;
        });
    }

    /// Run a databox fetch.
    pub async fn fetch(&self, engine: &AuthEngine, raw: Value) -> Response {
        self.databoxes.fetch(engine, raw).await
    }

    /// Forget a socket. Idempotent.
    pub fn disconnect(&self, sid: &SocketId) {
        if let Some(engine) = self.registry.remove(sid) {
            engine.socket().close("client disconnected");
            debug!(target: "worker.transport", sid = %sid, "Socket disconnected");
        }
        self.databoxes.release_socket(sid);
    }

    /// Close every socket and stop the background tasks.
    pub fn shutdown(&self) {
        for engine in self.registry.all() {
            engine.socket().close(SHUTDOWN_REASON);
            self.registry.remove(engine.socket().sid());
        }
        self.cancel.cancel();
        info!(target: "worker.transport", "Worker stopped");
    }
}

async fn run_token_sweep(
    store: Arc<dyn TokenInfoStore>,
    scheduler: MidTaskScheduler,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let store = Arc::clone(&store);
                scheduler.schedule_mid_task(async move {
                    match store.remove_expired(unix_now()).await {
                        Ok(0) => {}
                        Ok(removed) => {
                            debug!(target: "worker.scheduler", removed, "Expired token records removed");
                        }
                        Err(e) => {
                            warn!(target: "worker.scheduler", error = %e, "Token store sweep failed");
                        }
                    }
                });
            }
        }
    }
}
