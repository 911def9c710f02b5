//! Databoxes: pull-style data sources with per-socket admission control.
//!
//! Each socket gets its own fetch manager per databox. In sequential mode
//! fetches from one socket run in order and are shed once
//! `max_backpressure` are in flight; in parallel mode they run
//! independently.

use crate::auth::{AccessConfig, AuthEngine, ProtocolAccessConfig};
use crate::bus::InternalChannelEngine;
use crate::controller::{RequestContext, Response};
use crate::errors::{BackErrorBag, DehydrationPolicy, HandlerError, WorkerError};
use crate::scheduling::{build_fetch_manager_builder, FetchManager, FetchManagerBuilder};
use async_trait::async_trait;
use common::types::SocketId;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, instrument};

/// Default in-flight fetch limit per socket.
pub const DEFAULT_MAX_BACKPRESSURE: usize = 30;

/// Source of data for a databox identifier.
#[async_trait]
pub trait Databox: Send + Sync {
    async fn fetch(&self, ctx: &RequestContext, input: Value) -> Result<Value, HandlerError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataboxConfig {
    pub parallel_fetch: bool,
    pub max_backpressure: usize,
    pub access: AccessConfig,
    pub protocol_access: ProtocolAccessConfig,
}

impl Default for DataboxConfig {
    fn default() -> Self {
        Self {
            parallel_fetch: false,
            max_backpressure: DEFAULT_MAX_BACKPRESSURE,
            access: AccessConfig::default(),
            protocol_access: ProtocolAccessConfig::default(),
        }
    }
}

struct RegisteredDatabox {
    config: DataboxConfig,
    managers: FetchManagerBuilder,
    databox: Arc<dyn Databox>,
}

/// Databoxes by identifier.
#[derive(Default)]
pub struct DataboxRegistry {
    databoxes: HashMap<String, Arc<RegisteredDatabox>>,
}

impl fmt::Debug for DataboxRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.databoxes.keys().collect();
        ids.sort_unstable();
        f.debug_struct("DataboxRegistry").field("ids", &ids).finish()
    }
}

impl DataboxRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn databox(
        mut self,
        id: impl Into<String>,
        config: DataboxConfig,
        databox: Arc<dyn Databox>,
    ) -> Self {
        let managers = build_fetch_manager_builder(config.parallel_fetch, config.max_backpressure);
        self.databoxes.insert(
            id.into(),
            Arc::new(RegisteredDatabox {
                config,
                managers,
                databox,
            }),
        );
        self
    }
}

/// Serves fetches for every socket of a worker.
pub struct DataboxHost {
    registry: DataboxRegistry,
    channel: InternalChannelEngine,
    dehydration: DehydrationPolicy,
    managers: Mutex<HashMap<(SocketId, String), Arc<FetchManager>>>,
}

impl fmt::Debug for DataboxHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataboxHost")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl DataboxHost {
    #[must_use]
    pub fn new(
        registry: DataboxRegistry,
        channel: InternalChannelEngine,
        dehydration: DehydrationPolicy,
    ) -> Self {
        Self {
            registry,
            channel,
            dehydration,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Run a fetch packet `{"d": <databox>, "i"?: <input>}` to its single
    /// response.
    #[instrument(skip_all, fields(sid = %engine.socket().sid()))]
    pub async fn fetch(&self, engine: &AuthEngine, raw: Value) -> Response {
        match self.try_fetch(engine, raw).await {
            Ok(result) => Response {
                errors: Vec::new(),
                result: Some(result),
            },
            Err(errors) => Response {
                errors: errors.dehydrate(self.dehydration),
                result: None,
            },
        }
    }

    /// Drop the fetch managers of a closed socket.
    pub fn release_socket(&self, sid: &SocketId) {
        self.lock().retain(|(owner, _), _| owner != sid);
    }

    async fn try_fetch(&self, engine: &AuthEngine, raw: Value) -> Result<Value, BackErrorBag> {
        let id = raw
            .get("d")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkerError::InvalidRequest("d must be a databox id".to_string()))?
            .to_string();
        let input = raw.get("i").cloned().unwrap_or(Value::Null);
        let registered = self
            .registry
            .databoxes
            .get(&id)
            .cloned()
            .ok_or_else(|| WorkerError::ControllerNotFound(id.clone()))?;

        if !engine.has_server_protocol_access(&registered.config.protocol_access) {
            return Err(WorkerError::NoProtocolAccess {
                protocol: engine.socket().protocol().as_str().to_string(),
            }
            .into());
        }
        if !engine.has_access_to_controller(&registered.config.access)? {
            return Err(WorkerError::NoControllerAccess {
                group: engine.group(),
            }
            .into());
        }

        let manager = self.manager_for(engine, &id, &registered)?;
        let ctx = RequestContext {
            auth: engine.clone(),
            channel: self.channel.clone(),
            controller_id: id,
            api_level: engine.socket().handshake().api_level.unwrap_or_default(),
        };
        let databox = Arc::clone(&registered.databox);

        let fetched = manager
            .dispatch(move || async move { databox.fetch(&ctx, input).await })
            .await?;
        fetched.map_err(HandlerError::into_bag)
    }

    /// The socket is closed before it is released, so checking under the
    /// map lock keeps a late fetch from recreating a released entry.
    fn manager_for(
        &self,
        engine: &AuthEngine,
        id: &str,
        registered: &RegisteredDatabox,
    ) -> Result<Arc<FetchManager>, WorkerError> {
        let mut managers = self.lock();
        if engine.socket().is_closed() {
            return Err(WorkerError::SocketClosed);
        }
        let manager = managers
            .entry((engine.socket().sid().clone(), id.to_string()))
            .or_insert_with(|| {
                debug!(target: "worker.scheduler", databox = %id, "Fetch manager created");
                Arc::new(registered.managers.build())
            });
        Ok(Arc::clone(manager))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(SocketId, String), Arc<FetchManager>>> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
