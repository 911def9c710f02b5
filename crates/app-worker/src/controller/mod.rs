//! Business controllers and the request pipeline that drives them.
//!
//! Controllers are registered at startup through
//! [`ControllerRegistry::builder`] with a [`ControllerConfig`] describing who
//! may call them. Receivers use the same trait and config but live in their
//! own namespace and never answer.

pub mod envelope;
pub mod registry;
pub mod req_handler;

pub use envelope::{ControllerTarget, ReceiverEnvelope, RequestBody, RequestEnvelope, Response};
pub use registry::{ControllerRegistry, ControllerRegistryBuilder, RegisteredController};
pub use req_handler::{ControllerReqHandler, ReqHandlerSettings};

use crate::auth::{AccessConfig, AuthEngine, ClientAccessConfig, ProtocolAccessConfig};
use crate::bus::InternalChannelEngine;
use crate::errors::{BackErrorBag, HandlerError};
use crate::socket::Socket;
use crate::token::{ObjectPath, TokenEngine};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// What a handler can reach while it runs.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub auth: AuthEngine,
    pub channel: InternalChannelEngine,
    pub controller_id: String,
    pub api_level: u32,
}

impl RequestContext {
    #[must_use]
    pub fn socket(&self) -> &Arc<Socket> {
        self.auth.socket()
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenEngine {
        self.auth.tokens()
    }
}

/// Business logic behind a controller or receiver identifier.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Handle validated input. The returned value is the response result;
    /// receivers' results are discarded.
    async fn handle(&self, ctx: &RequestContext, input: Value) -> Result<Value, HandlerError>;

    /// Called when input validation failed. Errors returned here are added
    /// to `errors`.
    async fn invalid_input(
        &self,
        _ctx: &RequestContext,
        _input: &Value,
        _errors: &BackErrorBag,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called after validation, before [`Controller::handle`].
    async fn before_handle(&self, _ctx: &RequestContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Input validation for one controller.
#[async_trait]
pub trait InputValidator: Send + Sync {
    /// Validate and normalize the full input.
    async fn consume(&self, input: Value) -> Result<Value, BackErrorBag>;

    /// Validate one value at `path` (validation-check requests).
    async fn check(&self, path: &ObjectPath, value: &Value) -> Result<(), BackErrorBag>;
}

/// Accepts any input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyInput;

#[async_trait]
impl InputValidator for AnyInput {
    async fn consume(&self, input: Value) -> Result<Value, BackErrorBag> {
        Ok(input)
    }

    async fn check(&self, _path: &ObjectPath, _value: &Value) -> Result<(), BackErrorBag> {
        Ok(())
    }
}

/// Access and validation settings of a controller.
#[derive(Clone)]
pub struct ControllerConfig {
    pub access: AccessConfig,
    pub protocol_access: ProtocolAccessConfig,
    pub client_access: ClientAccessConfig,
    /// Overrides the worker-wide token state check.
    pub token_state_check: Option<bool>,
    pub input: Arc<dyn InputValidator>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            access: AccessConfig::default(),
            protocol_access: ProtocolAccessConfig::default(),
            client_access: ClientAccessConfig::default(),
            token_state_check: None,
            input: Arc::new(AnyInput),
        }
    }
}

impl fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("access", &self.access)
            .field("protocol_access", &self.protocol_access)
            .field("client_access", &self.client_access)
            .field("token_state_check", &self.token_state_check)
            .finish_non_exhaustive()
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn with_access(mut self, access: AccessConfig) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn with_protocol_access(mut self, protocol_access: ProtocolAccessConfig) -> Self {
        self.protocol_access = protocol_access;
        self
    }

    #[must_use]
    pub fn with_client_access(mut self, client_access: ClientAccessConfig) -> Self {
        self.client_access = client_access;
        self
    }

    #[must_use]
    pub fn with_token_state_check(mut self, enabled: bool) -> Self {
        self.token_state_check = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_input(mut self, input: Arc<dyn InputValidator>) -> Self {
        self.input = input;
        self
    }
}
