//! Controllers with canned behavior.

use app_worker::controller::{Controller, RequestContext};
use app_worker::errors::{BackError, ErrorType, HandlerError};
use async_trait::async_trait;
use common::types::AuthId;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Returns its input and counts calls.
#[derive(Debug, Default)]
pub struct EchoController {
    calls: AtomicUsize,
}

impl EchoController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Controller for EchoController {
    async fn handle(&self, _ctx: &RequestContext, input: Value) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(input)
    }
}

/// Fails with one application error named `name`.
#[derive(Debug)]
pub struct FailingController {
    name: String,
}

impl FailingController {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Controller for FailingController {
    async fn handle(&self, _ctx: &RequestContext, _input: Value) -> Result<Value, HandlerError> {
        Err(BackError::new(self.name.clone(), ErrorType::Normal)
            .with_description("controller failed on purpose")
            .into())
    }
}

/// Panics on every call.
#[derive(Debug, Default)]
pub struct PanickingController;

#[async_trait]
impl Controller for PanickingController {
    async fn handle(&self, _ctx: &RequestContext, _input: Value) -> Result<Value, HandlerError> {
        panic!("controller panicked on purpose");
    }
}

/// Signs the connection in or out.
///
/// Input `{"group": "<group>", "authId"?: <id>, "data"?: {...}}` signs in
/// and answers `{"authenticated": bool}`; `{"out": true}` signs out.
#[derive(Debug, Default)]
pub struct AuthenticatingController;

#[async_trait]
impl Controller for AuthenticatingController {
    async fn handle(&self, ctx: &RequestContext, input: Value) -> Result<Value, HandlerError> {
        if input.get("out").and_then(Value::as_bool) == Some(true) {
            ctx.auth.auth_out().await?;
            return Ok(json!({"authenticated": false}));
        }

        let group = input
            .get("group")
            .and_then(Value::as_str)
            .ok_or_else(|| BackError::new("groupRequired", ErrorType::Input))?;
        let auth_id = input.get("authId").and_then(AuthId::from_json);
        let data = input.get("data").and_then(Value::as_object).cloned();

        let authenticated = ctx.auth.auth_to(group, auth_id, data).await?;
        Ok(json!({"authenticated": authenticated}))
    }
}
