//! Request state machine.
//!
//! ```text
//! Received -> StructureValid -> ControllerResolved -> SystemAccessChecked
//!   -> VersionAccessChecked -> TokenStateChecked -> ProtocolAccessChecked
//!   -> ControllerAccessChecked
//!   -> ValidationCheckOnly -> Responded([errors])
//!   -> InputConsumed
//!        failure: invalid_input hook -> Responded([errors])
//!        success: before_handle -> handle -> Responded([errors, result])
//! ```
//!
//! The first failing step short-circuits with its error. Input validation
//! errors and the errors raised by the `invalid_input` hook are returned
//! together. Every request yields exactly one [`Response`], including when a
//! handler panics.

use crate::auth::AuthEngine;
use crate::bus::InternalChannelEngine;
use crate::controller::envelope::{
    ControllerTarget, ReceiverEnvelope, RequestBody, RequestEnvelope, Response,
};
use crate::controller::registry::{ControllerRegistry, RegisteredController};
use crate::controller::RequestContext;
use crate::errors::{BackErrorBag, DehydrationPolicy, WorkerError};
use crate::observability::metrics;
use crate::token::ObjectPath;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Request pipeline settings taken from the worker config.
#[derive(Debug, Clone)]
pub struct ReqHandlerSettings {
    pub auth_controller: Option<String>,
    pub default_api_level: u32,
    pub validation_check_limit: usize,
    pub use_token_state_check: bool,
    pub dehydration: DehydrationPolicy,
}

#[derive(Debug, Clone)]
pub struct ControllerReqHandler {
    registry: Arc<ControllerRegistry>,
    channel: InternalChannelEngine,
    settings: ReqHandlerSettings,
}

impl ControllerReqHandler {
    #[must_use]
    pub fn new(
        registry: Arc<ControllerRegistry>,
        channel: InternalChannelEngine,
        settings: ReqHandlerSettings,
    ) -> Self {
        Self {
            registry,
            channel,
            settings,
        }
    }

    /// Run one request to its single response.
    #[instrument(skip_all, fields(sid = %engine.socket().sid()))]
    pub async fn handle_request(&self, engine: &AuthEngine, raw: Value) -> Response {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.process_request(engine, raw))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!(target: "worker.request", "Controller panicked");
                Err(BackErrorBag::from(WorkerError::Internal(
                    "controller panicked".to_string(),
                )))
            });

        let response = match outcome {
            Ok(result) => Response {
                errors: Vec::new(),
                result,
            },
            Err(errors) => {
                log_errors(&errors);
                Response {
                    errors: errors.dehydrate(self.settings.dehydration),
                    result: None,
                }
            }
        };

        let label = if response.is_ok() { "ok" } else { "error" };
        metrics::record_request(label, started.elapsed());
        response
    }

    /// Run one receiver package. Nothing is answered; failures are logged.
    #[instrument(skip_all, fields(sid = %engine.socket().sid()))]
    pub async fn handle_receiver(&self, engine: &AuthEngine, raw: Value) {
        let outcome = AssertUnwindSafe(self.process_receiver(engine, raw))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(BackErrorBag::from(WorkerError::Internal(
                    "receiver panicked".to_string(),
                )))
            });
        if let Err(errors) = outcome {
            log_errors(&errors);
        }
    }

    async fn process_request(
        &self,
        engine: &AuthEngine,
        raw: Value,
    ) -> Result<Option<Value>, BackErrorBag> {
        let envelope = RequestEnvelope::parse(&raw)?;

        let controller_id = match envelope.controller {
            ControllerTarget::Id(id) => id,
            ControllerTarget::AuthController => self
                .settings
                .auth_controller
                .clone()
                .ok_or(WorkerError::AuthControllerNotSet)?,
        };
        let api_level = self.api_level(engine, envelope.api_level);
        let registered = self.registry.get(&controller_id, api_level)?;
        debug!(target: "worker.request", controller = %controller_id, api_level, "Controller resolved");

        let ctx = self
            .authorize(engine, &registered, controller_id, api_level)
            .await?;

        match envelope.body {
            RequestBody::ValidationCheck(checks) => {
                self.run_checks(&registered, &checks).await?;
                Ok(None)
            }
            RequestBody::Data(input) => run_controller(&registered, &ctx, input).await.map(Some),
        }
    }

    async fn process_receiver(&self, engine: &AuthEngine, raw: Value) -> Result<(), BackErrorBag> {
        let envelope = ReceiverEnvelope::parse(&raw)?;
        let api_level = self.api_level(engine, envelope.api_level);
        let registered = self.registry.get_receiver(&envelope.receiver, api_level)?;
        let ctx = self
            .authorize(engine, &registered, envelope.receiver, api_level)
            .await?;
        run_controller(&registered, &ctx, envelope.input).await?;
        Ok(())
    }

    fn api_level(&self, engine: &AuthEngine, requested: Option<u32>) -> u32 {
        requested
            .or(engine.socket().handshake().api_level)
            .unwrap_or(self.settings.default_api_level)
    }

    /// System, version, token-state, protocol and controller access checks.
    async fn authorize(
        &self,
        engine: &AuthEngine,
        registered: &RegisteredController,
        controller_id: String,
        api_level: u32,
    ) -> Result<RequestContext, WorkerError> {
        let config = &registered.config;
        let handshake = engine.socket().handshake();
        config.client_access.check_system(&handshake.system)?;
        config
            .client_access
            .check_version(&handshake.system, handshake.version)?;

        if config
            .token_state_check
            .unwrap_or(self.settings.use_token_state_check)
        {
            engine.check_token_state().await?;
        }

        if !engine.has_server_protocol_access(&config.protocol_access) {
            return Err(WorkerError::NoProtocolAccess {
                protocol: engine.socket().protocol().as_str().to_string(),
            });
        }
        if !engine.has_access_to_controller(&config.access)? {
            return Err(WorkerError::NoControllerAccess {
                group: engine.group(),
            });
        }

        Ok(RequestContext {
            auth: engine.clone(),
            channel: self.channel.clone(),
            controller_id,
            api_level,
        })
    }

    async fn run_checks(
        &self,
        registered: &RegisteredController,
        checks: &[(ObjectPath, Value)],
    ) -> Result<(), BackErrorBag> {
        let limit = self.settings.validation_check_limit;
        if checks.len() > limit {
            return Err(WorkerError::ValidationCheckLimitReached {
                limit,
                checks_count: checks.len(),
            }
            .into());
        }

        let mut errors = BackErrorBag::new();
        for (path, value) in checks {
            if let Err(bag) = registered.config.input.check(path, value).await {
                errors.merge(bag);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

async fn run_controller(
    registered: &RegisteredController,
    ctx: &RequestContext,
    input: Value,
) -> Result<Value, BackErrorBag> {
    let consumed = match registered.config.input.consume(input.clone()).await {
        Ok(consumed) => consumed,
        Err(mut errors) => {
            if let Err(extra) = registered
                .controller
                .invalid_input(ctx, &input, &errors)
                .await
            {
                errors.merge(extra.into_bag());
            }
            return Err(errors);
        }
    };

    registered
        .controller
        .before_handle(ctx)
        .await
        .map_err(|e| e.into_bag())?;
    registered
        .controller
        .handle(ctx, consumed)
        .await
        .map_err(|e| e.into_bag())
}

fn log_errors(errors: &BackErrorBag) {
    for error in errors.iter() {
        if error.is_private() {
            warn!(target: "worker.request", error = %error, "Request failed with private error");
        } else {
            debug!(target: "worker.request", error = %error, "Request failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::{
        AccessConfig, AccessValue, AuthState, ClientAccessConfig, ProtocolAccessConfig,
    };
    use crate::bus::LocalBus;
    use crate::config::AuthConfig;
    use crate::controller::{Controller, ControllerConfig, InputValidator};
    use crate::errors::{BackError, ErrorType, HandlerError};
    use crate::socket::{HandshakeInfo, Protocol, Socket};
    use crate::token::{InMemoryTokenInfoStore, TokenServices};
    use async_trait::async_trait;
    use common::jwt::TokenSigner;
    use common::secret::SecretString;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl Controller for Echo {
        async fn handle(&self, _ctx: &RequestContext, input: Value) -> Result<Value, HandlerError> {
            Ok(input)
        }
    }

    struct Panicking;

    #[async_trait]
    impl Controller for Panicking {
        #[allow(clippy::panic)]
        async fn handle(&self, _ctx: &RequestContext, _input: Value) -> Result<Value, HandlerError> {
            panic!("boom");
        }
    }

    struct Failing;

    #[async_trait]
    impl Controller for Failing {
        async fn handle(&self, _ctx: &RequestContext, _input: Value) -> Result<Value, HandlerError> {
            Err(HandlerError::Unknown(anyhow::anyhow!("database down")))
        }
    }

    /// Rejects every input; its hook adds one more error.
    struct Strict {
        hook_calls: AtomicUsize,
    }

    #[async_trait]
    impl Controller for Strict {
        async fn handle(&self, _ctx: &RequestContext, _input: Value) -> Result<Value, HandlerError> {
            Ok(Value::Null)
        }

        async fn invalid_input(
            &self,
            _ctx: &RequestContext,
            _input: &Value,
            _errors: &BackErrorBag,
        ) -> Result<(), HandlerError> {
            self.hook_calls.fetch_add(1, Ordering::SeqCst);
            Err(BackError::new("hookError", ErrorType::Input).into())
        }
    }

    /// Counts how often it is handled.
    #[derive(Default)]
    struct Counting {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl Controller for Counting {
        async fn handle(&self, _ctx: &RequestContext, _input: Value) -> Result<Value, HandlerError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    struct RejectAll;

    #[async_trait]
    impl InputValidator for RejectAll {
        async fn consume(&self, _input: Value) -> Result<Value, BackErrorBag> {
            Err(BackError::new("valueMissing", ErrorType::Input).into())
        }

        async fn check(&self, path: &ObjectPath, _value: &Value) -> Result<(), BackErrorBag> {
            Err(BackError::new("badValue", ErrorType::Input)
                .with_info("path", path.to_string())
                .into())
        }
    }

    struct Harness {
        handler: ControllerReqHandler,
        services: Arc<TokenServices>,
        strict: Arc<Strict>,
        counting: Arc<Counting>,
    }

    fn harness_with(settings: ReqHandlerSettings) -> Harness {
        let strict = Arc::new(Strict {
            hook_calls: AtomicUsize::new(0),
        });
        let counting = Arc::new(Counting::default());
        let registry = ControllerRegistry::builder()
            .controller("echo", ControllerConfig::default(), Arc::new(Echo))
            .controller("panic", ControllerConfig::default(), Arc::new(Panicking))
            .controller("fail", ControllerConfig::default(), Arc::new(Failing))
            .controller(
                "strict",
                ControllerConfig::default().with_input(Arc::new(RejectAll)),
                Arc::clone(&strict) as Arc<dyn Controller>,
            )
            .controller(
                "admin",
                ControllerConfig::default().with_access(AccessConfig::access(AccessValue::AllAuth)),
                Arc::new(Echo),
            )
            .controller(
                "ios",
                ControllerConfig::default().with_client_access(ClientAccessConfig {
                    systems: Some(vec!["ios".to_string()]),
                    min_versions: HashMap::from([("ios".to_string(), 2.0)]),
                }),
                Arc::new(Echo),
            )
            .receiver("echo", ControllerConfig::default(), Arc::new(Echo))
            .receiver(
                "count",
                ControllerConfig::default(),
                Arc::clone(&counting) as Arc<dyn Controller>,
            )
            .receiver(
                "count-members",
                ControllerConfig::default().with_access(AccessConfig::access(AccessValue::AllAuth)),
                Arc::clone(&counting) as Arc<dyn Controller>,
            )
            .receiver(
                "count-http",
                ControllerConfig::default().with_protocol_access(ProtocolAccessConfig {
                    ws_access: Some(false),
                    http_access: Some(true),
                }),
                Arc::clone(&counting) as Arc<dyn Controller>,
            )
            .receiver(
                "count-strict",
                ControllerConfig::default().with_input(Arc::new(RejectAll)),
                Arc::clone(&counting) as Arc<dyn Controller>,
            )
            .build();
        let signer =
            TokenSigner::new(&SecretString::from("test-secret-that-is-long-enough-0001")).unwrap();
        let services = Arc::new(TokenServices::new(
            signer,
            Arc::new(InMemoryTokenInfoStore::new()),
            Arc::new(AuthConfig::new("guest", ["admin"])),
        ));
        Harness {
            handler: ControllerReqHandler::new(
                Arc::new(registry),
                InternalChannelEngine::new(Arc::new(LocalBus::new()), "worker-1"),
                settings,
            ),
            services,
            strict,
            counting,
        }
    }

    fn settings() -> ReqHandlerSettings {
        ReqHandlerSettings {
            auth_controller: None,
            default_api_level: 1,
            validation_check_limit: 2,
            use_token_state_check: false,
            dehydration: DehydrationPolicy::default(),
        }
    }

    async fn engine(h: &Harness, handshake: HandshakeInfo) -> AuthEngine {
        let initial = AuthState::default_for(h.services.auth_config());
        let (socket, _rx) = Socket::new(Protocol::WebSocket, handshake, initial);
        AuthEngine::init(Arc::new(socket), Arc::clone(&h.services), None)
            .await
            .unwrap()
    }

    fn names(response: &Response) -> Vec<&str> {
        response.errors.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_successful_request() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;

        let response = h
            .handler
            .handle_request(&engine, json!({"c": "echo", "d": {"x": 1}}))
            .await;

        assert_eq!(response.result, Some(json!({"x": 1})));
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_handler_still_responds_once() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;

        let response = h.handler.handle_request(&engine, json!({"c": "panic"})).await;

        assert_eq!(response.result, None);
        assert_eq!(response.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_error_is_private_outside_debug() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;

        let response = h.handler.handle_request(&engine, json!({"c": "fail"})).await;

        assert_eq!(names(&response), vec!["privateError"]);
        assert_eq!(response.errors.first().unwrap().description, None);
    }

    #[tokio::test]
    async fn test_invalid_input_collects_hook_errors() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;

        let response = h
            .handler
            .handle_request(&engine, json!({"c": "strict", "d": {}}))
            .await;

        assert_eq!(names(&response), vec!["valueMissing", "hookError"]);
        assert_eq!(h.strict.hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validation_check_only() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;

        let ok = h
            .handler
            .handle_request(&engine, json!({"c": "echo", "v": [["a", 1]]}))
            .await;
        assert_eq!(ok, Response::default());

        let failed = h
            .handler
            .handle_request(&engine, json!({"c": "strict", "v": [["a", 1], ["b", 2]]}))
            .await;
        assert_eq!(names(&failed), vec!["badValue", "badValue"]);
        assert_eq!(failed.result, None);
    }

    #[tokio::test]
    async fn test_validation_check_limit_fails_fast() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;

        let response = h
            .handler
            .handle_request(&engine, json!({"c": "strict", "v": [["a", 1], ["b", 2], ["c", 3]]}))
            .await;

        assert_eq!(names(&response), vec!["validationCheckLimitReached"]);
        assert_eq!(response.errors.first().unwrap().info.get("limit"), Some(&json!(2)));
        assert_eq!(response.errors.first().unwrap().info.get("checksCount"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_auth_controller_alias() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;
        let unset = h.handler.handle_request(&engine, json!({"c": 0})).await;
        assert_eq!(names(&unset), vec!["privateError"]);

        let mut with_auth = settings();
        with_auth.auth_controller = Some("echo".to_string());
        let h = harness_with(with_auth);
        let engine = self::engine(&h, HandshakeInfo::default()).await;
        let response = h
            .handler
            .handle_request(&engine, json!({"c": 0, "d": "login"}))
            .await;
        assert_eq!(response.result, Some(json!("login")));
    }

    #[tokio::test]
    async fn test_access_checks() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;

        let denied = h.handler.handle_request(&engine, json!({"c": "admin"})).await;
        assert_eq!(names(&denied), vec!["noAccessWithAuth"]);

        engine.auth_to("admin", None, None).await.unwrap();
        let allowed = h.handler.handle_request(&engine, json!({"c": "admin", "d": 1})).await;
        assert_eq!(allowed.result, Some(json!(1)));

        let missing = h.handler.handle_request(&engine, json!({"c": "nope"})).await;
        assert_eq!(names(&missing), vec!["controllerNotFound"]);
    }

    #[tokio::test]
    async fn test_client_system_and_version() {
        let h = harness_with(settings());
        let web = engine(&h, HandshakeInfo::default()).await;
        let old_ios = engine(
            &h,
            HandshakeInfo {
                system: "ios".to_string(),
                version: 1.5,
                api_level: None,
            },
        )
        .await;

        let response = h.handler.handle_request(&web, json!({"c": "ios"})).await;
        assert_eq!(names(&response), vec!["noAccessWithSystem"]);
        let response = h.handler.handle_request(&old_ios, json!({"c": "ios"})).await;
        assert_eq!(names(&response), vec!["noAccessWithVersion"]);
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;

        let response = h.handler.handle_request(&engine, json!([1, 2])).await;
        assert_eq!(names(&response), vec!["invalidRequest"]);
    }

    #[tokio::test]
    async fn test_receiver_runs_once() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;

        h.handler
            .handle_receiver(&engine, json!({"r": "count", "i": 1}))
            .await;

        assert_eq!(h.counting.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_receivers_never_run() {
        let h = harness_with(settings());
        let engine = engine(&h, HandshakeInfo::default()).await;

        for raw in [
            json!({"r": "count-members"}),
            json!({"r": "count-http"}),
            json!({"r": "count-strict", "i": {}}),
            json!({"r": "missing"}),
            json!({"i": 1}),
        ] {
            h.handler.handle_receiver(&engine, raw).await;
        }
        assert_eq!(h.counting.handled.load(Ordering::SeqCst), 0);

        engine.auth_to("admin", None, None).await.unwrap();
        h.handler
            .handle_receiver(&engine, json!({"r": "count-members"}))
            .await;
        assert_eq!(h.counting.handled.load(Ordering::SeqCst), 1);
    }
}
