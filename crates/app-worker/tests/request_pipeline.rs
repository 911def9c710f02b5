//! Integration tests for the request pipeline through the worker and the
//! HTTP transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;

use app_worker::auth::{AccessConfig, AccessValue};
use app_worker::controller::{ControllerConfig, ControllerRegistry, RequestContext};
use app_worker::databox::{Databox, DataboxConfig, DataboxRegistry};
use app_worker::errors::HandlerError;
use app_worker::socket::{HandshakeInfo, Protocol};
use app_worker::token::InMemoryTokenInfoStore;
use app_worker::transport::transport_router;
use app_worker::worker::{Worker, WorkerApp};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use worker_test_utils::{
    EchoController, FailingController, PanickingController, RecordingBus, TestConfigBuilder,
    TestTokenBuilder,
};

struct Upper;

#[async_trait]
impl Databox for Upper {
    async fn fetch(&self, _ctx: &RequestContext, input: Value) -> Result<Value, HandlerError> {
        Ok(json!(input.as_str().unwrap_or_default().to_uppercase()))
    }
}

async fn start(echo: Arc<EchoController>, cancel: &CancellationToken) -> Arc<Worker> {
    let app = WorkerApp {
        controllers: ControllerRegistry::builder()
            .controller("echo", ControllerConfig::default(), echo)
            .controller(
                "members",
                ControllerConfig::default().with_access(AccessConfig::access(AccessValue::AllAuth)),
                EchoController::new(),
            )
            .controller("fail", ControllerConfig::default(), FailingController::new("outOfStock"))
            .controller("boom", ControllerConfig::default(), Arc::new(PanickingController))
            .build(),
        databoxes: DataboxRegistry::new().databox("upper", DataboxConfig::default(), Arc::new(Upper)),
    };
    Worker::start(
        &TestConfigBuilder::new().build(),
        app,
        Arc::new(RecordingBus::new()),
        Arc::new(InMemoryTokenInfoStore::new()),
        cancel.child_token(),
    )
    .await
    .unwrap()
}

fn error_names(errors: &[app_worker::errors::DehydratedError]) -> Vec<&str> {
    errors.iter().map(|e| e.name.as_str()).collect()
}

#[tokio::test]
async fn test_each_request_gets_exactly_one_response() {
    let cancel = CancellationToken::new();
    let echo = EchoController::new();
    let worker = start(Arc::clone(&echo), &cancel).await;
    let connection = worker
        .connect(Protocol::WebSocket, HandshakeInfo::default(), None)
        .await
        .unwrap();
    let engine = &connection.engine;

    let ok = worker.handle_request(engine, json!({"c": "echo", "d": {"n": 1}})).await;
    assert_eq!(ok.result, Some(json!({"n": 1})));

    let failed = worker.handle_request(engine, json!({"c": "fail"})).await;
    assert_eq!(error_names(&failed.errors), vec!["outOfStock"]);
    assert_eq!(failed.result, None);

    // A panicking handler still answers, with a redacted error.
    let panicked = worker.handle_request(engine, json!({"c": "boom"})).await;
    assert_eq!(error_names(&panicked.errors), vec!["privateError"]);

    let denied = worker.handle_request(engine, json!({"c": "members"})).await;
    assert_eq!(error_names(&denied.errors), vec!["noAccessWithAuth"]);

    let missing = worker.handle_request(engine, json!({"c": "nope"})).await;
    assert_eq!(error_names(&missing.errors), vec!["controllerNotFound"]);

    assert_eq!(echo.calls(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn test_fetch_through_worker() {
    let cancel = CancellationToken::new();
    let worker = start(EchoController::new(), &cancel).await;
    let connection = worker
        .connect(Protocol::WebSocket, HandshakeInfo::default(), None)
        .await
        .unwrap();

    let response = worker
        .fetch(&connection.engine, json!({"d": "upper", "i": "abc"}))
        .await;
    assert_eq!(response.result, Some(json!("ABC")));

    worker.disconnect(connection.engine.socket().sid());
    assert!(worker.registry().is_empty());
    assert!(connection.engine.socket().is_closed());
    cancel.cancel();
}

#[tokio::test]
async fn test_http_request_endpoint() {
    let cancel = CancellationToken::new();
    let worker = start(EchoController::new(), &cancel).await;
    let app = transport_router(Arc::clone(&worker));

    let signed = TestTokenBuilder::new().in_group("user").sign();
    let request = Request::builder()
        .method("POST")
        .uri(format!("/request?token={signed}&system=cli&version=1.5"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"c": "members", "d": "hi"}).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["res"], json!([[], "hi"]));
    assert_eq!(body["token"], json!(signed));

    // HTTP sockets live for one request only.
    assert!(worker.registry().is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn test_http_rejects_bad_handshake_token() {
    let cancel = CancellationToken::new();
    let worker = start(EchoController::new(), &cancel).await;
    let app = transport_router(worker);

    let request = Request::builder()
        .method("POST")
        .uri("/request?token=not-a-token")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"c": "echo"}).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["errors"][0]["n"], json!("privateError"));
    cancel.cancel();
}
