//! Client-facing transport.
//!
//! - `GET /ws?token=&system=&version=&apiLevel=` upgrades to a WebSocket
//!   speaking the frames in [`frames`]
//! - `POST /request` with the same query runs one request envelope over
//!   HTTP and answers `{"res": [errors, result?], "token": signed | null}`
//!
//! A handshake the worker rejects answers 401 with `{"errors": [...]}`
//! before any upgrade.

pub mod frames;
pub mod ws;

use crate::controller::Response as ControllerResponse;
use crate::errors::{DehydratedError, WorkerError};
use crate::socket::{HandshakeInfo, Protocol};
use crate::worker::Worker;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument};

/// Query parameters of both endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub token: Option<String>,
    pub system: Option<String>,
    pub version: Option<f64>,
    pub api_level: Option<u32>,
}

impl ConnectParams {
    #[must_use]
    pub fn handshake(&self) -> HandshakeInfo {
        let defaults = HandshakeInfo::default();
        HandshakeInfo {
            system: self.system.clone().unwrap_or(defaults.system),
            version: self.version.unwrap_or(defaults.version),
            api_level: self.api_level,
        }
    }
}

#[derive(Debug, Serialize)]
struct HttpReply {
    #[serde(skip_serializing_if = "ControllerResponse::is_empty")]
    res: ControllerResponse,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct Rejection {
    errors: Vec<DehydratedError>,
}

/// Router serving the WebSocket and HTTP endpoints.
pub fn transport_router(worker: Arc<Worker>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/request", post(http_request_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(worker)
}

#[instrument(skip_all)]
async fn ws_handler(
    upgrade: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(worker): State<Arc<Worker>>,
) -> HttpResponse {
    let connection = match worker
        .connect(Protocol::WebSocket, params.handshake(), params.token.as_deref())
        .await
    {
        Ok(connection) => connection,
        Err(e) => return reject(&worker, e),
    };

    let sid = connection.engine.socket().sid().clone();
    let on_failure = {
        let worker = Arc::clone(&worker);
        move |e: axum::Error| {
            debug!(target: "worker.transport", sid = %sid, error = %e, "WebSocket upgrade failed");
            worker.disconnect(&sid);
        }
    };
    upgrade
        .on_failed_upgrade(on_failure)
        .on_upgrade(move |socket| ws::serve_socket(socket, worker, connection))
}

#[instrument(skip_all)]
async fn http_request_handler(
    Query(params): Query<ConnectParams>,
    State(worker): State<Arc<Worker>>,
    Json(request): Json<Value>,
) -> HttpResponse {
    let connection = match worker
        .connect(Protocol::Http, params.handshake(), params.token.as_deref())
        .await
    {
        Ok(connection) => connection,
        Err(e) => return reject(&worker, e),
    };

    let engine = connection.engine;
    let response = worker.handle_request(&engine, request).await;
    let token = engine.socket().signed_token();
    worker.disconnect(engine.socket().sid());

    Json(HttpReply {
        res: response,
        token,
    })
    .into_response()
}

fn reject(worker: &Worker, err: WorkerError) -> HttpResponse {
    debug!(target: "worker.transport", error = %err, "Connection rejected");
    let body = Rejection {
        errors: worker.dehydrate(err),
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_defaults() {
        let handshake = ConnectParams::default().handshake();
        assert_eq!(handshake, HandshakeInfo::default());

        let params = ConnectParams {
            token: None,
            system: Some("web".to_string()),
            version: Some(2.5),
            api_level: Some(3),
        };
        let handshake = params.handshake();
        assert_eq!(handshake.system, "web");
        assert!((handshake.version - 2.5).abs() < f64::EPSILON);
        assert_eq!(handshake.api_level, Some(3));
    }

    #[test]
    fn test_query_uses_camel_case() {
        let params: ConnectParams =
            serde_json::from_value(json!({"token": "t", "apiLevel": 2})).unwrap();
        assert_eq!(params.token.as_deref(), Some("t"));
        assert_eq!(params.api_level, Some(2));
    }
}
