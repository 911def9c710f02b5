//! JSON frames exchanged over a WebSocket.
//!
//! ```text
//! client -> {"cid": n, "req": <request envelope>}
//!           {"fid": n, "fetch": {"d": <databox>, "i"?: <input>}}
//!           {"rec": <receiver envelope>}
//! server -> {"rid": n, "res": [errors, result?]}
//!           {"fid": n, "res": [errors, result?]}
//!           {"event": "token" | "emit" | "kicked" | "disconnect", "data": ...}
//! ```

use crate::controller::Response;
use crate::socket::ClientEvent;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Request { cid: u64, req: Value },
    Fetch { fid: u64, fetch: Value },
    Receiver { rec: Value },
}

impl ClientFrame {
    /// # Errors
    ///
    /// Returns the JSON error when `text` is not one of the client frames.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Call id of a frame that failed to parse, so the client still gets an
/// answer for it.
#[must_use]
pub fn salvage_call_id(text: &str) -> Option<u64> {
    serde_json::from_str::<Value>(text)
        .ok()?
        .get("cid")
        .and_then(Value::as_u64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Response {
        rid: u64,
        #[serde(skip_serializing_if = "Response::is_empty")]
        res: Response,
    },
    FetchResponse {
        fid: u64,
        res: Response,
    },
    Event { event: &'static str, data: Value },
}

impl ServerFrame {
    /// # Errors
    ///
    /// Serialization errors from `serde_json`.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ClientEvent> for ServerFrame {
    fn from(event: ClientEvent) -> Self {
        match event {
            ClientEvent::TokenChanged(signed) => ServerFrame::Event {
                event: "token",
                data: signed.map_or(Value::Null, Value::String),
            },
            ClientEvent::Emit { event, data } => ServerFrame::Event {
                event: "emit",
                data: json!({"event": event, "data": data}),
            },
            ClientEvent::Kicked { channel } => ServerFrame::Event {
                event: "kicked",
                data: json!({"channel": channel}),
            },
            ClientEvent::Disconnect { reason } => ServerFrame::Event {
                event: "disconnect",
                data: json!({"reason": reason}),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_frames() {
        assert_eq!(
            ClientFrame::parse(r#"{"cid": 3, "req": {"c": "ping"}}"#).unwrap(),
            ClientFrame::Request {
                cid: 3,
                req: json!({"c": "ping"})
            }
        );
        assert_eq!(
            ClientFrame::parse(r#"{"fid": 1, "fetch": {"d": "feed"}}"#).unwrap(),
            ClientFrame::Fetch {
                fid: 1,
                fetch: json!({"d": "feed"})
            }
        );
        assert_eq!(
            ClientFrame::parse(r#"{"rec": {"r": "typing"}}"#).unwrap(),
            ClientFrame::Receiver {
                rec: json!({"r": "typing"})
            }
        );
        assert!(ClientFrame::parse(r#"{"cid": "x", "req": {}}"#).is_err());
        assert!(ClientFrame::parse("[]").is_err());
    }

    #[test]
    fn test_salvage_call_id() {
        assert_eq!(salvage_call_id(r#"{"cid": 9}"#), Some(9));
        assert_eq!(salvage_call_id(r#"{"rec": 1}"#), None);
        assert_eq!(salvage_call_id("not json"), None);
    }

    #[test]
    fn test_encode_server_frames() {
        let response = ServerFrame::Response {
            rid: 4,
            res: Response {
                errors: Vec::new(),
                result: Some(json!("pong")),
            },
        };
        assert_eq!(
            serde_json::from_str::<Value>(&response.encode().unwrap()).unwrap(),
            json!({"rid": 4, "res": [[], "pong"]})
        );

        let checked = ServerFrame::Response {
            rid: 5,
            res: Response::default(),
        };
        assert_eq!(
            serde_json::from_str::<Value>(&checked.encode().unwrap()).unwrap(),
            json!({"rid": 5})
        );

        let removed = ServerFrame::from(ClientEvent::TokenChanged(None));
        assert_eq!(
            serde_json::from_str::<Value>(&removed.encode().unwrap()).unwrap(),
            json!({"event": "token", "data": null})
        );

        let kicked = ServerFrame::from(ClientEvent::Kicked {
            channel: "#user.42".to_string(),
        });
        assert_eq!(
            serde_json::from_str::<Value>(&kicked.encode().unwrap()).unwrap(),
            json!({"event": "kicked", "data": {"channel": "#user.42"}})
        );
    }
}
