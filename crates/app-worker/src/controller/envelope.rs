//! Request, receiver and response envelopes.
//!
//! ```text
//! request:           {"c": "<controller>" | 0, "a"?: <api level>, "d"?: <input>}
//! validation check:  {"c": ..., "a"?: ..., "v": [[<path>, <value>], ...]}
//! receiver:          {"r": "<receiver>", "a"?: ..., "i"?: <input>}
//! response:          [<errors>] or [<errors>, <result>]
//! ```
//!
//! `c: 0` addresses the configured auth controller. A path is either a
//! dotted string or an array of segments.

use crate::errors::{DehydratedError, WorkerError};
use crate::token::ObjectPath;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Wire code of the auth controller alias.
pub const AUTH_CONTROLLER_CODE: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerTarget {
    Id(String),
    /// Resolved to the configured auth controller.
    AuthController,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Data(Value),
    ValidationCheck(Vec<(ObjectPath, Value)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub controller: ControllerTarget,
    pub api_level: Option<u32>,
    pub body: RequestBody,
}

impl RequestEnvelope {
    /// # Errors
    ///
    /// `InvalidRequest` describing the first structural problem.
    pub fn parse(raw: &Value) -> Result<Self, WorkerError> {
        let object = as_object(raw, "request")?;

        let controller = match object.get("c") {
            Some(Value::String(id)) if !id.is_empty() => ControllerTarget::Id(id.clone()),
            Some(Value::Number(n)) if n.as_u64() == Some(AUTH_CONTROLLER_CODE) => {
                ControllerTarget::AuthController
            }
            _ => return Err(invalid("c must be a controller id or the auth controller code")),
        };
        let api_level = parse_api_level(object)?;

        let body = match object.get("v") {
            Some(checks) => RequestBody::ValidationCheck(parse_checks(checks)?),
            None => RequestBody::Data(object.get("d").cloned().unwrap_or(Value::Null)),
        };

        Ok(Self {
            controller,
            api_level,
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverEnvelope {
    pub receiver: String,
    pub api_level: Option<u32>,
    pub input: Value,
}

impl ReceiverEnvelope {
    /// # Errors
    ///
    /// `InvalidRequest` describing the first structural problem.
    pub fn parse(raw: &Value) -> Result<Self, WorkerError> {
        let object = as_object(raw, "receiver package")?;
        let receiver = match object.get("r") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => return Err(invalid("r must be a receiver id")),
        };
        Ok(Self {
            receiver,
            api_level: parse_api_level(object)?,
            input: object.get("i").cloned().unwrap_or(Value::Null),
        })
    }
}

/// The single answer to a request.
///
/// Serializes as `[errors]` or `[errors, result]`. A passed validation check
/// carries neither and has no body at all.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    pub errors: Vec<DehydratedError>,
    pub result: Option<Value>,
}

impl Response {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// True for a passed validation check.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.result.is_none()
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_empty() {
            return serializer.serialize_unit();
        }
        let len = if self.result.is_some() { 2 } else { 1 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.errors)?;
        if let Some(result) = &self.result {
            seq.serialize_element(result)?;
        }
        seq.end()
    }
}

fn as_object<'a>(raw: &'a Value, what: &str) -> Result<&'a Map<String, Value>, WorkerError> {
    raw.as_object()
        .ok_or_else(|| invalid(&format!("{what} must be an object")))
}

fn parse_api_level(object: &Map<String, Value>) -> Result<Option<u32>, WorkerError> {
    match object.get("a") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid("a must be a non-negative integer")),
    }
}

fn parse_checks(raw: &Value) -> Result<Vec<(ObjectPath, Value)>, WorkerError> {
    let Value::Array(items) = raw else {
        return Err(invalid("v must be an array of [path, value] pairs"));
    };
    items
        .iter()
        .map(|item| match item.as_array().map(Vec::as_slice) {
            Some([path, value]) => Ok((parse_path(path)?, value.clone())),
            _ => Err(invalid("each check must be a [path, value] pair")),
        })
        .collect()
}

fn parse_path(raw: &Value) -> Result<ObjectPath, WorkerError> {
    match raw {
        Value::String(path) => Ok(ObjectPath::parse(path)),
        Value::Array(segments) => segments
            .iter()
            .map(|s| s.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .map(ObjectPath::from_segments)
            .ok_or_else(|| invalid("path segments must be strings")),
        _ => Err(invalid("path must be a string or an array of strings")),
    }
}

fn invalid(message: &str) -> WorkerError {
    WorkerError::InvalidRequest(message.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_standard_request() {
        let envelope = RequestEnvelope::parse(&json!({"c": "chat", "a": 2, "d": {"m": 1}})).unwrap();
        assert_eq!(envelope.controller, ControllerTarget::Id("chat".to_string()));
        assert_eq!(envelope.api_level, Some(2));
        assert_eq!(envelope.body, RequestBody::Data(json!({"m": 1})));
    }

    #[test]
    fn test_parse_auth_controller_alias() {
        let envelope = RequestEnvelope::parse(&json!({"c": 0})).unwrap();
        assert_eq!(envelope.controller, ControllerTarget::AuthController);
        assert_eq!(envelope.body, RequestBody::Data(Value::Null));
    }

    #[test]
    fn test_parse_validation_check() {
        let envelope =
            RequestEnvelope::parse(&json!({"c": "signup", "v": [["user.name", "x"], [["age"], 3]]}))
                .unwrap();
        assert_eq!(
            envelope.body,
            RequestBody::ValidationCheck(vec![
                (ObjectPath::parse("user.name"), json!("x")),
                (ObjectPath::from_segments(["age"]), json!(3)),
            ])
        );
    }

    #[test]
    fn test_structural_errors() {
        for raw in [
            json!("chat"),
            json!({}),
            json!({"c": ""}),
            json!({"c": 5}),
            json!({"c": "x", "a": -1}),
            json!({"c": "x", "v": {}}),
            json!({"c": "x", "v": [["p"]]}),
            json!({"c": "x", "v": [[1, 2]]}),
        ] {
            assert!(
                matches!(RequestEnvelope::parse(&raw), Err(WorkerError::InvalidRequest(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_receiver() {
        let envelope = ReceiverEnvelope::parse(&json!({"r": "typing", "i": true})).unwrap();
        assert_eq!(envelope.receiver, "typing");
        assert_eq!(envelope.input, json!(true));
        assert!(ReceiverEnvelope::parse(&json!({"i": 1})).is_err());
    }

    #[test]
    fn test_response_shapes() {
        let ok = Response {
            errors: Vec::new(),
            result: Some(json!({"x": 1})),
        };
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!([[], {"x": 1}]));

        let check_only = Response::default();
        assert!(check_only.is_empty());
        assert_eq!(serde_json::to_value(&check_only).unwrap(), Value::Null);
    }
}
