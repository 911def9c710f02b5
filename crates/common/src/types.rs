//! Identifier types shared by the worker and its tooling.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a live socket (a connection held by one worker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(pub String);

impl SocketId {
    /// Create a new random socket ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SocketId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of one token issuance. A new one is minted every time a
/// connection authenticates from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    /// Create a new random token ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TokenId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Application-level user identifier carried in a token (`authId`).
///
/// Clients may use numbers or strings. Cluster-wide lookups compare the
/// [`AuthId::key`] form, so `42` and `"42"` address the same user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthId {
    Number(i64),
    Text(String),
}

impl AuthId {
    /// Canonical string form used for matching across workers.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            AuthId::Number(n) => n.to_string(),
            AuthId::Text(s) => s.clone(),
        }
    }

    /// Parse an auth id out of a JSON value (numbers or strings only).
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(AuthId::Number),
            serde_json::Value::String(s) => Some(AuthId::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for AuthId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthId::Number(n) => write!(f, "{n}"),
            AuthId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for AuthId {
    fn from(value: i64) -> Self {
        AuthId::Number(value)
    }
}

impl From<&str> for AuthId {
    fn from(value: &str) -> Self {
        AuthId::Text(value.to_string())
    }
}

impl From<String> for AuthId {
    fn from(value: String) -> Self {
        AuthId::Text(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_socket_ids_are_unique() {
        assert_ne!(SocketId::new(), SocketId::new());
    }

    #[test]
    fn test_auth_id_key_matches_across_representations() {
        assert_eq!(AuthId::from(42).key(), AuthId::from("42").key());
        assert_ne!(AuthId::from(42), AuthId::from("42"));
    }

    #[test]
    fn test_auth_id_untagged_serde() {
        let num: AuthId = serde_json::from_value(json!(7)).unwrap();
        let text: AuthId = serde_json::from_value(json!("alice")).unwrap();

        assert_eq!(num, AuthId::Number(7));
        assert_eq!(text, AuthId::Text("alice".to_string()));
        assert_eq!(serde_json::to_value(&num).unwrap(), json!(7));
    }

    #[test]
    fn test_auth_id_from_json_rejects_other_shapes() {
        assert!(AuthId::from_json(&json!(null)).is_none());
        assert!(AuthId::from_json(&json!({"id": 1})).is_none());
        assert!(AuthId::from_json(&json!(1.5)).is_none());
    }
}
