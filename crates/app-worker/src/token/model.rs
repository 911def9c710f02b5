//! Token payload.

use crate::errors::WorkerError;
use crate::token::edit::ObjectPath;
use common::types::{AuthId, TokenId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys only the identity path may write.
pub const RESERVED_KEYS: [&str; 4] = ["authGroup", "authId", "tokenId", "expire"];

#[must_use]
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Fail with `ReservedKeyConflict` on the first reserved key in `data`.
///
/// # Errors
///
/// `ReservedKeyConflict` naming the offending key.
pub fn check_reserved_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Result<(), WorkerError> {
    match keys.into_iter().find(|key| is_reserved_key(key)) {
        Some(key) => Err(WorkerError::ReservedKeyConflict {
            key: key.to_string(),
        }),
        None => Ok(()),
    }
}

/// The client-held credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    #[serde(rename = "tokenId")]
    pub token_id: TokenId,

    #[serde(rename = "authGroup", default, skip_serializing_if = "Option::is_none")]
    pub auth_group: Option<String>,

    #[serde(rename = "authId", default, skip_serializing_if = "Option::is_none")]
    pub auth_id: Option<AuthId>,

    /// Unix seconds.
    pub expire: i64,

    /// Application variables.
    #[serde(flatten)]
    pub custom: Map<String, Value>,
}

impl Token {
    #[must_use]
    pub fn new(token_id: TokenId, expire: i64) -> Self {
        Self {
            token_id,
            auth_group: None,
            auth_id: None,
            expire,
            custom: Map::new(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expire <= now
    }

    /// Read a variable. Reserved keys are readable like any other key.
    #[must_use]
    pub fn get(&self, path: &ObjectPath) -> Option<Value> {
        let (root, rest) = path.segments().split_first()?;
        let value = match root.as_str() {
            "tokenId" => Value::from(self.token_id.as_str()),
            "authGroup" => Value::from(self.auth_group.clone()?),
            "authId" => serde_json::to_value(self.auth_id.as_ref()?).ok()?,
            "expire" => Value::from(self.expire),
            _ => return path.get(&self.custom).cloned(),
        };
        if rest.is_empty() {
            Some(value)
        } else {
            None
        }
    }

    /// Whether the token's user matches `auth_id` by key.
    #[must_use]
    pub fn belongs_to(&self, auth_id: &AuthId) -> bool {
        self.auth_id
            .as_ref()
            .is_some_and(|own| own.key() == auth_id.key())
    }
}

/// Identity-path write. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityUpdate {
    pub auth_group: Option<String>,
    pub auth_id: Option<AuthId>,
    pub expire: Option<i64>,
}

impl IdentityUpdate {
    #[must_use]
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            auth_group: Some(group.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_auth_id(mut self, auth_id: Option<AuthId>) -> Self {
        self.auth_id = auth_id;
        self
    }

    /// Split reserved keys out of a raw variable map.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if a reserved key holds a value of the wrong type.
    /// `tokenId` cannot be written and is rejected with `ReservedKeyConflict`.
    pub fn extract(data: &mut Map<String, Value>) -> Result<Self, WorkerError> {
        if data.contains_key("tokenId") {
            return Err(WorkerError::ReservedKeyConflict {
                key: "tokenId".to_string(),
            });
        }

        let auth_group = match data.remove("authGroup") {
            None => None,
            Some(Value::String(group)) => Some(group),
            Some(_) => {
                return Err(WorkerError::InvalidRequest(
                    "authGroup must be a string".to_string(),
                ))
            }
        };
        let auth_id = match data.remove("authId") {
            None => None,
            Some(value) => Some(AuthId::from_json(&value).ok_or_else(|| {
                WorkerError::InvalidRequest("authId must be a string or an integer".to_string())
            })?),
        };
        let expire = match data.remove("expire") {
            None => None,
            Some(value) => Some(value.as_i64().ok_or_else(|| {
                WorkerError::InvalidRequest("expire must be an integer".to_string())
            })?),
        };

        Ok(Self {
            auth_group,
            auth_id,
            expire,
        })
    }

    pub fn apply_to(&self, token: &mut Token) {
        if let Some(group) = &self.auth_group {
            token.auth_group = Some(group.clone());
        }
        if let Some(auth_id) = &self.auth_id {
            token.auth_id = Some(auth_id.clone());
        }
        if let Some(expire) = self.expire {
            token.expire = expire;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.auth_group.is_none() && self.auth_id.is_none() && self.expire.is_none()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_claims_shape() {
        let mut token = Token::new(TokenId::from("t-1"), 100);
        token.auth_group = Some("admin".to_string());
        token.auth_id = Some(AuthId::from(42));
        token.custom.insert("nick".to_string(), json!("x"));

        let value = serde_json::to_value(&token).unwrap();
        assert_eq!(
            value,
            json!({"tokenId": "t-1", "authGroup": "admin", "authId": 42, "expire": 100, "nick": "x"})
        );

        let decoded: Token = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn test_reserved_key_check() {
        assert!(check_reserved_keys(["nick", "level"]).is_ok());
        for key in RESERVED_KEYS {
            assert_eq!(
                check_reserved_keys(["nick", key]),
                Err(WorkerError::ReservedKeyConflict {
                    key: key.to_string()
                })
            );
        }
    }

    #[test]
    fn test_get_reads_reserved_and_custom_keys() {
        let mut token = Token::new(TokenId::from("t-1"), 100);
        token.auth_id = Some(AuthId::from("alice"));
        token
            .custom
            .insert("profile".to_string(), json!({"nick": "x"}));

        assert_eq!(token.get(&ObjectPath::parse("tokenId")), Some(json!("t-1")));
        assert_eq!(token.get(&ObjectPath::parse("authId")), Some(json!("alice")));
        assert_eq!(token.get(&ObjectPath::parse("authGroup")), None);
        assert_eq!(
            token.get(&ObjectPath::parse("profile.nick")),
            Some(json!("x"))
        );
    }

    #[test]
    fn test_belongs_to_matches_by_key() {
        let mut token = Token::new(TokenId::new(), 0);
        assert!(!token.belongs_to(&AuthId::from(42)));

        token.auth_id = Some(AuthId::from("42"));
        assert!(token.belongs_to(&AuthId::from(42)));
    }

    #[test]
    fn test_identity_extract() {
        let mut data = json!({"authGroup": "admin", "authId": 7, "nick": "x"})
            .as_object()
            .cloned()
            .unwrap();

        let identity = IdentityUpdate::extract(&mut data).unwrap();

        assert_eq!(identity.auth_group.as_deref(), Some("admin"));
        assert_eq!(identity.auth_id, Some(AuthId::from(7)));
        assert_eq!(data.keys().collect::<Vec<_>>(), vec!["nick"]);
    }

    #[test]
    fn test_identity_extract_rejects_bad_types_and_token_id() {
        let mut bad_group = json!({"authGroup": 1}).as_object().cloned().unwrap();
        assert!(matches!(
            IdentityUpdate::extract(&mut bad_group),
            Err(WorkerError::InvalidRequest(_))
        ));

        let mut token_id = json!({"tokenId": "x"}).as_object().cloned().unwrap();
        assert!(matches!(
            IdentityUpdate::extract(&mut token_id),
            Err(WorkerError::ReservedKeyConflict { .. })
        ));
    }
}
