//! Cluster bus payloads.
//!
//! Wire shapes (JSON):
//!
//! ```text
//! map task:     {"pid", "origin", "taskType": 0, "action", "target", "ids", "exceptSocketSids", "data"}
//! special task: {"pid", "origin", "taskType": 1, "action", "data"}
//!   token updates carry data = {"operations", "target", "exceptSocketSids"}
//! ```
//!
//! Actions and targets are small integers. `pid` identifies one publish so
//! receivers can drop redeliveries; `origin` is the publishing worker's id.

use crate::token::ObjectEditAction;
use common::types::{AuthId, SocketId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[must_use]
            pub const fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            #[must_use]
            pub const fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum!(
    /// Sockets a map task applies to.
    MapTaskTarget {
        UserIds = 0,
        TokenIds = 1,
        AllSockets = 2,
        SocketSids = 3,
        AuthUserGroups = 4,
        DefaultUserGroup = 5,
    }
);

wire_enum!(
    /// What a map task does to each selected socket.
    MapTaskAction {
        Disconnect = 0,
        Deauthenticate = 1,
        KickOut = 2,
        Emit = 3,
    }
);

wire_enum!(
    SpecialTaskAction {
        UpdateUserTokens = 0,
        UpdateGroupTokens = 1,
        Message = 2,
    }
);

const TASK_TYPE_MAP: u8 = 0;
const TASK_TYPE_SPECIAL: u8 = 1;

/// Fleet-wide action on a set of sockets.
#[derive(Debug, Clone, PartialEq)]
pub struct MapTask {
    pub target: MapTaskTarget,
    pub action: MapTaskAction,
    /// User ids, token ids, socket ids or group names depending on `target`.
    pub ids: Vec<Value>,
    pub except_socket_sids: Vec<SocketId>,
    pub data: Value,
}

/// Edit sequence for every live token of a user or group.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenUpdate<T> {
    pub operations: Vec<ObjectEditAction>,
    pub target: T,
    pub except_socket_sids: Vec<SocketId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpecialTask {
    UpdateUserTokens(TokenUpdate<AuthId>),
    UpdateGroupTokens(TokenUpdate<String>),
    /// Application message re-broadcast to every worker.
    Message(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerTask {
    Map(MapTask),
    Special(SpecialTask),
}

impl WorkerTask {
    /// Bounded label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            WorkerTask::Map(_) => "map_task",
            WorkerTask::Special(_) => "special_task",
        }
    }
}

/// One publish on the worker channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WirePackage", into = "WirePackage")]
pub struct WorkerTaskPackage {
    pub pid: Uuid,
    pub origin: String,
    pub task: WorkerTask,
}

impl WorkerTaskPackage {
    #[must_use]
    pub fn new(origin: impl Into<String>, task: WorkerTask) -> Self {
        Self {
            pid: Uuid::new_v4(),
            origin: origin.into(),
            task,
        }
    }
}

/// One publish on the monitor channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorPackage {
    pub origin: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePackage {
    pid: Uuid,
    origin: String,
    task_type: u8,
    action: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ids: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    except_socket_sids: Option<Vec<SocketId>>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTokenUpdate {
    operations: Vec<ObjectEditAction>,
    target: Value,
    #[serde(default)]
    except_socket_sids: Vec<SocketId>,
}

impl TryFrom<WirePackage> for WorkerTaskPackage {
    type Error = String;

    fn try_from(wire: WirePackage) -> Result<Self, Self::Error> {
        let task = match wire.task_type {
            TASK_TYPE_MAP => {
                let action = MapTaskAction::from_code(wire.action)
                    .ok_or_else(|| format!("unknown map task action {}", wire.action))?;
                let target_code = wire
                    .target
                    .ok_or_else(|| "map task without target".to_string())?;
                let target = MapTaskTarget::from_code(target_code)
                    .ok_or_else(|| format!("unknown map task target {target_code}"))?;
                WorkerTask::Map(MapTask {
                    target,
                    action,
                    ids: wire.ids.unwrap_or_default(),
                    except_socket_sids: wire.except_socket_sids.unwrap_or_default(),
                    data: wire.data,
                })
            }
            TASK_TYPE_SPECIAL => {
                let action = SpecialTaskAction::from_code(wire.action)
                    .ok_or_else(|| format!("unknown special task action {}", wire.action))?;
                WorkerTask::Special(match action {
                    SpecialTaskAction::Message => SpecialTask::Message(wire.data),
                    SpecialTaskAction::UpdateUserTokens => {
                        let update = token_update(wire.data)?;
                        let target = AuthId::from_json(&update.target)
                            .ok_or_else(|| "user token update needs a user id".to_string())?;
                        SpecialTask::UpdateUserTokens(TokenUpdate {
                            operations: update.operations,
                            target,
                            except_socket_sids: update.except_socket_sids,
                        })
                    }
                    SpecialTaskAction::UpdateGroupTokens => {
                        let update = token_update(wire.data)?;
                        let Value::String(target) = update.target else {
                            return Err("group token update needs a group name".to_string());
                        };
                        SpecialTask::UpdateGroupTokens(TokenUpdate {
                            operations: update.operations,
                            target,
                            except_socket_sids: update.except_socket_sids,
                        })
                    }
                })
            }
            other => return Err(format!("unknown task type {other}")),
        };

        Ok(Self {
            pid: wire.pid,
            origin: wire.origin,
            task,
        })
    }
}

fn token_update(data: Value) -> Result<WireTokenUpdate, String> {
    serde_json::from_value(data).map_err(|e| format!("invalid token update: {e}"))
}

impl From<WorkerTaskPackage> for WirePackage {
    fn from(package: WorkerTaskPackage) -> Self {
        let WorkerTaskPackage { pid, origin, task } = package;
        match task {
            WorkerTask::Map(map) => WirePackage {
                pid,
                origin,
                task_type: TASK_TYPE_MAP,
                action: map.action.code(),
                target: Some(map.target.code()),
                ids: Some(map.ids),
                except_socket_sids: Some(map.except_socket_sids),
                data: map.data,
            },
            WorkerTask::Special(special) => {
                let (action, data) = match special {
                    SpecialTask::Message(data) => (SpecialTaskAction::Message, data),
                    SpecialTask::UpdateUserTokens(update) => (
                        SpecialTaskAction::UpdateUserTokens,
                        wire_token_update(
                            update.operations,
                            serde_json::to_value(&update.target).unwrap_or(Value::Null),
                            update.except_socket_sids,
                        ),
                    ),
                    SpecialTask::UpdateGroupTokens(update) => (
                        SpecialTaskAction::UpdateGroupTokens,
                        wire_token_update(
                            update.operations,
                            Value::String(update.target),
                            update.except_socket_sids,
                        ),
                    ),
                };
                WirePackage {
                    pid,
                    origin,
                    task_type: TASK_TYPE_SPECIAL,
                    action: action.code(),
                    target: None,
                    ids: None,
                    except_socket_sids: None,
                    data,
                }
            }
        }
    }
}

fn wire_token_update(
    operations: Vec<ObjectEditAction>,
    target: Value,
    except_socket_sids: Vec<SocketId>,
) -> Value {
    serde_json::json!({
        "operations": operations,
        "target": target,
        "exceptSocketSids": except_socket_sids,
    })
}

/// Canonical string form of a target id (numbers and strings compare equal).
#[must_use]
pub fn id_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_task_wire_shape() {
        let package = WorkerTaskPackage::new(
            "worker-1",
            WorkerTask::Map(MapTask {
                target: MapTaskTarget::UserIds,
                action: MapTaskAction::Emit,
                ids: vec![json!(42)],
                except_socket_sids: vec![SocketId::from("sidA")],
                data: json!({"event": "news", "data": 1}),
            }),
        );

        let value = serde_json::to_value(&package).unwrap();
        assert_eq!(value["taskType"], 0);
        assert_eq!(value["action"], 3);
        assert_eq!(value["target"], 0);
        assert_eq!(value["ids"], json!([42]));
        assert_eq!(value["exceptSocketSids"], json!(["sidA"]));
        assert_eq!(value["origin"], "worker-1");

        let decoded: WorkerTaskPackage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, package);
    }

    #[test]
    fn test_user_token_update_wire_shape() {
        let package = WorkerTaskPackage::new(
            "worker-1",
            WorkerTask::Special(SpecialTask::UpdateUserTokens(TokenUpdate {
                operations: vec![ObjectEditAction::set("nick", "y")],
                target: AuthId::from(42),
                except_socket_sids: vec![SocketId::from("sidA")],
            })),
        );

        let value = serde_json::to_value(&package).unwrap();
        assert_eq!(value["taskType"], 1);
        assert_eq!(value["action"], 0);
        assert_eq!(
            value["data"],
            json!({"operations": [[0, "nick", "y"]], "target": 42, "exceptSocketSids": ["sidA"]})
        );
        assert!(value.get("target").is_none());

        let decoded: WorkerTaskPackage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, package);
    }

    #[test]
    fn test_decode_rejects_unknown_codes() {
        let pid = Uuid::new_v4();
        for raw in [
            json!({"pid": pid, "origin": "w", "taskType": 9, "action": 0}),
            json!({"pid": pid, "origin": "w", "taskType": 0, "action": 9, "target": 0}),
            json!({"pid": pid, "origin": "w", "taskType": 0, "action": 0}),
            json!({"pid": pid, "origin": "w", "taskType": 1, "action": 1, "data": {"operations": [], "target": 5}}),
        ] {
            assert!(
                serde_json::from_value::<WorkerTaskPackage>(raw.clone()).is_err(),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_id_key() {
        assert_eq!(id_key(&json!(42)), Some("42".to_string()));
        assert_eq!(id_key(&json!("42")), Some("42".to_string()));
        assert_eq!(id_key(&json!(null)), None);
    }
}
