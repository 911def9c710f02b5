//! Ordered edit operations on token maps.
//!
//! Wire form (used on the cluster bus):
//!
//! ```text
//! [0, path, value]   set
//! [1, path]          delete
//! [2]                clear
//! ```
//!
//! `path` is a dotted string (`"profile.nick"`) or an array of segments.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Path into a nested JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath(Vec<String>);

impl ObjectPath {
    /// Parse a dotted path. Empty segments are dropped.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    #[must_use]
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Top-level key the path starts at.
    #[must_use]
    pub fn root(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read the value at this path.
    #[must_use]
    pub fn get<'a>(&self, map: &'a Map<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.0.split_first()?;
        let mut current = map.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    fn from_json(value: &Value) -> Result<Self, String> {
        let path = match value {
            Value::String(s) => Self::parse(s),
            Value::Array(items) => Self(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s.clone()),
                        Value::Number(n) => Ok(n.to_string()),
                        other => Err(format!("invalid path segment: {other}")),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            other => return Err(format!("invalid path: {other}")),
        };
        if path.is_empty() {
            return Err("empty path".to_string());
        }
        Ok(path)
    }

    fn to_json(&self) -> Value {
        if self.0.iter().any(|s| s.contains('.')) {
            Value::Array(self.0.iter().cloned().map(Value::String).collect())
        } else {
            Value::String(self.0.join("."))
        }
    }
}

impl From<&str> for ObjectPath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// One edit operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum ObjectEditAction {
    Set { path: ObjectPath, value: Value },
    Delete { path: ObjectPath },
    Clear,
}

impl ObjectEditAction {
    #[must_use]
    pub fn set(path: impl Into<ObjectPath>, value: impl Into<Value>) -> Self {
        ObjectEditAction::Set {
            path: path.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn delete(path: impl Into<ObjectPath>) -> Self {
        ObjectEditAction::Delete { path: path.into() }
    }

    /// Top-level key this edit writes; `None` for `Clear`.
    #[must_use]
    pub fn root_key(&self) -> Option<&str> {
        match self {
            ObjectEditAction::Set { path, .. } | ObjectEditAction::Delete { path } => path.root(),
            ObjectEditAction::Clear => None,
        }
    }

    /// Apply to `target`. Missing intermediate objects are created on set;
    /// non-object intermediates are replaced.
    pub fn apply(&self, target: &mut Map<String, Value>) {
        match self {
            ObjectEditAction::Set { path, value } => set_path(target, path.segments(), value),
            ObjectEditAction::Delete { path } => delete_path(target, path.segments()),
            ObjectEditAction::Clear => target.clear(),
        }
    }
}

/// Apply `edits` in order.
pub fn apply_edits(edits: &[ObjectEditAction], target: &mut Map<String, Value>) {
    for edit in edits {
        edit.apply(target);
    }
}

fn set_path(target: &mut Map<String, Value>, segments: &[String], value: &Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = target;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.clone(), value.clone());
}

fn delete_path(target: &mut Map<String, Value>, segments: &[String]) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = target;
    for segment in parents {
        match current.get_mut(segment) {
            Some(Value::Object(next)) => current = next,
            _ => return,
        }
    }
    current.remove(last);
}

impl TryFrom<Value> for ObjectEditAction {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Array(items) = value else {
            return Err("edit must be an array".to_string());
        };
        let code = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| "edit needs a numeric operation code".to_string())?;
        match (code, items.len()) {
            (0, 3) => {
                let path = ObjectPath::from_json(items.get(1).unwrap_or(&Value::Null))?;
                let value = items.get(2).cloned().unwrap_or(Value::Null);
                Ok(ObjectEditAction::Set { path, value })
            }
            (1, 2) => {
                let path = ObjectPath::from_json(items.get(1).unwrap_or(&Value::Null))?;
                Ok(ObjectEditAction::Delete { path })
            }
            (2, 1) => Ok(ObjectEditAction::Clear),
            (code, len) => Err(format!("invalid edit: code {code} with {len} elements")),
        }
    }
}

impl From<ObjectEditAction> for Value {
    fn from(action: ObjectEditAction) -> Self {
        match action {
            ObjectEditAction::Set { path, value } => {
                Value::Array(vec![Value::from(0), path.to_json(), value])
            }
            ObjectEditAction::Delete { path } => Value::Array(vec![Value::from(1), path.to_json()]),
            ObjectEditAction::Clear => Value::Array(vec![Value::from(2)]),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_wire_operations() {
        let edits: Vec<ObjectEditAction> =
            serde_json::from_value(json!([[0, "nick", "y"], [1, ["profile", "age"]], [2]]))
                .unwrap();

        assert_eq!(
            edits,
            vec![
                ObjectEditAction::set("nick", "y"),
                ObjectEditAction::delete(ObjectPath::from_segments(["profile", "age"])),
                ObjectEditAction::Clear,
            ]
        );
    }

    #[test]
    fn test_rejects_malformed_operations() {
        for raw in [
            json!({"op": 0}),
            json!([]),
            json!([0, "nick"]),
            json!([1]),
            json!([7, "x"]),
            json!([0, "", 1]),
            json!([0, {"a": 1}, 1]),
        ] {
            assert!(
                serde_json::from_value::<ObjectEditAction>(raw.clone()).is_err(),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_serializes_to_wire_form() {
        let value = serde_json::to_value(vec![
            ObjectEditAction::set("profile.nick", "x"),
            ObjectEditAction::delete(ObjectPath::from_segments(["a.b"])),
            ObjectEditAction::Clear,
        ])
        .unwrap();

        assert_eq!(value, json!([[0, "profile.nick", "x"], [1, ["a.b"]], [2]]));
    }

    #[test]
    fn test_set_creates_nested_objects() {
        let mut target = map(json!({"profile": 5}));

        apply_edits(
            &[
                ObjectEditAction::set("profile.nick", "x"),
                ObjectEditAction::set("settings.theme.dark", true),
            ],
            &mut target,
        );

        assert_eq!(
            Value::Object(target),
            json!({"profile": {"nick": "x"}, "settings": {"theme": {"dark": true}}})
        );
    }

    #[test]
    fn test_delete_and_clear() {
        let mut target = map(json!({"profile": {"nick": "x", "age": 3}, "level": 2}));

        ObjectEditAction::delete("profile.age").apply(&mut target);
        ObjectEditAction::delete("missing.path").apply(&mut target);
        assert_eq!(
            Value::Object(target.clone()),
            json!({"profile": {"nick": "x"}, "level": 2})
        );

        ObjectEditAction::Clear.apply(&mut target);
        assert!(target.is_empty());
    }

    #[test]
    fn test_path_get() {
        let target = map(json!({"profile": {"nick": "x"}}));

        assert_eq!(
            ObjectPath::parse("profile.nick").get(&target),
            Some(&json!("x"))
        );
        assert_eq!(ObjectPath::parse("profile.age").get(&target), None);
        assert_eq!(ObjectPath::parse("profile.nick.deep").get(&target), None);
    }
}
