//! Access specifications for controllers and receivers.

use crate::errors::WorkerError;
use crate::socket::Protocol;
use std::collections::HashMap;

/// Who an access rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessValue {
    /// Every connection.
    All,
    /// Connections in an auth group.
    AllAuth,
    /// Connections in the default group.
    AllNotAuth,
    /// Connections in exactly this group.
    Group(String),
    /// Connections in any of these groups.
    Groups(Vec<String>),
}

impl AccessValue {
    /// Parse the textual form: `all`, `allAuth`, `allNotAuth` or a comma
    /// separated group list.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" => None,
            "all" => Some(AccessValue::All),
            "allAuth" => Some(AccessValue::AllAuth),
            "allNotAuth" => Some(AccessValue::AllNotAuth),
            list => {
                let mut groups: Vec<String> = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                match groups.len() {
                    0 => None,
                    1 => groups.pop().map(AccessValue::Group),
                    _ => Some(AccessValue::Groups(groups)),
                }
            }
        }
    }

    #[must_use]
    pub fn groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AccessValue::Groups(groups.into_iter().map(Into::into).collect())
    }

    /// Whether a connection in `group` matches this value.
    #[must_use]
    pub fn matches(&self, group: &str, is_auth: bool) -> bool {
        match self {
            AccessValue::All => true,
            AccessValue::AllAuth => is_auth,
            AccessValue::AllNotAuth => !is_auth,
            AccessValue::Group(g) => g == group,
            AccessValue::Groups(groups) => groups.iter().any(|g| g == group),
        }
    }
}

/// Controller access: at most one of `access` / `not_access`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessConfig {
    pub access: Option<AccessValue>,
    pub not_access: Option<AccessValue>,
}

impl AccessConfig {
    #[must_use]
    pub fn access(value: AccessValue) -> Self {
        Self {
            access: Some(value),
            not_access: None,
        }
    }

    #[must_use]
    pub fn not_access(value: AccessValue) -> Self {
        Self {
            access: None,
            not_access: Some(value),
        }
    }

    /// Evaluate for a connection, falling back to `default` when neither
    /// keyword is set.
    ///
    /// # Errors
    ///
    /// `DoubleAccessKeyword` if both keywords are set.
    pub fn evaluate(
        &self,
        default: &AccessValue,
        group: &str,
        is_auth: bool,
    ) -> Result<bool, WorkerError> {
        match (&self.access, &self.not_access) {
            (Some(_), Some(_)) => Err(WorkerError::DoubleAccessKeyword),
            (Some(access), None) => Ok(access.matches(group, is_auth)),
            (None, Some(not_access)) => Ok(!not_access.matches(group, is_auth)),
            (None, None) => Ok(default.matches(group, is_auth)),
        }
    }
}

/// Per-protocol access flags. `None` falls back to the configured default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolAccessConfig {
    pub ws_access: Option<bool>,
    pub http_access: Option<bool>,
}

impl ProtocolAccessConfig {
    /// Resolve the flag for `protocol`; absent on both sides means denied.
    #[must_use]
    pub fn allows(
        &self,
        protocol: Protocol,
        default_ws: Option<bool>,
        default_http: Option<bool>,
    ) -> bool {
        let (own, default) = match protocol {
            Protocol::WebSocket => (self.ws_access, default_ws),
            Protocol::Http => (self.http_access, default_http),
        };
        own.or(default).unwrap_or(false)
    }
}

/// Client system / version restrictions of a controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientAccessConfig {
    /// Allowed client systems. `None` allows every system.
    pub systems: Option<Vec<String>>,
    /// Minimum client version per system. Systems not listed are unrestricted.
    pub min_versions: HashMap<String, f64>,
}

impl ClientAccessConfig {
    /// # Errors
    ///
    /// `NoSystemAccess` if the system is not allowed.
    pub fn check_system(&self, system: &str) -> Result<(), WorkerError> {
        match &self.systems {
            Some(systems) if !systems.iter().any(|s| s == system) => {
                Err(WorkerError::NoSystemAccess {
                    system: system.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// # Errors
    ///
    /// `NoVersionAccess` if the version is below the system's minimum.
    pub fn check_version(&self, system: &str, version: f64) -> Result<(), WorkerError> {
        match self.min_versions.get(system) {
            Some(min) if version < *min => Err(WorkerError::NoVersionAccess {
                system: system.to_string(),
                version,
            }),
            _ => Ok(()),
        }
    }
}
