//! Worker error types.
//!
//! Two layers:
//!
//! - [`WorkerError`] - framework conditions raised by the engines. Each variant
//!   maps to an [`ErrorType`], a stable wire name and a private flag.
//! - [`BackError`] / [`BackErrorBag`] - the client-facing error model. Business
//!   handlers build these directly; framework errors convert into them.
//!
//! Nothing leaves the process un-dehydrated: [`BackError::dehydrate`] applies
//! the [`DehydrationPolicy`] so that descriptions are only sent when the
//! worker runs in debug mode or is configured to send them, and private errors
//! hide their real name, type and info.

use common::jwt::SigningError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Client-handleability class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Structural or validation failure of the client input.
    Input,
    /// Access denied by group, protocol or token state.
    Auth,
    /// Stale, blocked or malformed credential.
    Token,
    /// Server misconfiguration or unexpected failure.
    System,
    /// Client protocol, system or version mismatch.
    Compatibility,
    /// Work shed by admission control.
    Overload,
    /// Application-defined error.
    Normal,
}

impl ErrorType {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Input => "inputError",
            ErrorType::Auth => "authError",
            ErrorType::Token => "tokenError",
            ErrorType::System => "systemError",
            ErrorType::Compatibility => "compatibilityError",
            ErrorType::Overload => "overloadError",
            ErrorType::Normal => "normalError",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framework error type.
///
/// Error types per variant:
/// - Input: malformed request, unknown controller/receiver, check limit
/// - Auth: controller, protocol or channel access denied
/// - Compatibility: API level, client system or client version rejected
/// - Token: credential problems and token mutation protocol violations
/// - System: misconfiguration, bus, store and internal failures (always private)
/// - Overload: fetch backpressure limit reached
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorkerError {
    #[error("Malformed request: {0}")]
    InvalidRequest(String),

    #[error("Controller not found: {0}")]
    ControllerNotFound(String),

    #[error("Receiver not found: {0}")]
    ReceiverNotFound(String),

    #[error("Validation check limit reached: {checks_count} checks sent, limit is {limit}")]
    ValidationCheckLimitReached { limit: usize, checks_count: usize },

    #[error("No access to controller with auth group '{group}'")]
    NoControllerAccess { group: String },

    #[error("No access with protocol '{protocol}'")]
    NoProtocolAccess { protocol: String },

    #[error("No access to channel '{channel}'")]
    NoChannelAccess { channel: String },

    #[error("No controller compatible with API level {api_level}")]
    ApiLevelIncompatible { api_level: u32 },

    #[error("No access with client system '{system}'")]
    NoSystemAccess { system: String },

    #[error("No access with client version {version} on system '{system}'")]
    NoVersionAccess { system: String, version: f64 },

    #[error("Token auth group '{group}' is not configured")]
    SavedAuthGroupNotFound { group: String },

    #[error("Token has no auth group")]
    TokenWithoutAuthGroup,

    #[error("Operation requires a token")]
    TokenRequired,

    #[error("Key '{key}' is reserved and can only be set through the identity path")]
    ReservedKeyConflict { key: String },

    #[error("Cannot set an undefined client id")]
    CantSetUndefinedId,

    #[error("Token is expired")]
    TokenExpired,

    #[error("Token is blocked")]
    TokenBlocked,

    #[error("Token is invalid")]
    InvalidToken,

    #[error("Controller access config defines both 'access' and 'notAccess'")]
    DoubleAccessKeyword,

    #[error("No auth controller is configured")]
    AuthControllerNotSet,

    #[error("Auth group '{0}' is not configured")]
    AuthGroupNotFound(String),

    #[error("Max backpressure of {max_backpressure} reached")]
    MaxBackpressureReached { max_backpressure: usize },

    #[error("Cluster bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Token store error: {0}")]
    TokenStore(String),

    #[error("Token signing failed: {0}")]
    Signing(String),

    #[error("Socket is closed")]
    SocketClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Returns the error type for this error.
    #[must_use]
    pub fn error_type(&self) -> ErrorType {
        match self {
            WorkerError::InvalidRequest(_)
            | WorkerError::ControllerNotFound(_)
            | WorkerError::ReceiverNotFound(_)
            | WorkerError::ValidationCheckLimitReached { .. } => ErrorType::Input,

            WorkerError::NoControllerAccess { .. }
            | WorkerError::NoProtocolAccess { .. }
            | WorkerError::NoChannelAccess { .. } => ErrorType::Auth,

            WorkerError::ApiLevelIncompatible { .. }
            | WorkerError::NoSystemAccess { .. }
            | WorkerError::NoVersionAccess { .. } => ErrorType::Compatibility,

            WorkerError::SavedAuthGroupNotFound { .. }
            | WorkerError::TokenWithoutAuthGroup
            | WorkerError::TokenRequired
            | WorkerError::ReservedKeyConflict { .. }
            | WorkerError::CantSetUndefinedId
            | WorkerError::TokenExpired
            | WorkerError::TokenBlocked
            | WorkerError::InvalidToken => ErrorType::Token,

            WorkerError::MaxBackpressureReached { .. } => ErrorType::Overload,

            WorkerError::DoubleAccessKeyword
            | WorkerError::AuthControllerNotSet
            | WorkerError::AuthGroupNotFound(_)
            | WorkerError::BusUnavailable(_)
            | WorkerError::TokenStore(_)
            | WorkerError::Signing(_)
            | WorkerError::SocketClosed
            | WorkerError::Internal(_) => ErrorType::System,
        }
    }

    /// Stable wire name of this error.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            WorkerError::InvalidRequest(_) => "invalidRequest",
            WorkerError::ControllerNotFound(_) => "controllerNotFound",
            WorkerError::ReceiverNotFound(_) => "receiverNotFound",
            WorkerError::ValidationCheckLimitReached { .. } => "validationCheckLimitReached",
            WorkerError::NoControllerAccess { .. } => "noAccessWithAuth",
            WorkerError::NoProtocolAccess { .. } => "noAccessWithProtocol",
            WorkerError::NoChannelAccess { .. } => "noChannelAccess",
            WorkerError::ApiLevelIncompatible { .. } => "apiLevelIncompatible",
            WorkerError::NoSystemAccess { .. } => "noAccessWithSystem",
            WorkerError::NoVersionAccess { .. } => "noAccessWithVersion",
            WorkerError::SavedAuthGroupNotFound { .. } => "savedAuthGroupNotFound",
            WorkerError::TokenWithoutAuthGroup => "tokenWithoutAuthGroup",
            WorkerError::TokenRequired => "tokenRequired",
            WorkerError::ReservedKeyConflict { .. } => "reservedKeyConflict",
            WorkerError::CantSetUndefinedId => "cantSetUndefinedId",
            WorkerError::TokenExpired => "tokenExpired",
            WorkerError::TokenBlocked => "tokenBlocked",
            WorkerError::InvalidToken => "invalidToken",
            WorkerError::DoubleAccessKeyword => "doubleAccessKeyword",
            WorkerError::AuthControllerNotSet => "authControllerNotSet",
            WorkerError::AuthGroupNotFound(_) => "authGroupNotFound",
            WorkerError::MaxBackpressureReached { .. } => "maxBackpressureReached",
            WorkerError::BusUnavailable(_) => "busUnavailable",
            WorkerError::TokenStore(_) => "tokenStoreError",
            WorkerError::Signing(_) => "tokenSigningError",
            WorkerError::SocketClosed => "socketClosed",
            WorkerError::Internal(_) => "unknownError",
        }
    }

    /// Whether the client may only see a redacted form of this error.
    #[must_use]
    pub fn is_private(&self) -> bool {
        match self.error_type() {
            ErrorType::System => true,
            ErrorType::Token => matches!(
                self,
                WorkerError::SavedAuthGroupNotFound { .. }
                    | WorkerError::TokenWithoutAuthGroup
                    | WorkerError::TokenExpired
                    | WorkerError::TokenBlocked
                    | WorkerError::InvalidToken
            ),
            _ => false,
        }
    }

    /// Structured details sent alongside the error.
    #[must_use]
    pub fn info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        match self {
            WorkerError::ControllerNotFound(id) | WorkerError::ReceiverNotFound(id) => {
                info.insert("identifier".to_string(), Value::from(id.as_str()));
            }
            WorkerError::ValidationCheckLimitReached {
                limit,
                checks_count,
            } => {
                info.insert("limit".to_string(), Value::from(*limit));
                info.insert("checksCount".to_string(), Value::from(*checks_count));
            }
            WorkerError::NoControllerAccess { group } => {
                info.insert("authGroup".to_string(), Value::from(group.as_str()));
            }
            WorkerError::NoProtocolAccess { protocol } => {
                info.insert("protocol".to_string(), Value::from(protocol.as_str()));
            }
            WorkerError::NoChannelAccess { channel } => {
                info.insert("channel".to_string(), Value::from(channel.as_str()));
            }
            WorkerError::ApiLevelIncompatible { api_level } => {
                info.insert("apiLevel".to_string(), Value::from(*api_level));
            }
            WorkerError::NoSystemAccess { system } => {
                info.insert("system".to_string(), Value::from(system.as_str()));
            }
            WorkerError::NoVersionAccess { system, version } => {
                info.insert("system".to_string(), Value::from(system.as_str()));
                info.insert("version".to_string(), Value::from(*version));
            }
            WorkerError::SavedAuthGroupNotFound { group } => {
                info.insert("authGroup".to_string(), Value::from(group.as_str()));
            }
            WorkerError::ReservedKeyConflict { key } => {
                info.insert("key".to_string(), Value::from(key.as_str()));
            }
            WorkerError::MaxBackpressureReached { max_backpressure } => {
                info.insert("maxBackpressure".to_string(), Value::from(*max_backpressure));
            }
            _ => {}
        }
        info
    }
}

impl From<SigningError> for WorkerError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::Encoding(msg) => WorkerError::Signing(msg),
            SigningError::WeakSecret => WorkerError::Signing(err.to_string()),
            SigningError::TokenTooLarge
            | SigningError::MalformedToken
            | SigningError::InvalidSignature => WorkerError::InvalidToken,
        }
    }
}

/// Controls how much of an error leaves the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DehydrationPolicy {
    /// Debug mode: everything is sent, private errors included.
    pub debug: bool,
    /// Send descriptions even outside debug mode.
    pub send_description: bool,
}

/// Wire-safe error shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedError {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "t")]
    pub error_type: String,
    #[serde(rename = "g", default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "i", default, skip_serializing_if = "Map::is_empty")]
    pub info: Map<String, Value>,
    #[serde(rename = "p", default)]
    pub private: bool,
    #[serde(rename = "z", default)]
    pub from_framework: bool,
}

/// Client-facing error.
#[derive(Debug, Clone, PartialEq)]
pub struct BackError {
    name: String,
    group: Option<String>,
    error_type: ErrorType,
    description: String,
    private: bool,
    from_framework: bool,
    info: Map<String, Value>,
}

impl BackError {
    /// Create an application error.
    #[must_use]
    pub fn new(name: impl Into<String>, error_type: ErrorType) -> Self {
        Self {
            name: name.into(),
            group: None,
            error_type,
            description: String::new(),
            private: false,
            from_framework: false,
            info: Map::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }

    /// Mark the error private (name, type and info hidden outside debug mode).
    #[must_use]
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    #[must_use]
    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn is_private(&self) -> bool {
        self.private
    }

    #[must_use]
    pub fn is_from_framework(&self) -> bool {
        self.from_framework
    }

    #[must_use]
    pub fn info(&self) -> &Map<String, Value> {
        &self.info
    }

    /// Convert into the wire-safe shape.
    #[must_use]
    pub fn dehydrate(&self, policy: DehydrationPolicy) -> DehydratedError {
        let description = if (policy.debug || policy.send_description)
            && !self.description.is_empty()
        {
            Some(self.description.clone())
        } else {
            None
        };

        if self.private && !policy.debug {
            return DehydratedError {
                name: "privateError".to_string(),
                error_type: "unknown".to_string(),
                group: None,
                description: None,
                info: Map::new(),
                private: true,
                from_framework: self.from_framework,
            };
        }

        DehydratedError {
            name: self.name.clone(),
            error_type: self.error_type.as_str().to_string(),
            group: self.group.clone(),
            description,
            info: self.info.clone(),
            private: self.private,
            from_framework: self.from_framework,
        }
    }
}

impl fmt::Display for BackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{} ({})", self.name, self.error_type)
        } else {
            write!(f, "{} ({}): {}", self.name, self.error_type, self.description)
        }
    }
}

impl std::error::Error for BackError {}

impl From<WorkerError> for BackError {
    fn from(err: WorkerError) -> Self {
        Self {
            name: err.name().to_string(),
            group: None,
            error_type: err.error_type(),
            description: err.to_string(),
            private: err.is_private(),
            from_framework: true,
            info: err.info(),
        }
    }
}

/// Ordered collection of errors returned together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackErrorBag {
    errors: Vec<BackError>,
}

impl BackErrorBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: impl Into<BackError>) {
        self.errors.push(error.into());
    }

    /// Append every error of another bag, keeping order.
    pub fn merge(&mut self, other: BackErrorBag) {
        self.errors.extend(other.errors);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackError> {
        self.errors.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<BackError> {
        self.errors
    }

    #[must_use]
    pub fn dehydrate(&self, policy: DehydrationPolicy) -> Vec<DehydratedError> {
        self.errors.iter().map(|e| e.dehydrate(policy)).collect()
    }
}

impl fmt::Display for BackErrorBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BackErrorBag {}

impl From<BackError> for BackErrorBag {
    fn from(error: BackError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl From<WorkerError> for BackErrorBag {
    fn from(error: WorkerError) -> Self {
        BackErrorBag::from(BackError::from(error))
    }
}

impl FromIterator<BackError> for BackErrorBag {
    fn from_iter<I: IntoIterator<Item = BackError>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

/// Error returned by business handlers and hooks.
#[derive(Debug)]
pub enum HandlerError {
    /// A single client-facing error.
    Back(BackError),
    /// Several client-facing errors.
    Bag(BackErrorBag),
    /// Anything else. Wrapped into a private system error before leaving.
    Unknown(anyhow::Error),
}

impl HandlerError {
    /// Flatten into a bag; unknown errors become a private internal error.
    #[must_use]
    pub fn into_bag(self) -> BackErrorBag {
        match self {
            HandlerError::Back(error) => BackErrorBag::from(error),
            HandlerError::Bag(bag) => bag,
            HandlerError::Unknown(error) => {
                BackErrorBag::from(WorkerError::Internal(format!("{error:#}")))
            }
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Back(error) => write!(f, "{error}"),
            HandlerError::Bag(bag) => write!(f, "{bag}"),
            HandlerError::Unknown(error) => write!(f, "unknown error: {error:#}"),
        }
    }
}

impl From<BackError> for HandlerError {
    fn from(error: BackError) -> Self {
        HandlerError::Back(error)
    }
}

impl From<BackErrorBag> for HandlerError {
    fn from(bag: BackErrorBag) -> Self {
        HandlerError::Bag(bag)
    }
}

impl From<WorkerError> for HandlerError {
    fn from(error: WorkerError) -> Self {
        HandlerError::Back(error.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::Unknown(error)
    }
}
