//! Worker configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::auth::access::AccessValue;
use crate::errors::DehydrationPolicy;
use common::jwt::MIN_SIGNING_SECRET_BYTES;
use common::secret::{ExposeSecret, SecretString, REDACTED};
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::fmt;
use thiserror::Error;

/// Default client-facing bind address (WebSocket + HTTP requests).
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default token lifetime in seconds (one day).
pub const DEFAULT_TOKEN_EXPIRY_SECONDS: u64 = 86_400;

/// Default maximum number of validation checks per request.
pub const DEFAULT_VALIDATION_CHECK_LIMIT: usize = 50;

/// Default API level assumed for clients that do not send one.
pub const DEFAULT_API_LEVEL: u32 = 1;

/// Default interval between token-info store sweeps.
pub const DEFAULT_TOKEN_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Default worker id prefix.
pub const DEFAULT_WORKER_ID_PREFIX: &str = "worker";

/// Worker configuration.
#[derive(Clone)]
pub struct Config {
    /// Unique identifier of this worker in the cluster.
    pub worker_id: String,

    /// Redis URL for the cluster bus. `None` runs an in-process bus.
    pub redis_url: Option<SecretString>,

    /// Cluster-wide HMAC secret for client tokens.
    pub token_secret: SecretString,

    /// Client-facing bind address (default: "0.0.0.0:3000").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Group of connections without a token.
    pub default_group: String,

    /// Groups a connection can authenticate to.
    pub auth_groups: BTreeSet<String>,

    /// Controller identifier behind the `AuthController` special id.
    pub auth_controller: Option<String>,

    /// Debug mode: full errors are sent to clients.
    pub debug: bool,

    /// Send error descriptions outside debug mode.
    pub send_error_description: bool,

    pub token_expiry_seconds: u64,

    /// Block token ids on sign-out.
    pub extra_secure_auth: bool,

    /// Check token ids against the token-info store on each request.
    pub use_token_state_check: bool,

    pub validation_check_limit: usize,

    pub default_api_level: u32,

    /// Controller access used when a controller declares none.
    pub default_controller_access: AccessValue,

    /// WebSocket access used when a controller declares none.
    pub default_ws_access: Option<bool>,

    /// HTTP access used when a controller declares none.
    pub default_http_access: Option<bool>,

    pub token_sweep_interval_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("worker_id", &self.worker_id)
            .field("redis_url", &self.redis_url.as_ref().map(|_| REDACTED))
            .field("token_secret", &REDACTED)
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("default_group", &self.default_group)
            .field("auth_groups", &self.auth_groups)
            .field("auth_controller", &self.auth_controller)
            .field("debug", &self.debug)
            .field("send_error_description", &self.send_error_description)
            .field("token_expiry_seconds", &self.token_expiry_seconds)
            .field("extra_secure_auth", &self.extra_secure_auth)
            .field("use_token_state_check", &self.use_token_state_check)
            .field("validation_check_limit", &self.validation_check_limit)
            .field("default_api_level", &self.default_api_level)
            .field("default_controller_access", &self.default_controller_access)
            .field("default_ws_access", &self.default_ws_access)
            .field("default_http_access", &self.default_http_access)
            .field(
                "token_sweep_interval_seconds",
                &self.token_sweep_interval_seconds,
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let token_secret = vars
            .get("WORKER_TOKEN_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("WORKER_TOKEN_SECRET".to_string()))?;
        if token_secret.len() < MIN_SIGNING_SECRET_BYTES {
            return Err(ConfigError::InvalidValue(format!(
                "WORKER_TOKEN_SECRET must be at least {MIN_SIGNING_SECRET_BYTES} bytes"
            )));
        }
        let token_secret = SecretString::from(token_secret.clone());

        let default_group = vars
            .get("WORKER_DEFAULT_GROUP")
            .ok_or_else(|| ConfigError::MissingEnvVar("WORKER_DEFAULT_GROUP".to_string()))?
            .trim()
            .to_string();
        if default_group.is_empty() {
            return Err(ConfigError::InvalidValue(
                "WORKER_DEFAULT_GROUP must not be empty".to_string(),
            ));
        }

        let auth_groups: BTreeSet<String> = vars
            .get("WORKER_AUTH_GROUPS")
            .map(|s| split_list(s).collect())
            .unwrap_or_default();
        if auth_groups.contains(&default_group) {
            return Err(ConfigError::InvalidValue(format!(
                "default group '{default_group}' must not also be an auth group"
            )));
        }

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let bind_address = vars
            .get("WORKER_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("WORKER_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let auth_controller = vars
            .get("WORKER_AUTH_CONTROLLER")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let default_controller_access = match vars.get("WORKER_DEFAULT_CONTROLLER_ACCESS") {
            Some(raw) => AccessValue::parse(raw).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "WORKER_DEFAULT_CONTROLLER_ACCESS: '{raw}' is not an access value"
                ))
            })?,
            None => AccessValue::All,
        };

        let worker_id = vars.get("WORKER_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_WORKER_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            worker_id,
            redis_url,
            token_secret,
            bind_address,
            health_bind_address,
            default_group,
            auth_groups,
            auth_controller,
            debug: parse_bool(vars, "WORKER_DEBUG", false)?,
            send_error_description: parse_bool(vars, "WORKER_SEND_ERROR_DESCRIPTION", false)?,
            token_expiry_seconds: parse_number(
                vars,
                "WORKER_TOKEN_EXPIRY_SECONDS",
                DEFAULT_TOKEN_EXPIRY_SECONDS,
            )?,
            extra_secure_auth: parse_bool(vars, "WORKER_EXTRA_SECURE_AUTH", false)?,
            use_token_state_check: parse_bool(vars, "WORKER_USE_TOKEN_STATE_CHECK", false)?,
            validation_check_limit: parse_number(
                vars,
                "WORKER_VALIDATION_CHECK_LIMIT",
                DEFAULT_VALIDATION_CHECK_LIMIT,
            )?,
            default_api_level: parse_number(vars, "WORKER_DEFAULT_API_LEVEL", DEFAULT_API_LEVEL)?,
            default_controller_access,
            default_ws_access: Some(parse_bool(vars, "WORKER_DEFAULT_WS_ACCESS", true)?),
            default_http_access: Some(parse_bool(vars, "WORKER_DEFAULT_HTTP_ACCESS", true)?),
            token_sweep_interval_seconds: parse_number(
                vars,
                "WORKER_TOKEN_SWEEP_INTERVAL_SECONDS",
                DEFAULT_TOKEN_SWEEP_INTERVAL_SECONDS,
            )?,
        })
    }

    /// Auth settings shared by the auth and token engines.
    #[must_use]
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            default_group: self.default_group.clone(),
            auth_groups: self.auth_groups.clone(),
            token_expiry_seconds: self.token_expiry_seconds,
            extra_secure_auth: self.extra_secure_auth,
            use_token_state_check: self.use_token_state_check,
            default_access: self.default_controller_access.clone(),
            default_ws_access: self.default_ws_access,
            default_http_access: self.default_http_access,
        }
    }

    /// How much of an error leaves the process.
    #[must_use]
    pub fn dehydration_policy(&self) -> DehydrationPolicy {
        DehydrationPolicy {
            debug: self.debug,
            send_description: self.send_error_description,
        }
    }

    /// Whether a Redis bus is configured.
    #[must_use]
    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url.as_ref().map(ExposeSecret::expose_secret)
    }
}

/// Auth settings derived from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuthConfig {
    pub default_group: String,
    pub auth_groups: BTreeSet<String>,
    pub token_expiry_seconds: u64,
    pub extra_secure_auth: bool,
    pub use_token_state_check: bool,
    /// Controller access used when a controller declares none.
    pub default_access: AccessValue,
    pub default_ws_access: Option<bool>,
    pub default_http_access: Option<bool>,
}

impl AuthConfig {
    /// Auth settings with the given groups and defaults elsewhere.
    #[must_use]
    pub fn new<I, S>(default_group: impl Into<String>, auth_groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default_group: default_group.into(),
            auth_groups: auth_groups.into_iter().map(Into::into).collect(),
            token_expiry_seconds: DEFAULT_TOKEN_EXPIRY_SECONDS,
            extra_secure_auth: false,
            use_token_state_check: false,
            default_access: AccessValue::All,
            default_ws_access: Some(true),
            default_http_access: Some(true),
        }
    }

    #[must_use]
    pub fn is_auth_group(&self, group: &str) -> bool {
        self.auth_groups.contains(group)
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_bool(
    vars: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(key).map(|s| s.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(value) => match value.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue(format!(
                "{key}: '{value}' is not a boolean"
            ))),
        },
    }
}

fn parse_number<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}: '{raw}' is not a number"))),
    }
}
