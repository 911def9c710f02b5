//! Configuration and token fixtures.

use app_worker::config::Config;
use app_worker::token::Token;
use chrono::{Duration, Utc};
use common::jwt::TokenSigner;
use common::secret::SecretString;
use common::types::{AuthId, TokenId};
use serde_json::Value;
use std::collections::HashMap;

/// Signing secret shared by [`TestConfigBuilder`] and [`TestTokenBuilder`].
pub const TEST_TOKEN_SECRET: &str = "test-secret-that-is-long-enough-0001";

/// Default group of test configurations.
pub const TEST_DEFAULT_GROUP: &str = "guest";

/// Builder over the environment variables [`Config::from_vars`] reads.
///
/// # Example
/// ```rust,ignore
/// let config = TestConfigBuilder::new()
///     .with_worker_id("worker-a")
///     .with_auth_groups(["user", "admin"])
///     .build();
/// ```
pub struct TestConfigBuilder {
    vars: HashMap<String, String>,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let vars = HashMap::from([
            ("WORKER_ID".to_string(), "worker-test".to_string()),
            ("WORKER_TOKEN_SECRET".to_string(), TEST_TOKEN_SECRET.to_string()),
            ("WORKER_DEFAULT_GROUP".to_string(), TEST_DEFAULT_GROUP.to_string()),
            ("WORKER_AUTH_GROUPS".to_string(), "user,admin".to_string()),
        ]);
        Self { vars }
    }

    pub fn with_worker_id(self, worker_id: &str) -> Self {
        self.with_var("WORKER_ID", worker_id)
    }

    pub fn with_auth_groups<'a>(self, groups: impl IntoIterator<Item = &'a str>) -> Self {
        let groups: Vec<&str> = groups.into_iter().collect();
        self.with_var("WORKER_AUTH_GROUPS", &groups.join(","))
    }

    pub fn with_auth_controller(self, id: &str) -> Self {
        self.with_var("WORKER_AUTH_CONTROLLER", id)
    }

    pub fn with_token_state_check(self, enabled: bool) -> Self {
        self.with_var("WORKER_USE_TOKEN_STATE_CHECK", &enabled.to_string())
    }

    pub fn with_extra_secure_auth(self, enabled: bool) -> Self {
        self.with_var("WORKER_EXTRA_SECURE_AUTH", &enabled.to_string())
    }

    pub fn with_debug(self, enabled: bool) -> Self {
        self.with_var("WORKER_DEBUG", &enabled.to_string())
    }

    /// Set any variable [`Config::from_vars`] understands.
    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> Config {
        Config::from_vars(&self.vars).expect("test configuration should be valid")
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand for the default test configuration.
pub fn test_config() -> Config {
    TestConfigBuilder::new().build()
}

/// Builder for signed client tokens.
///
/// # Example
/// ```rust,ignore
/// let signed = TestTokenBuilder::new()
///     .in_group("user")
///     .for_auth_id(42_i64)
///     .with_claim("plan", json!("pro"))
///     .sign();
/// ```
pub struct TestTokenBuilder {
    token: Token,
}

impl TestTokenBuilder {
    /// Token with a fresh id expiring in one hour, no group.
    pub fn new() -> Self {
        let expire = (Utc::now() + Duration::seconds(3600)).timestamp();
        Self {
            token: Token::new(TokenId::new(), expire),
        }
    }

    pub fn with_token_id(mut self, token_id: &str) -> Self {
        self.token.token_id = TokenId::from(token_id);
        self
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.token.auth_group = Some(group.to_string());
        self
    }

    pub fn for_auth_id(mut self, auth_id: impl Into<AuthId>) -> Self {
        self.token.auth_id = Some(auth_id.into());
        self
    }

    pub fn with_claim(mut self, key: &str, value: Value) -> Self {
        self.token.custom.insert(key.to_string(), value);
        self
    }

    /// Set expiration in seconds from now. Negative values build an
    /// already expired token.
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.token.expire = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    pub fn build(self) -> Token {
        self.token
    }

    /// Sign with [`TEST_TOKEN_SECRET`].
    pub fn sign(self) -> String {
        self.sign_with(TEST_TOKEN_SECRET)
    }

    pub fn sign_with(self, secret: &str) -> String {
        TokenSigner::new(&SecretString::from(secret.to_string()))
            .expect("test secret should be long enough")
            .sign(&self.token)
            .expect("test token should sign")
    }
}

impl Default for TestTokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_builder_defaults() {
        let config = test_config();
        assert_eq!(config.worker_id, "worker-test");
        assert_eq!(config.default_group, TEST_DEFAULT_GROUP);
        assert!(config.auth_groups.contains("user"));
    }

    #[test]
    fn test_token_builder_round_trips_through_signer() {
        let signed = TestTokenBuilder::new()
            .with_token_id("tok-1")
            .in_group("user")
            .for_auth_id(42_i64)
            .with_claim("plan", json!("pro"))
            .sign();

        let signer = TokenSigner::new(&SecretString::from(TEST_TOKEN_SECRET.to_string())).unwrap();
        let token: Token = signer.verify(&signed).unwrap();
        assert_eq!(token.token_id.as_str(), "tok-1");
        assert_eq!(token.auth_group.as_deref(), Some("user"));
        assert_eq!(token.custom.get("plan"), Some(&json!("pro")));
    }
}
