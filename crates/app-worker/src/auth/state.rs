//! Authorization state derived from a token.

use crate::config::AuthConfig;
use crate::errors::WorkerError;
use crate::token::Token;

/// `{group, is_default}` of a connection. `is_default` holds exactly when
/// `group` is the configured default group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    group: String,
    is_default: bool,
}

impl AuthState {
    /// The unauthenticated state.
    #[must_use]
    pub fn default_for(config: &AuthConfig) -> Self {
        Self {
            group: config.default_group.clone(),
            is_default: true,
        }
    }

    /// Derive the state for `token`.
    ///
    /// # Errors
    ///
    /// - `TokenWithoutAuthGroup` - the token has no `authGroup`
    /// - `SavedAuthGroupNotFound` - the token's group is not configured
    pub fn derive(token: Option<&Token>, config: &AuthConfig) -> Result<Self, WorkerError> {
        let Some(token) = token else {
            return Ok(Self::default_for(config));
        };
        match token.auth_group.as_deref() {
            None => Err(WorkerError::TokenWithoutAuthGroup),
            Some(group) if config.is_auth_group(group) => Ok(Self {
                group: group.to_string(),
                is_default: false,
            }),
            Some(group) => Err(WorkerError::SavedAuthGroupNotFound {
                group: group.to_string(),
            }),
        }
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.is_default
    }
}
