//! Per-connection authorization.
//!
//! A connection is either in the default group or authorized in one of the
//! configured auth groups. The state is derived from the token when the
//! connection is accepted and re-derived by the token engine after every
//! mutation.

use crate::auth::access::{AccessConfig, ProtocolAccessConfig};
use crate::auth::AuthState;
use crate::errors::WorkerError;
use crate::socket::Socket;
use crate::token::{IdentityUpdate, Token, TokenEngine, TokenServices};
use common::types::AuthId;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Authorization operations bound to one socket.
#[derive(Debug, Clone)]
pub struct AuthEngine {
    tokens: TokenEngine,
}

impl AuthEngine {
    /// Build the engine for a newly accepted socket.
    ///
    /// `token` is the verified handshake token and its signed form. A token
    /// without an `authGroup`, or naming a group that is not configured,
    /// signs the connection out and fails; the caller must reject the
    /// connection.
    ///
    /// # Errors
    ///
    /// - `TokenWithoutAuthGroup`
    /// - `SavedAuthGroupNotFound`
    /// - `TokenStore` if signing out failed in extra-secure mode
    #[instrument(skip_all, fields(sid = %socket.sid()))]
    pub async fn init(
        socket: Arc<Socket>,
        services: Arc<TokenServices>,
        token: Option<(Token, String)>,
    ) -> Result<Self, WorkerError> {
        let engine = Self {
            tokens: TokenEngine::new(socket, services),
        };
        let Some((token, signed)) = token else {
            return Ok(engine);
        };

        match AuthState::derive(Some(&token), engine.tokens.services().auth_config()) {
            Ok(state) => {
                engine.tokens.restore(token, signed);
                engine.socket().lock_state().auth = state;
                Ok(engine)
            }
            Err(err) => {
                warn!(
                    target: "worker.auth",
                    error = %err,
                    token_id = %token.token_id,
                    "Handshake token rejected, signing out"
                );
                engine.tokens.restore(token, signed);
                engine.tokens.deauthenticate().await?;
                Err(err)
            }
        }
    }

    #[must_use]
    pub fn socket(&self) -> &Arc<Socket> {
        self.tokens.socket()
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenEngine {
        &self.tokens
    }

    #[must_use]
    pub fn group(&self) -> String {
        self.socket().auth_state().group().to_string()
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.socket().auth_state().is_default()
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        !self.is_default()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<AuthId> {
        self.socket().token().and_then(|t| t.auth_id)
    }

    /// Authorize the connection in `group`.
    ///
    /// Returns `Ok(false)` without changing anything if `group` is not a
    /// configured auth group. The group, id and `client_data` are written in
    /// one mutation. A connection without a token gets a new one.
    ///
    /// # Errors
    ///
    /// `ReservedKeyConflict` if `client_data` names a reserved key (checked
    /// before anything is written), or token store and signing failures.
    #[instrument(skip_all, fields(sid = %self.socket().sid(), group = %group))]
    pub async fn auth_to(
        &self,
        group: &str,
        auth_id: Option<AuthId>,
        client_data: Option<Map<String, Value>>,
    ) -> Result<bool, WorkerError> {
        let config = self.tokens.services().auth_config();
        if !config.is_auth_group(group) {
            debug!(target: "worker.auth", "Auth group not configured");
            return Ok(false);
        }

        let custom = client_data.unwrap_or_default();
        crate::token::model::check_reserved_keys(custom.keys().map(String::as_str))?;

        let identity = IdentityUpdate::group(group).with_auth_id(auth_id);
        if self.tokens.has_token() {
            self.tokens.set_identity_with_variables(&identity, custom)?;
        } else {
            self.tokens.create_token(identity, custom).await?;
        }

        info!(target: "worker.auth", "Connection authorized");
        Ok(true)
    }

    /// Set the token's `authId`.
    ///
    /// # Errors
    ///
    /// `CantSetUndefinedId` for `None`, `TokenRequired` without a token.
    pub fn set_client_id(&self, auth_id: Option<AuthId>) -> Result<(), WorkerError> {
        let auth_id = auth_id.ok_or(WorkerError::CantSetUndefinedId)?;
        self.tokens.set_identity(&IdentityUpdate {
            auth_id: Some(auth_id),
            ..IdentityUpdate::default()
        })
    }

    /// Sign out to the default group.
    ///
    /// # Errors
    ///
    /// `TokenStore` if blocking the token id fails in extra-secure mode.
    pub async fn auth_out(&self) -> Result<(), WorkerError> {
        self.tokens.deauthenticate().await?;
        info!(target: "worker.auth", sid = %self.socket().sid(), "Connection signed out");
        Ok(())
    }

    /// # Errors
    ///
    /// `DoubleAccessKeyword` if the controller sets both keywords.
    pub fn has_access_to_controller(&self, access: &AccessConfig) -> Result<bool, WorkerError> {
        let state = self.socket().auth_state();
        let config = self.tokens.services().auth_config();
        access.evaluate(&config.default_access, state.group(), !state.is_default())
    }

    #[must_use]
    pub fn has_server_protocol_access(&self, access: &ProtocolAccessConfig) -> bool {
        let config = self.tokens.services().auth_config();
        access.allows(
            self.socket().protocol(),
            config.default_ws_access,
            config.default_http_access,
        )
    }

    /// Check the token id against the token-info store. A blocked id signs
    /// the connection out.
    ///
    /// # Errors
    ///
    /// `TokenBlocked` for a revoked token, `TokenStore` if the store fails.
    pub async fn check_token_state(&self) -> Result<(), WorkerError> {
        let Some(token) = self.socket().token() else {
            return Ok(());
        };
        let store = Arc::clone(self.tokens.services().store());
        if store.is_token_id_valid(&token.token_id).await? {
            return Ok(());
        }
        warn!(
            target: "worker.auth",
            sid = %self.socket().sid(),
            token_id = %token.token_id,
            "Blocked token used, signing out"
        );
        self.tokens.deauthenticate().await?;
        Err(WorkerError::TokenBlocked)
    }
}
