//! Token reads, writes and creation for one connection.
//!
//! Every mutation runs under the socket's state lock from read to publish:
//! read the current token, apply the change, re-derive the auth state,
//! re-sign and queue the new signed token for the client. Nothing awaits
//! while the lock is held, so concurrent mutations on one connection never
//! interleave between read and write.
//!
//! Two write paths exist:
//! - the identity path ([`TokenEngine::set_identity`]) may write the reserved
//!   keys and re-checks special-channel subscriptions afterwards
//! - the ordinary path ([`TokenEngine::set_custom_variables`],
//!   [`TokenEngine::apply_edits`]) rejects reserved keys with
//!   `ReservedKeyConflict`
//!
//! Both merge by key and require an existing token.

use crate::auth::AuthState;
use crate::config::AuthConfig;
use crate::errors::WorkerError;
use crate::observability::metrics;
use crate::socket::{ClientEvent, Socket};
use crate::token::edit::{ObjectEditAction, ObjectPath};
use crate::token::info_store::TokenInfoStore;
use crate::token::model::{check_reserved_keys, IdentityUpdate, Token};
use common::jwt::{unix_now, TokenSigner};
use common::types::TokenId;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Worker-wide token collaborators shared by every connection.
pub struct TokenServices {
    signer: TokenSigner,
    store: Arc<dyn TokenInfoStore>,
    auth: Arc<AuthConfig>,
}

impl fmt::Debug for TokenServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenServices")
            .field("signer", &self.signer)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl TokenServices {
    #[must_use]
    pub fn new(signer: TokenSigner, store: Arc<dyn TokenInfoStore>, auth: Arc<AuthConfig>) -> Self {
        Self {
            signer,
            store,
            auth,
        }
    }

    #[must_use]
    pub fn auth_config(&self) -> &Arc<AuthConfig> {
        &self.auth
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TokenInfoStore> {
        &self.store
    }

    /// Verify a client-supplied signed token.
    ///
    /// # Errors
    ///
    /// `InvalidToken` for bad signatures or shapes, `TokenExpired` once
    /// `expire` has passed.
    pub fn verify(&self, signed: &str) -> Result<Token, WorkerError> {
        let token: Token = self.signer.verify(signed)?;
        if token.is_expired(unix_now()) {
            debug!(target: "worker.token", token_id = %token.token_id, "Token expired");
            return Err(WorkerError::TokenExpired);
        }
        Ok(token)
    }

    fn sign(&self, token: &Token) -> Result<String, WorkerError> {
        Ok(self.signer.sign(token)?)
    }
}

/// Token operations bound to one socket.
#[derive(Clone)]
pub struct TokenEngine {
    socket: Arc<Socket>,
    services: Arc<TokenServices>,
}

impl fmt::Debug for TokenEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEngine")
            .field("sid", self.socket.sid())
            .finish_non_exhaustive()
    }
}

impl TokenEngine {
    #[must_use]
    pub fn new(socket: Arc<Socket>, services: Arc<TokenServices>) -> Self {
        Self { socket, services }
    }

    #[must_use]
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    #[must_use]
    pub fn services(&self) -> &Arc<TokenServices> {
        &self.services
    }

    #[must_use]
    pub fn has_token(&self) -> bool {
        self.socket.lock_state().token.is_some()
    }

    /// Read a token variable; `None` without a token or at a missing path.
    #[must_use]
    pub fn get_token_variable(&self, path: &str) -> Option<Value> {
        self.socket
            .lock_state()
            .token
            .as_ref()
            .and_then(|token| token.get(&ObjectPath::parse(path)))
    }

    /// Install a token verified at connection time. The client already holds
    /// it, so nothing is re-signed or sent. The auth state is left to the
    /// caller.
    pub fn restore(&self, token: Token, signed: String) {
        let mut state = self.socket.lock_state();
        state.token = Some(token);
        state.signed_token = Some(signed);
    }

    /// Issue a new token with a fresh id and expiry.
    ///
    /// Reserved keys in `custom` are rejected before anything is written.
    ///
    /// # Errors
    ///
    /// - `ReservedKeyConflict` - `custom` names a reserved key
    /// - `TokenStore` - the token could not be recorded (state checks enabled)
    /// - `Signing` - the token could not be signed
    #[instrument(skip_all, fields(sid = %self.socket.sid()))]
    pub async fn create_token(
        &self,
        identity: IdentityUpdate,
        custom: Map<String, Value>,
    ) -> Result<(), WorkerError> {
        check_reserved_keys(custom.keys().map(String::as_str))?;

        let config = Arc::clone(&self.services.auth);
        let expire = unix_now().saturating_add(i64::try_from(config.token_expiry_seconds).unwrap_or(i64::MAX));
        let mut token = Token::new(TokenId::new(), expire);
        identity.apply_to(&mut token);
        token.custom = custom;

        if config.use_token_state_check {
            self.services
                .store
                .create_token_info(&token.token_id, token.expire, token.auth_id.as_ref())
                .await?;
        }

        let auth = AuthState::derive(Some(&token), &config)?;
        let signed = self.services.sign(&token)?;
        let token_id = token.token_id.clone();

        let mut state = self.socket.lock_state();
        state.token = Some(token);
        state.signed_token = Some(signed.clone());
        state.auth = auth;
        let kicked = state.recheck_subscriptions();
        self.socket.emit(ClientEvent::TokenChanged(Some(signed)));
        for channel in kicked {
            self.socket.emit(ClientEvent::Kicked { channel });
        }
        drop(state);

        metrics::record_token_mutation("create");
        debug!(target: "worker.token", token_id = %token_id, "Token created");
        Ok(())
    }

    /// Identity path: write reserved keys.
    ///
    /// # Errors
    ///
    /// `TokenRequired` without a token; auth-state errors if the resulting
    /// group is not configured.
    pub fn set_identity(&self, identity: &IdentityUpdate) -> Result<(), WorkerError> {
        self.mutate("identity", true, |token| {
            identity.apply_to(token);
            Ok(())
        })
    }

    /// Identity update and variable merge as one mutation, so the client
    /// sees a single new token.
    ///
    /// # Errors
    ///
    /// `ReservedKeyConflict` if `data` names a reserved key, `TokenRequired`
    /// without a token.
    pub fn set_identity_with_variables(
        &self,
        identity: &IdentityUpdate,
        data: Map<String, Value>,
    ) -> Result<(), WorkerError> {
        check_reserved_keys(data.keys().map(String::as_str))?;
        self.mutate("identity", true, move |token| {
            identity.apply_to(token);
            token.custom.extend(data);
            Ok(())
        })
    }

    /// Ordinary path: merge application variables by key.
    ///
    /// # Errors
    ///
    /// `ReservedKeyConflict` if `data` names a reserved key, `TokenRequired`
    /// without a token.
    pub fn set_custom_variables(&self, data: Map<String, Value>) -> Result<(), WorkerError> {
        check_reserved_keys(data.keys().map(String::as_str))?;
        self.mutate("ordinary", false, move |token| {
            token.custom.extend(data);
            Ok(())
        })
    }

    /// Merge `data` into the token through either path.
    ///
    /// On the identity path reserved keys are split out and written as
    /// identity; on the ordinary path they are rejected.
    ///
    /// # Errors
    ///
    /// See [`Self::set_identity`] and [`Self::set_custom_variables`].
    pub fn set_token_variable(
        &self,
        mut data: Map<String, Value>,
        via_identity_path: bool,
    ) -> Result<(), WorkerError> {
        if !via_identity_path {
            return self.set_custom_variables(data);
        }
        let identity = IdentityUpdate::extract(&mut data)?;
        self.mutate("identity", true, move |token| {
            identity.apply_to(token);
            token.custom.extend(data);
            Ok(())
        })
    }

    /// Apply an ordered edit sequence atomically (ordinary path).
    ///
    /// Returns `Ok(false)` when the socket has no token.
    ///
    /// # Errors
    ///
    /// `ReservedKeyConflict` if any edit writes a reserved key; nothing is
    /// applied in that case.
    pub fn apply_edits(&self, edits: &[ObjectEditAction]) -> Result<bool, WorkerError> {
        check_reserved_keys(edits.iter().filter_map(ObjectEditAction::root_key))?;
        match self.mutate("ordinary", false, |token| {
            crate::token::edit::apply_edits(edits, &mut token.custom);
            Ok(())
        }) {
            Ok(()) => Ok(true),
            Err(WorkerError::TokenRequired) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove the token and return to the default group.
    ///
    /// In extra-secure mode the token id is blocked in the store first.
    /// Special-channel subscriptions are re-checked afterwards.
    ///
    /// # Errors
    ///
    /// `TokenStore` if blocking fails; the token is kept in that case.
    #[instrument(skip_all, fields(sid = %self.socket.sid()))]
    pub async fn deauthenticate(&self) -> Result<(), WorkerError> {
        let current = self.socket.token();
        let config = Arc::clone(&self.services.auth);

        if let Some(token) = &current {
            if config.extra_secure_auth {
                self.services
                    .store
                    .block_token_id(&token.token_id, token.expire)
                    .await?;
            }
        }

        let mut state = self.socket.lock_state();
        let had_token = state.token.take().is_some();
        state.signed_token = None;
        state.auth = AuthState::default_for(&config);
        let kicked = state.recheck_subscriptions();
        if had_token {
            self.socket.emit(ClientEvent::TokenChanged(None));
        }
        for channel in kicked {
            self.socket.emit(ClientEvent::Kicked { channel });
        }
        drop(state);

        if had_token {
            metrics::record_token_mutation("deauthenticate");
            debug!(
                target: "worker.token",
                token_id = current.as_ref().map(|t| t.token_id.to_string()).unwrap_or_default(),
                "Token removed"
            );
        }
        Ok(())
    }

    fn mutate<F>(&self, path: &'static str, identity_changed: bool, change: F) -> Result<(), WorkerError>
    where
        F: FnOnce(&mut Token) -> Result<(), WorkerError>,
    {
        let mut state = self.socket.lock_state();
        let mut next = state.token.clone().ok_or(WorkerError::TokenRequired)?;
        change(&mut next)?;

        let auth = AuthState::derive(Some(&next), &self.services.auth)?;
        let signed = self.services.sign(&next)?;

        state.token = Some(next);
        state.signed_token = Some(signed.clone());
        state.auth = auth;
        let kicked = if identity_changed {
            state.recheck_subscriptions()
        } else {
            Vec::new()
        };
        self.socket.emit(ClientEvent::TokenChanged(Some(signed)));
        for channel in kicked {
            self.socket.emit(ClientEvent::Kicked { channel });
        }
        drop(state);

        metrics::record_token_mutation(path);
        Ok(())
    }
}
