//! Token-info store.
//!
//! Records issued token ids so a token can be revoked before it expires.
//! The worker consults it when token-state checking is enabled and blocks
//! ids on sign-out in extra-secure mode.

use crate::errors::WorkerError;
use async_trait::async_trait;
use common::types::{AuthId, TokenId};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Token store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for WorkerError {
    fn from(err: StoreError) -> Self {
        WorkerError::TokenStore(err.to_string())
    }
}

/// Persistent record of issued tokens.
#[async_trait]
pub trait TokenInfoStore: Send + Sync {
    /// Record a newly issued token.
    async fn create_token_info(
        &self,
        token_id: &TokenId,
        expire: i64,
        auth_id: Option<&AuthId>,
    ) -> Result<(), StoreError>;

    /// Revoke a token id. Unknown ids are recorded as blocked.
    async fn block_token_id(&self, token_id: &TokenId, expire: i64) -> Result<(), StoreError>;

    /// `false` only for blocked ids. Ids the store never saw are valid.
    async fn is_token_id_valid(&self, token_id: &TokenId) -> Result<bool, StoreError>;

    /// Drop records whose token expired at or before `now`. Returns the
    /// number of removed records.
    async fn remove_expired(&self, now: i64) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TokenInfo {
    expire: i64,
    blocked: bool,
    auth_id: Option<AuthId>,
}

/// Process-local store for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryTokenInfoStore {
    tokens: RwLock<HashMap<TokenId, TokenInfo>>,
}

impl InMemoryTokenInfoStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }

    /// Token ids recorded for a user.
    pub async fn token_ids_of(&self, auth_id: &AuthId) -> Vec<TokenId> {
        self.tokens
            .read()
            .await
            .iter()
            .filter(|(_, info)| {
                info.auth_id
                    .as_ref()
                    .is_some_and(|own| own.key() == auth_id.key())
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl TokenInfoStore for InMemoryTokenInfoStore {
    async fn create_token_info(
        &self,
        token_id: &TokenId,
        expire: i64,
        auth_id: Option<&AuthId>,
    ) -> Result<(), StoreError> {
        self.tokens.write().await.insert(
            token_id.clone(),
            TokenInfo {
                expire,
                blocked: false,
                auth_id: auth_id.cloned(),
            },
        );
        Ok(())
    }

    async fn block_token_id(&self, token_id: &TokenId, expire: i64) -> Result<(), StoreError> {
        self.tokens
            .write()
            .await
            .entry(token_id.clone())
            .and_modify(|info| info.blocked = true)
            .or_insert(TokenInfo {
                expire,
                blocked: true,
                auth_id: None,
            });
        debug!(target: "worker.token", token_id = %token_id, "Token id blocked");
        Ok(())
    }

    async fn is_token_id_valid(&self, token_id: &TokenId) -> Result<bool, StoreError> {
        Ok(self
            .tokens
            .read()
            .await
            .get(token_id)
            .map_or(true, |info| !info.blocked))
    }

    async fn remove_expired(&self, now: i64) -> Result<usize, StoreError> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, info| info.expire > now);
        Ok(before - tokens.len())
    }
}
