//! Worker-local index of live sockets.

use crate::auth::AuthEngine;
use crate::bus::packages::{id_key, MapTaskTarget};
use crate::observability::metrics;
use common::types::{AuthId, SocketId};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

/// Live sockets of this worker keyed by socket id.
#[derive(Debug, Default)]
pub struct SocketRegistry {
    sockets: RwLock<HashMap<SocketId, AuthEngine>>,
}

impl SocketRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, engine: AuthEngine) {
        let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
        sockets.insert(engine.socket().sid().clone(), engine);
        metrics::set_sockets_active(sockets.len());
    }

    pub fn remove(&self, sid: &SocketId) -> Option<AuthEngine> {
        let mut sockets = self.sockets.write().unwrap_or_else(PoisonError::into_inner);
        let removed = sockets.remove(sid);
        metrics::set_sockets_active(sockets.len());
        removed
    }

    #[must_use]
    pub fn get(&self, sid: &SocketId) -> Option<AuthEngine> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sid)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sockets.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sockets matching a map-task target, minus `except`.
    ///
    /// Ids are compared by their string form so `42` and `"42"` select the
    /// same user. `AuthUserGroups` with no ids selects every authorized
    /// socket.
    #[must_use]
    pub fn select(
        &self,
        target: MapTaskTarget,
        ids: &[Value],
        except: &[SocketId],
    ) -> Vec<AuthEngine> {
        let keys: HashSet<String> = ids.iter().filter_map(id_key).collect();
        let except: HashSet<&SocketId> = except.iter().collect();

        self.filtered(|engine| {
            if except.contains(engine.socket().sid()) {
                return false;
            }
            let state = engine.socket().lock_state();
            match target {
                MapTaskTarget::AllSockets => true,
                MapTaskTarget::SocketSids => keys.contains(engine.socket().sid().as_str()),
                MapTaskTarget::DefaultUserGroup => state.auth.is_default(),
                MapTaskTarget::AuthUserGroups => {
                    !state.auth.is_default()
                        && (keys.is_empty() || keys.contains(state.auth.group()))
                }
                MapTaskTarget::UserIds => state
                    .token
                    .as_ref()
                    .and_then(|t| t.auth_id.as_ref())
                    .is_some_and(|id| keys.contains(&id.key())),
                MapTaskTarget::TokenIds => state
                    .token
                    .as_ref()
                    .is_some_and(|t| keys.contains(t.token_id.as_str())),
            }
        })
    }

    /// Authorized sockets whose token belongs to `auth_id`.
    #[must_use]
    pub fn select_user(&self, auth_id: &AuthId, except: &[SocketId]) -> Vec<AuthEngine> {
        self.select(
            MapTaskTarget::UserIds,
            &[Value::String(auth_id.key())],
            except,
        )
    }

    /// Sockets authorized in `group`.
    #[must_use]
    pub fn select_group(&self, group: &str, except: &[SocketId]) -> Vec<AuthEngine> {
        self.select(
            MapTaskTarget::AuthUserGroups,
            &[Value::String(group.to_string())],
            except,
        )
    }

    #[must_use]
    pub fn all(&self) -> Vec<AuthEngine> {
        self.filtered(|_| true)
    }

    fn filtered<F>(&self, mut keep: F) -> Vec<AuthEngine>
    where
        F: FnMut(&AuthEngine) -> bool,
    {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|engine| keep(engine))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::AuthState;
    use crate::config::AuthConfig;
    use crate::socket::{ClientEvent, HandshakeInfo, Protocol, Socket};
    use crate::token::{InMemoryTokenInfoStore, TokenServices};
    use common::jwt::TokenSigner;
    use common::secret::SecretString;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn services() -> Arc<TokenServices> {
        let signer =
            TokenSigner::new(&SecretString::from("test-secret-that-is-long-enough-0001")).unwrap();
        Arc::new(TokenServices::new(
            signer,
            Arc::new(InMemoryTokenInfoStore::new()),
            Arc::new(AuthConfig::new("guest", ["admin", "user"])),
        ))
    }

    async fn add(
        registry: &SocketRegistry,
        services: &Arc<TokenServices>,
        auth: Option<(&str, AuthId)>,
    ) -> (AuthEngine, mpsc::Receiver<ClientEvent>) {
        let initial = AuthState::default_for(services.auth_config());
        let (socket, rx) = Socket::new(Protocol::WebSocket, HandshakeInfo::default(), initial);
        let engine = AuthEngine::init(Arc::new(socket), Arc::clone(services), None)
            .await
            .unwrap();
        if let Some((group, id)) = auth {
            engine.auth_to(group, Some(id), None).await.unwrap();
        }
        registry.insert(engine.clone());
        (engine, rx)
    }

    fn sids(engines: &[AuthEngine]) -> HashSet<SocketId> {
        engines.iter().map(|e| e.socket().sid().clone()).collect()
    }

    #[tokio::test]
    async fn test_select_targets() {
        let registry = SocketRegistry::new();
        let services = services();
        let (guest, _g) = add(&registry, &services, None).await;
        let (admin, _a) = add(&registry, &services, Some(("admin", AuthId::from(42)))).await;
        let (user, _u) = add(&registry, &services, Some(("user", AuthId::from("7")))).await;

        assert_eq!(registry.select(MapTaskTarget::AllSockets, &[], &[]).len(), 3);
        assert_eq!(
            sids(&registry.select(MapTaskTarget::DefaultUserGroup, &[], &[])),
            sids(&[guest.clone()])
        );
        assert_eq!(
            sids(&registry.select(MapTaskTarget::UserIds, &[json!("42"), json!(7)], &[])),
            sids(&[admin.clone(), user.clone()])
        );
        assert_eq!(
            sids(&registry.select(MapTaskTarget::AuthUserGroups, &[json!("user")], &[])),
            sids(&[user.clone()])
        );
        assert_eq!(
            registry.select(MapTaskTarget::AuthUserGroups, &[], &[]).len(),
            2
        );
        assert_eq!(
            sids(&registry.select(
                MapTaskTarget::SocketSids,
                &[json!(guest.socket().sid().as_str())],
                &[]
            )),
            sids(&[guest.clone()])
        );

        let token_id = admin.socket().token().unwrap().token_id;
        assert_eq!(
            sids(&registry.select(MapTaskTarget::TokenIds, &[json!(token_id.as_str())], &[])),
            sids(&[admin.clone()])
        );
    }

    #[tokio::test]
    async fn test_select_honours_exceptions() {
        let registry = SocketRegistry::new();
        let services = services();
        let (first, _a) = add(&registry, &services, Some(("admin", AuthId::from(42)))).await;
        let (second, _b) = add(&registry, &services, Some(("admin", AuthId::from(42)))).await;

        let selected = registry.select_user(&AuthId::from(42), &[first.socket().sid().clone()]);
        assert_eq!(sids(&selected), sids(&[second]));
    }

    #[tokio::test]
    async fn test_insert_and_remove() {
        let registry = SocketRegistry::new();
        let services = services();
        let (engine, _rx) = add(&registry, &services, None).await;
        let sid = engine.socket().sid().clone();

        assert!(registry.get(&sid).is_some());
        assert!(registry.remove(&sid).is_some());
        assert!(registry.is_empty());
        assert!(registry.remove(&sid).is_none());
    }
}
