//! Live client connections.
//!
//! A [`Socket`] is exclusively owned by the worker that accepted it. Its
//! mutable state (token, signed token, auth state, subscriptions) sits
//! behind one mutex that token mutations hold for their whole
//! read-modify-write, without awaiting.
//!
//! Outbound traffic goes through a bounded [`ClientEvent`] queue drained by
//! the transport. A full queue drops the event and counts it; producers never
//! wait on a slow client.

pub mod channels;
pub mod registry;

pub use registry::SocketRegistry;

use crate::auth::AuthState;
use crate::errors::WorkerError;
use crate::observability::metrics;
use crate::token::Token;
use common::types::SocketId;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outbound event queue capacity per socket.
pub const CLIENT_EVENT_BUFFER: usize = 256;

/// Transport a socket arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    WebSocket,
    Http,
}

impl Protocol {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Protocol::WebSocket => "ws",
            Protocol::Http => "http",
        }
    }
}

/// Client details sent at connection time.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeInfo {
    pub system: String,
    pub version: f64,
    pub api_level: Option<u32>,
}

impl Default for HandshakeInfo {
    fn default() -> Self {
        Self {
            system: "unknown".to_string(),
            version: 0.0,
            api_level: None,
        }
    }
}

/// Event pushed from the worker to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// New signed token, or `None` when the token was removed.
    TokenChanged(Option<String>),
    /// Application event.
    Emit { event: String, data: Value },
    /// Subscription removed by the server.
    Kicked { channel: String },
    /// The server closed the connection.
    Disconnect { reason: String },
}

/// Mutable per-socket state.
#[derive(Debug, Clone)]
pub struct SocketState {
    pub token: Option<Token>,
    pub signed_token: Option<String>,
    pub auth: AuthState,
    pub subscriptions: BTreeSet<String>,
}

impl SocketState {
    /// Drop subscriptions the current identity no longer permits.
    /// Returns the removed channels.
    pub fn recheck_subscriptions(&mut self) -> Vec<String> {
        let removed: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|ch| !channels::channel_allowed(ch, &self.auth, self.token.as_ref()))
            .cloned()
            .collect();
        for channel in &removed {
            self.subscriptions.remove(channel);
        }
        removed
    }
}

/// One live connection.
pub struct Socket {
    sid: SocketId,
    protocol: Protocol,
    handshake: HandshakeInfo,
    state: Mutex<SocketState>,
    events: mpsc::Sender<ClientEvent>,
    closed: CancellationToken,
    dropped_events: AtomicU64,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.sid)
            .field("protocol", &self.protocol)
            .field("handshake", &self.handshake)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Create a socket in the unauthenticated state. The receiver is the
    /// transport's end of the outbound queue.
    #[must_use]
    pub fn new(
        protocol: Protocol,
        handshake: HandshakeInfo,
        initial_auth: AuthState,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (events, receiver) = mpsc::channel(CLIENT_EVENT_BUFFER);
        let socket = Self {
            sid: SocketId::new(),
            protocol,
            handshake,
            state: Mutex::new(SocketState {
                token: None,
                signed_token: None,
                auth: initial_auth,
                subscriptions: BTreeSet::new(),
            }),
            events,
            closed: CancellationToken::new(),
            dropped_events: AtomicU64::new(0),
        };
        (socket, receiver)
    }

    #[must_use]
    pub fn sid(&self) -> &SocketId {
        &self.sid
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn handshake(&self) -> &HandshakeInfo {
        &self.handshake
    }

    /// Lock the mutable state. Never hold the guard across an await.
    pub fn lock_state(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn token(&self) -> Option<Token> {
        self.lock_state().token.clone()
    }

    #[must_use]
    pub fn signed_token(&self) -> Option<String> {
        self.lock_state().signed_token.clone()
    }

    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        self.lock_state().auth.clone()
    }

    #[must_use]
    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.lock_state().subscriptions.clone()
    }

    /// Subscribe to a channel.
    ///
    /// # Errors
    ///
    /// `NoChannelAccess` for a special channel the identity does not match.
    pub fn subscribe(&self, channel: &str) -> Result<(), WorkerError> {
        let mut state = self.lock_state();
        if !channels::channel_allowed(channel, &state.auth, state.token.as_ref()) {
            return Err(WorkerError::NoChannelAccess {
                channel: channel.to_string(),
            });
        }
        state.subscriptions.insert(channel.to_string());
        Ok(())
    }

    /// Remove a subscription on the server's initiative and tell the client.
    /// Returns whether the socket was subscribed.
    pub fn kick_out(&self, channel: &str) -> bool {
        let removed = self.lock_state().subscriptions.remove(channel);
        if removed {
            self.emit(ClientEvent::Kicked {
                channel: channel.to_string(),
            });
        }
        removed
    }

    /// Client-initiated unsubscribe.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.lock_state().subscriptions.remove(channel)
    }

    /// Queue an event for the client. Returns `false` if it was dropped.
    pub fn emit(&self, event: ClientEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::record_client_event_dropped();
                warn!(
                    target: "worker.transport",
                    sid = %self.sid,
                    dropped = dropped,
                    "Client event dropped due to backpressure"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Events dropped because the outbound queue was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Close the connection. Idempotent.
    pub fn close(&self, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        debug!(target: "worker.transport", sid = %self.sid, reason = reason, "Closing socket");
        self.emit(ClientEvent::Disconnect {
            reason: reason.to_string(),
        });
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the socket closes.
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}
