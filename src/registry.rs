//! Peer registry: which agent session currently answers for a peer key.
//!
//! At most one live session per key. A reconnecting agent replaces its stale
//! session; the old one is closed before the new one becomes visible, and
//! the old session's own cleanup can't evict its replacement.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::conn::VirtualConn;
use crate::error::TunnelError;
use crate::session::Session;

#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `session` the live session for its peer key, closing any session
    /// it replaces.
    pub async fn register(&self, session: Session) {
        let key = session.peer_key().to_owned();
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.get(&key) {
            if !old.ptr_eq(&session) {
                warn!(peer = %key, old_session = %old.id(), new_session = %session.id(), "replacing existing session");
                old.close_with(TunnelError::SessionClosed(format!("replaced by a newer session for peer {key}")));
            }
        }
        info!(peer = %key, session_id = %session.id(), "peer registered");
        sessions.insert(key, session);
    }

    /// Remove `session` if it is still the live one for its key. Returns
    /// whether anything was removed.
    pub async fn unregister(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session.peer_key()) {
            Some(current) if current.ptr_eq(session) => {
                sessions.remove(session.peer_key());
                info!(peer = %session.peer_key(), session_id = %session.id(), "peer unregistered");
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, peer_key: &str) -> Option<Session> {
        self.sessions.read().await.get(peer_key).cloned()
    }

    pub async fn has_session(&self, peer_key: &str) -> bool {
        self.sessions.read().await.contains_key(peer_key)
    }

    /// Registered peer keys, sorted.
    pub async fn peer_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Open a connection through the named peer's session.
    ///
    /// # Errors
    ///
    /// [`TunnelError::SessionClosed`] immediately when no session is
    /// registered for `peer_key`; otherwise whatever [`Session::dial`] returns.
    pub async fn dial(
        &self,
        ctx: &CancellationToken,
        peer_key: &str,
        proto: &str,
        address: &str,
    ) -> Result<VirtualConn, TunnelError> {
        let Some(session) = self.get(peer_key).await else {
            return Err(TunnelError::SessionClosed(format!("no session for peer {peer_key}")));
        };
        session.dial(ctx, proto, address).await
    }

    /// A dial function bound to one peer key.
    #[must_use]
    pub fn dialer(&self, peer_key: impl Into<String>) -> Dialer {
        Dialer { registry: self.clone(), peer_key: peer_key.into() }
    }

    /// Close every registered session and forget them.
    pub async fn close_all(&self) {
        let drained: Vec<Session> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        for session in drained {
            let _ = session.closed().await;
        }
    }
}

/// Dials through whichever session is live for one peer at call time, so it
/// keeps working across agent reconnects.
#[derive(Clone)]
pub struct Dialer {
    registry: Registry,
    peer_key: String,
}

impl Dialer {
    #[must_use]
    pub fn peer_key(&self) -> &str {
        &self.peer_key
    }

    /// # Errors
    ///
    /// See [`Registry::dial`].
    pub async fn dial(&self, ctx: &CancellationToken, proto: &str, address: &str) -> Result<VirtualConn, TunnelError> {
        self.registry.dial(ctx, &self.peer_key, proto, address).await
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
