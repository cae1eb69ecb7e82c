//! Tunnel server: accepts agent WebSockets and registers their sessions.
//!
//! DESIGN
//! ======
//! The handshake is an HTTP GET upgrade on `/connect`. The agent names
//! itself with `X-Tunnel-ID`; a pluggable [`Authorizer`] inspects the headers
//! before the upgrade is accepted, so rejected agents never get a socket.
//!
//! Once upgraded, the socket becomes a server-role [`Session`] registered
//! under the peer key until it ends. Callers reach agents through
//! [`Registry::dial`].
//!
//! Also serves `/healthz` and `/peers` (registered peer keys, JSON).

use std::collections::HashSet;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::registry::Registry;
use crate::session::Session;
use crate::wire::Transport;

/// `X-Tunnel-ID`, lowercase so it can be used as a static header name.
pub const PEER_KEY_HEADER: &str = "x-tunnel-id";
/// `X-API-Tunnel-Token`.
pub const TOKEN_HEADER: &str = "x-api-tunnel-token";

// =============================================================================
// AUTHORIZATION
// =============================================================================

/// Decides whether an agent may open a session, given its handshake headers.
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    /// Return the peer key the session registers under.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Auth`] rejects the handshake with 401.
    async fn authorize(&self, peer_key: &str, headers: &HeaderMap) -> Result<String, TunnelError>;
}

/// Static shared-token check on `X-API-Tunnel-Token`. Tokens are held only as
/// SHA-256 digests. With no tokens configured every agent is accepted.
#[derive(Debug, Clone, Default)]
pub struct HeaderAuthorizer {
    token_digests: HashSet<String>,
}

impl HeaderAuthorizer {
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let token_digests = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_owned())
            .filter(|t| !t.is_empty())
            .map(|t| hash_token(&t))
            .collect();
        Self { token_digests }
    }

    /// Comma-separated `TUNNEL_TOKENS`; unset or empty accepts every agent.
    #[must_use]
    pub fn from_env() -> Self {
        let raw = std::env::var("TUNNEL_TOKENS").unwrap_or_default();
        Self::with_tokens(raw.split(','))
    }

    #[must_use]
    pub fn requires_token(&self) -> bool {
        !self.token_digests.is_empty()
    }
}

#[async_trait::async_trait]
impl Authorizer for HeaderAuthorizer {
    async fn authorize(&self, peer_key: &str, headers: &HeaderMap) -> Result<String, TunnelError> {
        if !self.requires_token() {
            return Ok(peer_key.to_owned());
        }
        let token = headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TunnelError::Auth(format!("missing {TOKEN_HEADER} header")))?;
        if self.token_digests.contains(&hash_token(token)) {
            Ok(peer_key.to_owned())
        } else {
            Err(TunnelError::Auth("invalid tunnel token".into()))
        }
    }
}

#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let bytes = hasher.finalize();
    bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
}

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared handler state: the registry plus what new sessions need.
#[derive(Clone)]
pub struct TunnelServer {
    registry: Registry,
    authorizer: Arc<dyn Authorizer>,
    config: TunnelConfig,
    shutdown: CancellationToken,
}

impl TunnelServer {
    pub fn new(authorizer: impl Authorizer + 'static, config: TunnelConfig) -> Self {
        Self {
            registry: Registry::new(),
            authorizer: Arc::new(authorizer),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Cancelling this token tears down every session the server started.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/connect", get(handle_connect))
            .route("/healthz", get(healthz))
            .route("/peers", get(list_peers))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Run one agent session to completion: register, wait, unregister.
    pub async fn serve_session(&self, peer_key: String, transport: Transport) -> TunnelError {
        let session = Session::server(peer_key, transport, self.config, &self.shutdown);
        self.registry.register(session.clone()).await;
        let reason = session.closed().await;
        self.registry.unregister(&session).await;
        info!(peer = %session.peer_key(), session_id = %session.id(), reason = %reason, "agent disconnected");
        reason
    }

    /// Cancel every session and empty the registry.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.close_all().await;
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

pub async fn handle_connect(State(server): State<TunnelServer>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let peer_key = headers
        .get(PEER_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let Some(peer_key) = peer_key else {
        return (StatusCode::BAD_REQUEST, format!("{PEER_KEY_HEADER} header required")).into_response();
    };

    let peer_key = match server.authorizer.authorize(peer_key, &headers).await {
        Ok(key) => key,
        Err(e) => {
            warn!(peer = %peer_key, error = %e, "agent handshake rejected");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    info!(peer = %peer_key, "agent connecting");
    ws.on_upgrade(move |socket| async move {
        server.serve_session(peer_key, Transport::from_axum(socket)).await;
    })
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
struct PeersResponse {
    peers: Vec<String>,
}

async fn list_peers(State(server): State<TunnelServer>) -> Json<PeersResponse> {
    Json(PeersResponse { peers: server.registry.peer_keys().await })
}


#[cfg(test)]
#[path = "server_test.rs"]
mod tests;
