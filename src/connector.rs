//! Agent connector: keeps one outbound tunnel session alive and serves the
//! server's dial requests against local sockets.
//!
//! ARCHITECTURE
//! ============
//! `run` is an explicit state machine published on a `watch` channel:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Backoff -> Connecting -> ...
//!                      |                        ^
//!                      +------ handshake error -+
//! ```
//!
//! Every failure is retried after an exponential backoff delay; the delay
//! resets once a session reaches `Connected`. Only cancellation of the
//! caller's token ends the loop.
//!
//! Per incoming connection: authorize `(proto, address)`, dial locally with
//! the requested deadline, acknowledge, then pipe both directions in two
//! tasks. When either direction ends the connection is closed and the
//! other direction is stopped.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::Connector as TlsConnector;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::TunnelConfig;
use crate::conn::VirtualConn;
use crate::error::TunnelError;
use crate::server::{PEER_KEY_HEADER, TOKEN_HEADER};
use crate::session::Session;
use crate::wire::Transport;

/// Decides whether the server may reach `(proto, address)` through this agent.
pub type AgentAuthorizer = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Called once per established session. The token is cancelled when the
/// session ends; an error tears the session down.
pub type OnConnect = Arc<dyn Fn(CancellationToken, Session) -> BoxFuture<'static, Result<(), TunnelError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

// =============================================================================
// OPTIONS
// =============================================================================

#[derive(Clone)]
pub struct ConnectOptions {
    /// `ws://` or `wss://` URL of the server's `/connect` endpoint.
    pub url: String,
    /// Sent as `X-Tunnel-ID`.
    pub peer_key: String,
    /// Extra handshake headers.
    pub headers: Vec<(String, String)>,
    /// TLS settings for `wss://`; `None` uses the default roots.
    pub tls: Option<TlsConnector>,
    pub config: TunnelConfig,
    pub backoff: BackoffPolicy,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>, peer_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            peer_key: peer_key.into(),
            headers: Vec::new(),
            tls: None,
            config: TunnelConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Shared token checked by the server's header authorizer.
    #[must_use]
    pub fn with_token(self, token: impl Into<String>) -> Self {
        self.with_header(TOKEN_HEADER, token)
    }

    #[must_use]
    pub fn with_config(mut self, config: TunnelConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConnector) -> Self {
        self.tls = Some(tls);
        self
    }
}

// =============================================================================
// AUTHORIZERS
// =============================================================================

#[must_use]
pub fn allow_all() -> AgentAuthorizer {
    Arc::new(|_, _| true)
}

/// TCP to any address; Unix sockets only for the listed paths.
#[must_use]
pub fn allow_tcp_and_unix_sockets(sockets: impl IntoIterator<Item = String>) -> AgentAuthorizer {
    let sockets: HashSet<String> = sockets.into_iter().collect();
    Arc::new(move |proto, address| match proto {
        "tcp" | "tcp4" | "tcp6" => true,
        "unix" => sockets.contains(address),
        _ => false,
    })
}

// =============================================================================
// CONNECTOR
// =============================================================================

pub struct Connector {
    options: ConnectOptions,
    authorizer: AgentAuthorizer,
    on_connect: Option<OnConnect>,
    state: watch::Sender<ConnectorState>,
}

impl Connector {
    #[must_use]
    pub fn new(options: ConnectOptions, authorizer: AgentAuthorizer) -> Self {
        let (state, _) = watch::channel(ConnectorState::Disconnected);
        Self { options, authorizer, on_connect: None, state }
    }

    #[must_use]
    pub fn on_connect(mut self, hook: OnConnect) -> Self {
        self.on_connect = Some(hook);
        self
    }

    #[must_use]
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectorState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectorState) {
        self.state.send_replace(state);
    }

    /// Connect and reconnect until `ctx` is cancelled; always returns
    /// [`TunnelError::Cancelled`].
    pub async fn run(&self, ctx: &CancellationToken) -> TunnelError {
        let mut backoff = self.options.backoff.clone();

        loop {
            if ctx.is_cancelled() {
                break;
            }

            self.set_state(ConnectorState::Connecting);
            let reason = match self.establish(ctx).await {
                Ok((session, incoming)) => {
                    self.set_state(ConnectorState::Connected);
                    backoff.reset();
                    self.serve(ctx, session, incoming).await
                }
                Err(e) => e,
            };

            // Only the caller's token ends the loop, whatever the session's reason.
            if ctx.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            self.set_state(ConnectorState::Backoff);
            warn!(
                url = %self.options.url,
                peer = %self.options.peer_key,
                error = %reason,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "tunnel disconnected, retrying"
            );

            tokio::select! {
                () = ctx.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectorState::Disconnected);
        info!(url = %self.options.url, peer = %self.options.peer_key, "connector stopped");
        TunnelError::Cancelled
    }

    /// One session lifetime: handshake, then serve until the session ends.
    /// Returns why it ended.
    pub async fn connect_once(&self, ctx: &CancellationToken) -> TunnelError {
        self.set_state(ConnectorState::Connecting);
        let reason = match self.establish(ctx).await {
            Ok((session, incoming)) => {
                self.set_state(ConnectorState::Connected);
                self.serve(ctx, session, incoming).await
            }
            Err(e) => e,
        };
        self.set_state(ConnectorState::Disconnected);
        reason
    }

    fn handshake_request(&self) -> Result<tungstenite::handshake::client::Request, TunnelError> {
        let invalid = |e: &dyn std::fmt::Display| TunnelError::Transport(format!("invalid handshake request: {e}"));

        let mut request = self.options.url.as_str().into_client_request().map_err(|e| invalid(&e))?;
        let headers = request.headers_mut();
        let peer_key = HeaderValue::from_str(&self.options.peer_key).map_err(|e| invalid(&e))?;
        headers.insert(HeaderName::from_bytes(PEER_KEY_HEADER.as_bytes()).map_err(|e| invalid(&e))?, peer_key);
        for (name, value) in &self.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(&e))?;
            let value = HeaderValue::from_str(value).map_err(|e| invalid(&e))?;
            headers.insert(name, value);
        }
        Ok(request)
    }

    async fn establish(&self, ctx: &CancellationToken) -> Result<(Session, mpsc::Receiver<VirtualConn>), TunnelError> {
        let request = self.handshake_request()?;
        let handshake =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, self.options.tls.clone());

        let (socket, response) = tokio::select! {
            res = handshake => res.map_err(handshake_error)?,
            () = ctx.cancelled() => return Err(TunnelError::Cancelled),
        };

        info!(url = %self.options.url, peer = %self.options.peer_key, status = %response.status(), "tunnel connected");
        Ok(Session::agent(
            self.options.peer_key.clone(),
            Transport::from_tungstenite(socket),
            self.options.config,
            ctx,
        ))
    }

    async fn serve(
        &self,
        ctx: &CancellationToken,
        session: Session,
        mut incoming: mpsc::Receiver<VirtualConn>,
    ) -> TunnelError {
        let hook_ctx = ctx.child_token();
        if let Some(hook) = self.on_connect.clone() {
            let session = session.clone();
            let token = hook_ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = hook(token, session.clone()).await {
                    warn!(peer = %session.peer_key(), error = %e, "on_connect hook failed");
                    session.close_with(e);
                }
            });
        }

        let dial_timeout = self.options.config.dial_timeout;
        let mut pipes = JoinSet::new();
        loop {
            tokio::select! {
                conn = incoming.recv() => match conn {
                    Some(conn) => {
                        pipes.spawn(handle_incoming(conn, self.authorizer.clone(), ctx.clone(), dial_timeout));
                    }
                    None => break,
                },
                Some(_) = pipes.join_next(), if !pipes.is_empty() => {}
            }
        }

        hook_ctx.cancel();
        pipes.abort_all();
        session.closed().await
    }
}

/// Run a [`Connector`] until `ctx` is cancelled.
pub async fn connect(
    ctx: &CancellationToken,
    options: ConnectOptions,
    authorizer: AgentAuthorizer,
    on_connect: Option<OnConnect>,
) -> TunnelError {
    let mut connector = Connector::new(options, authorizer);
    if let Some(hook) = on_connect {
        connector = connector.on_connect(hook);
    }
    connector.run(ctx).await
}

fn handshake_error(err: tungstenite::Error) -> TunnelError {
    match err {
        tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
            TunnelError::Auth(format!("server rejected handshake: {}", response.status()))
        }
        tungstenite::Error::Http(response) => {
            TunnelError::Transport(format!("handshake failed with status {}", response.status()))
        }
        other => TunnelError::transport(other),
    }
}

// =============================================================================
// LOCAL DIAL + PIPE
// =============================================================================

trait LocalStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LocalStream for T {}

async fn dial_local(proto: &str, address: &str) -> io::Result<Box<dyn LocalStream>> {
    match proto {
        "tcp" | "tcp4" | "tcp6" => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => Ok(Box::new(tokio::net::UnixStream::connect(address).await?)),
        other => Err(io::Error::new(io::ErrorKind::Unsupported, format!("unsupported network {other:?}"))),
    }
}

async fn handle_incoming(mut conn: VirtualConn, authorizer: AgentAuthorizer, ctx: CancellationToken, dial_timeout: Duration) {
    let proto = conn.proto().to_owned();
    let address = conn.address().to_owned();
    let conn_id = conn.id();

    if !authorizer(&proto, &address) {
        warn!(conn_id, %proto, %address, "connect rejected by authorizer");
        conn.reject(TunnelError::Dial(format!("{proto} {address} is not allowed"))).await;
        return;
    }

    let timeout = conn.dial_deadline().unwrap_or(dial_timeout);
    let local = tokio::select! {
        res = tokio::time::timeout(timeout, dial_local(&proto, &address)) => match res {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(conn_id, %proto, %address, error = %e, "local dial failed");
                conn.reject(TunnelError::Dial(e.to_string())).await;
                return;
            }
            Err(_) => {
                debug!(conn_id, %proto, %address, "local dial timed out");
                conn.reject(TunnelError::Timeout(format!("dial {proto} {address} exceeded {timeout:?}"))).await;
                return;
            }
        },
        () = ctx.cancelled() => {
            conn.reject(TunnelError::Cancelled).await;
            return;
        }
    };

    if let Err(e) = conn.accept().await {
        debug!(conn_id, error = %e, "accept failed");
        return;
    }
    debug!(conn_id, %proto, %address, "connection established");
    pipe(conn, local).await;
}

/// Copy both directions until either one ends, then close the connection.
async fn pipe(conn: VirtualConn, local: Box<dyn LocalStream>) {
    let conn_id = conn.id();
    let closer = conn.closer();
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(conn);
    let (mut local_read, mut local_write) = tokio::io::split(local);

    let mut to_local = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut tunnel_read, &mut local_write).await;
        let _ = local_write.shutdown().await;
        copied
    });
    let mut to_tunnel = tokio::spawn(async move { tokio::io::copy(&mut local_read, &mut tunnel_write).await });

    let (finished, other) = tokio::select! {
        res = &mut to_local => (res, to_tunnel),
        res = &mut to_tunnel => (res, to_local),
    };

    match finished {
        Ok(Ok(bytes)) => {
            debug!(conn_id, bytes, "pipe finished");
            closer.close().await;
        }
        Ok(Err(e)) => {
            debug!(conn_id, error = %e, "pipe failed");
            closer.close_with(TunnelError::from(e)).await;
        }
        Err(e) => closer.close_with(TunnelError::from(io::Error::other(e))).await,
    }
    other.abort();
}

#[cfg(test)]
#[path = "connector_test.rs"]
mod tests;
