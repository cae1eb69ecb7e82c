//! Local TCP port forward through an agent.
//!
//! Each connection accepted on `FORWARD_LISTEN` is dialed through the peer
//! `FORWARD_PEER` to `FORWARD_ADDR` on the agent's network and piped both
//! ways. The dial goes through a [`Dialer`], so the forward keeps working
//! across agent reconnects.

use std::net::SocketAddr;

use remotedialer::{Dialer, Registry};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    pub listen: String,
    pub peer: String,
    pub address: String,
    pub proto: String,
}

impl ForwardConfig {
    /// - `FORWARD_LISTEN`: local bind address, e.g. `127.0.0.1:15432`
    /// - `FORWARD_PEER`: peer key of the agent
    /// - `FORWARD_ADDR`: address on the agent's side
    /// - `FORWARD_PROTO`: default `tcp`
    ///
    /// `None` unless the first three are all set.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        Some(Self {
            listen: get("FORWARD_LISTEN")?,
            peer: get("FORWARD_PEER")?,
            address: get("FORWARD_ADDR")?,
            proto: get("FORWARD_PROTO").unwrap_or_else(|| "tcp".to_owned()),
        })
    }
}

/// Accept until `ctx` is cancelled.
///
/// # Errors
///
/// Returns the bind or accept error that stopped the listener.
pub async fn run(config: ForwardConfig, registry: Registry, ctx: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(&config.listen).await?;
    info!(listen = %config.listen, peer = %config.peer, address = %config.address, "port forward listening");

    let dialer = registry.dialer(config.peer.clone());
    loop {
        let (socket, remote) = tokio::select! {
            () = ctx.cancelled() => return Ok(()),
            res = listener.accept() => res?,
        };
        tokio::spawn(forward_one(socket, remote, dialer.clone(), config.clone(), ctx.clone()));
    }
}

async fn forward_one(mut socket: TcpStream, remote: SocketAddr, dialer: Dialer, config: ForwardConfig, ctx: CancellationToken) {
    let mut conn = match dialer.dial(&ctx, &config.proto, &config.address).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%remote, peer = %dialer.peer_key(), error = %e, "forward dial failed");
            return;
        }
    };
    let conn_id = conn.id();
    debug!(%remote, conn_id, "forwarding");

    match tokio::io::copy_bidirectional(&mut socket, &mut conn).await {
        Ok((sent, received)) => debug!(%remote, conn_id, sent, received, "forward finished"),
        Err(e) => debug!(%remote, conn_id, error = %e, "forward failed"),
    }
    conn.close().await;
}

#[cfg(test)]
#[path = "forward_test.rs"]
mod tests;
