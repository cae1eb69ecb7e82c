//! Reverse multiplexed tunnel.
//!
//! SYSTEM CONTEXT
//! ==============
//! Agents behind NAT or firewalls open one outbound WebSocket to a central
//! server. The server then dials arbitrary `(proto, address)` pairs *through*
//! an agent: each dial becomes a virtual connection multiplexed over that
//! agent's single socket, and the agent connects to the real address on its
//! own network.
//!
//! - [`server`]: axum upgrade handler, authorization, session registration.
//! - [`registry`]: peer key -> live session; `dial` by peer key.
//! - [`session`]: one socket, many connections; read/write pumps, keepalive.
//! - [`conn`]: the virtual connection (`AsyncRead` + `AsyncWrite`).
//! - [`connector`]: the agent's reconnect loop and local dialer.
//!
//! The binary frame codec lives in the `frames` crate.

pub mod backoff;
pub mod config;
pub mod conn;
pub mod connector;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod wire;

pub use backoff::BackoffPolicy;
pub use config::TunnelConfig;
pub use conn::{ConnCloser, ConnState, VirtualConn};
pub use connector::{AgentAuthorizer, ConnectOptions, Connector, ConnectorState, OnConnect, connect};
pub use error::TunnelError;
pub use registry::{Dialer, Registry};
pub use server::{Authorizer, HeaderAuthorizer, TunnelServer};
pub use session::{Role, Session, SessionState};
pub use wire::{Transport, WireMessage};
