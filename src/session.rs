//! Session: one physical WebSocket multiplexing many virtual connections.
//!
//! ARCHITECTURE
//! ============
//! Each session runs three tasks, plus short-lived per-connection drains:
//! - Read pump (`Demux`): the only owner of the `conn id -> connection` map.
//!   It `select!`s over local control events (register / forget / count) and
//!   inbound transport messages, decodes frames, and routes them.
//! - Write pump: the only writer to the transport. Virtual connections, the
//!   read pump and the keepalive supervisor all feed one bounded queue.
//! - Spill drains (on demand): when a connection's inbound buffer is full,
//!   later Data for it is parked and fed in order by a per-connection task.
//!   The read pump never waits on a reader.
//! - Keepalive: pings every `ping_write_interval`; tears the session down
//!   when no pong arrived within `ping_wait_duration`.
//!
//! LIFECYCLE
//! =========
//! `Active -> Closing -> Closed`. Teardown is triggered by a transport error,
//! a protocol error, liveness failure, `close()`, or cancellation of the
//! parent token. The first recorded reason wins and is fanned out to every
//! connection the session owns, exactly once each.
//!
//! A session is role-aware: agents accept inbound Connect frames, servers
//! dial. A Connect frame that names a locally dialed, still pending
//! connection is the far side's acknowledgment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use frames::{Body, ConnectRequest, Frame};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TunnelConfig;
use crate::conn::{ConnCore, ConnState, VirtualConn};
use crate::error::TunnelError;
use crate::wire::{BoxSink, BoxStream, Transport, WireMessage};

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// TYPES
// =============================================================================

/// Which end of the tunnel a session serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Central server; dials through the agent.
    Server,
    /// Agent behind NAT; accepts Connect requests and dials locally.
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Active,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Items drained by the write pump.
pub(crate) enum Outbound {
    Frame(Frame),
    Ping(Bytes),
    Pong(Bytes),
}

/// Local lifecycle events for the read pump.
pub(crate) enum Control {
    /// A locally dialed connection, waiting for the far side's Connect.
    Open {
        core: Arc<ConnCore>,
        inbound: mpsc::Sender<Bytes>,
        ack: oneshot::Sender<Result<(), TunnelError>>,
    },
    /// The connection was closed locally; drop its map entry.
    Forget { conn_id: u64 },
    Count { reply: oneshot::Sender<usize> },
}

/// State shared by the session handle, its tasks, and its connections.
pub(crate) struct SessionShared {
    pub(crate) id: Uuid,
    pub(crate) peer_key: String,
    pub(crate) role: Role,
    pub(crate) config: TunnelConfig,
    next_conn_id: AtomicU64,
    state: AtomicU8,
    pub(crate) outbound: mpsc::Sender<Outbound>,
    pub(crate) control: mpsc::UnboundedSender<Control>,
    /// Cancelled when teardown starts. Child of the caller's token.
    pub(crate) shutdown: CancellationToken,
    /// Cancelled once every connection has been finished.
    done: CancellationToken,
    reason: OnceLock<TunnelError>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Record the teardown reason (first one wins) and start teardown.
    pub(crate) fn fail(&self, err: TunnelError) {
        if self.reason.set(err.clone()).is_ok() {
            if matches!(err, TunnelError::SessionClosed(_) | TunnelError::Cancelled) {
                info!(peer = %self.peer_key, session_id = %self.id, reason = %err, "session closing");
            } else {
                warn!(peer = %self.peer_key, session_id = %self.id, error = %err, "session failed");
            }
        }
        self.set_state(SessionState::Closing);
        self.shutdown.cancel();
    }

    pub(crate) fn close_reason(&self) -> TunnelError {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| TunnelError::SessionClosed(format!("session for peer {} is closed", self.peer_key)))
    }

    /// Queue a frame, waiting for room in the write queue.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), TunnelError> {
        tokio::select! {
            res = self.outbound.send(Outbound::Frame(frame)) => res.map_err(|_| self.close_reason()),
            () = self.shutdown.cancelled() => Err(self.close_reason()),
        }
    }

    /// Error frame for `conn_id`, with the message cut to fit `max_read`.
    pub(crate) fn error_frame(&self, conn_id: u64, err: &TunnelError) -> Frame {
        Frame::error_within(conn_id, &err.to_string(), self.config.max_read)
    }

    /// Queue a frame without waiting; used from `Drop` and the read pump.
    pub(crate) fn send_frame_nowait(&self, frame: Frame) {
        self.send_nowait(Outbound::Frame(frame));
    }

    fn send_nowait(&self, item: Outbound) {
        match self.outbound.try_send(item) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(item)) => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else { return };
                let outbound = self.outbound.clone();
                let shutdown = self.shutdown.clone();
                handle.spawn(async move {
                    tokio::select! {
                        _ = outbound.send(item) => {}
                        () = shutdown.cancelled() => {}
                    }
                });
            }
        }
    }
}

// =============================================================================
// SESSION HANDLE
// =============================================================================

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("peer_key", &self.shared.peer_key)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Start a server-side session over an accepted agent transport.
    #[must_use]
    pub fn server(
        peer_key: impl Into<String>,
        transport: Transport,
        config: TunnelConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self::start(peer_key.into(), Role::Server, transport, config, parent, None)
    }

    /// Start an agent-side session. Inbound Connect requests are delivered as
    /// pending connections on the returned receiver; each must be accepted or
    /// rejected.
    #[must_use]
    pub fn agent(
        peer_key: impl Into<String>,
        transport: Transport,
        config: TunnelConfig,
        parent: &CancellationToken,
    ) -> (Self, mpsc::Receiver<VirtualConn>) {
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue_capacity.max(1));
        let session = Self::start(peer_key.into(), Role::Agent, transport, config, parent, Some(accept_tx));
        (session, accept_rx)
    }

    fn start(
        peer_key: String,
        role: Role,
        transport: Transport,
        config: TunnelConfig,
        parent: &CancellationToken,
        accept_tx: Option<mpsc::Sender<VirtualConn>>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.write_queue_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (pong_tx, pong_rx) = watch::channel(Instant::now());

        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            peer_key,
            role,
            config,
            next_conn_id: AtomicU64::new(1),
            state: AtomicU8::new(SessionState::Active as u8),
            outbound: outbound_tx,
            control: control_tx,
            shutdown: parent.child_token(),
            done: CancellationToken::new(),
            reason: OnceLock::new(),
        });

        info!(peer = %shared.peer_key, session_id = %shared.id, ?role, "session started");

        let demux = Demux {
            shared: shared.clone(),
            conns: HashMap::new(),
            stream: transport.stream,
            control_rx,
            accept_tx,
            pong_tx,
        };
        tokio::spawn(demux.run());
        tokio::spawn(write_pump(shared.clone(), transport.sink, outbound_rx));
        tokio::spawn(keepalive(shared.clone(), pong_rx));

        Self { shared }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn peer_key(&self) -> &str {
        &self.shared.peer_key
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    #[must_use]
    pub fn config(&self) -> &TunnelConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// True once teardown has started.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Active
    }

    /// The recorded teardown reason, if teardown has started.
    #[must_use]
    pub fn close_reason(&self) -> Option<TunnelError> {
        self.shared.reason.get().cloned()
    }

    /// Whether two handles refer to the same session instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Tear the session down. Repeated calls are no-ops.
    pub fn close(&self) {
        self.shared.fail(TunnelError::SessionClosed(format!("session for peer {} closed locally", self.shared.peer_key)));
    }

    /// Tear the session down with a specific reason.
    pub fn close_with(&self, err: TunnelError) {
        self.shared.fail(err);
    }

    /// Wait until teardown has finished every connection; returns the reason.
    pub async fn closed(&self) -> TunnelError {
        self.shared.done.cancelled().await;
        self.shared.close_reason()
    }

    /// Number of connections currently tracked by the read pump.
    pub async fn conn_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.shared.control.send(Control::Count { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Open a virtual connection to `address` on the far side, using the
    /// configured dial timeout.
    ///
    /// # Errors
    ///
    /// See [`Session::dial_with_timeout`].
    pub async fn dial(&self, ctx: &CancellationToken, proto: &str, address: &str) -> Result<VirtualConn, TunnelError> {
        self.dial_with_timeout(ctx, proto, address, self.shared.config.dial_timeout).await
    }

    /// Open a virtual connection, waiting at most `timeout` for the far side
    /// to acknowledge.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Dial`] when the far side rejects or fails the dial, or
    ///   when `proto` or `address` is longer than `max_read` bytes.
    /// - [`TunnelError::Timeout`] when no acknowledgment arrives in time; the
    ///   far side is sent an Error frame for the abandoned connection.
    /// - [`TunnelError::Cancelled`] when `ctx` fires first.
    /// - The session's close reason when it is (or becomes) closed.
    pub async fn dial_with_timeout(
        &self,
        ctx: &CancellationToken,
        proto: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<VirtualConn, TunnelError> {
        if self.is_closed() {
            return Err(self.shared.close_reason());
        }
        // The far side's decoder treats an oversized field as a protocol error.
        let max = self.shared.config.max_read;
        if proto.len() > max || address.len() > max {
            return Err(TunnelError::Dial(format!(
                "dial target too long: proto {} bytes, address {} bytes, limit {max}",
                proto.len(),
                address.len()
            )));
        }

        let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (conn, inbound) = VirtualConn::outgoing(self.shared.clone(), conn_id, proto, address);
        let (ack, ack_rx) = oneshot::channel();
        self.shared
            .control
            .send(Control::Open { core: conn.core().clone(), inbound, ack })
            .map_err(|_| self.shared.close_reason())?;

        let deadline_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        debug!(peer = %self.shared.peer_key, conn_id, proto, address, "dial");
        self.shared.send_frame(Frame::connect(conn_id, proto, address, deadline_ms)).await?;

        tokio::select! {
            res = ack_rx => match res {
                Ok(Ok(())) => Ok(conn),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(self.shared.close_reason()),
            },
            () = tokio::time::sleep(timeout) => {
                let err = TunnelError::Timeout(format!("dial {proto} {address} not acknowledged within {timeout:?}"));
                conn.close_with(err.clone()).await;
                Err(err)
            }
            () = ctx.cancelled() => {
                conn.close_with(TunnelError::Cancelled).await;
                Err(TunnelError::Cancelled)
            }
            () = self.shared.shutdown.cancelled() => Err(self.shared.close_reason()),
        }
    }
}

// =============================================================================
// READ PUMP
// =============================================================================

struct ConnEntry {
    core: Arc<ConnCore>,
    inbound: mpsc::Sender<Bytes>,
    ack: Option<oneshot::Sender<Result<(), TunnelError>>>,
    /// Set while the connection's buffer is full; later Data queues here in
    /// order and a drain task feeds it to the reader.
    spill: Option<mpsc::Sender<Spill>>,
}

/// Inbound items parked behind a full connection buffer.
enum Spill {
    Data(Bytes),
    /// Remote end of stream, applied after the parked data is delivered.
    Finish(Option<TunnelError>),
}

struct Demux {
    shared: Arc<SessionShared>,
    conns: HashMap<u64, ConnEntry>,
    stream: BoxStream,
    control_rx: mpsc::UnboundedReceiver<Control>,
    accept_tx: Option<mpsc::Sender<VirtualConn>>,
    pong_tx: watch::Sender<Instant>,
}

impl Demux {
    async fn run(mut self) {
        let shutdown = self.shared.shutdown.clone();
        let err = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break TunnelError::Cancelled,
                Some(control) = self.control_rx.recv() => self.handle_control(control),
                msg = self.stream.next() => match msg {
                    Some(Ok(msg)) => {
                        if let Err(err) = self.handle_message(msg) {
                            break err;
                        }
                    }
                    Some(Err(err)) => break err,
                    None => break TunnelError::SessionClosed(format!("peer {} closed the stream", self.shared.peer_key)),
                },
            }
        };

        // Only records `err` if nothing else (close(), keepalive) got there first.
        self.shared.fail(err);
        self.teardown();
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Open { core, inbound, ack } => {
                let conn_id = core.id;
                if self.conns.contains_key(&conn_id) {
                    let _ = ack.send(Err(TunnelError::Protocol(format!("connection id {conn_id} already in use"))));
                    return;
                }
                self.conns.insert(conn_id, ConnEntry { core, inbound, ack: Some(ack), spill: None });
            }
            Control::Forget { conn_id } => {
                self.conns.remove(&conn_id);
            }
            Control::Count { reply } => {
                let _ = reply.send(self.conns.len());
            }
        }
    }

    fn handle_message(&mut self, msg: WireMessage) -> Result<(), TunnelError> {
        match msg {
            WireMessage::Binary(data) => {
                let frame = frames::decode_frame(&data, self.shared.config.max_read)?;
                self.handle_frame(frame)
            }
            WireMessage::Ping(data) => {
                self.shared.send_nowait(Outbound::Pong(data));
                Ok(())
            }
            WireMessage::Pong(_) => {
                self.pong_tx.send_replace(Instant::now());
                Ok(())
            }
            WireMessage::Text(_) => {
                warn!(peer = %self.shared.peer_key, "ignoring text message on tunnel session");
                Ok(())
            }
            WireMessage::Close => {
                Err(TunnelError::SessionClosed(format!("peer {} sent websocket close", self.shared.peer_key)))
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let conn_id = frame.conn_id;
        match frame.body {
            Body::Connect(req) => self.on_connect(conn_id, req),
            Body::Data(data) => {
                self.on_data(conn_id, data);
                Ok(())
            }
            Body::Error(message) => {
                self.on_remote_close(conn_id, Some(message));
                Ok(())
            }
            Body::Close(_) => {
                self.on_remote_close(conn_id, None);
                Ok(())
            }
        }
    }

    fn on_connect(&mut self, conn_id: u64, req: ConnectRequest) -> Result<(), TunnelError> {
        if let Some(entry) = self.conns.get_mut(&conn_id) {
            if entry.core.is_local() && entry.core.state() == ConnState::Pending {
                entry.core.set_state(ConnState::Open);
                if let Some(ack) = entry.ack.take() {
                    let _ = ack.send(Ok(()));
                }
                return Ok(());
            }
            return Err(TunnelError::Protocol(format!("duplicate connect for connection {conn_id}")));
        }

        let Some(accept_tx) = self.accept_tx.as_ref() else {
            // Acknowledgment for a dial we already abandoned.
            debug!(peer = %self.shared.peer_key, conn_id, "late connect acknowledgment, closing");
            self.shared.send_frame_nowait(Frame::close(conn_id));
            return Ok(());
        };

        let deadline = (req.deadline_ms > 0).then(|| Duration::from_millis(req.deadline_ms));
        let (conn, inbound) = VirtualConn::incoming(self.shared.clone(), conn_id, req.proto, req.address, deadline);
        let core = conn.core().clone();
        debug!(peer = %self.shared.peer_key, conn_id, proto = %core.proto, address = %core.address, "inbound connect");

        match accept_tx.try_send(conn) {
            Ok(()) => {
                self.conns.insert(conn_id, ConnEntry { core, inbound, ack: None, spill: None });
            }
            Err(TrySendError::Full(conn) | TrySendError::Closed(conn)) => {
                warn!(peer = %self.shared.peer_key, conn_id, "accept queue unavailable, rejecting connect");
                core.mark_remote_closed();
                self.shared.send_frame_nowait(Frame::error_within(
                    conn_id,
                    "agent is not accepting connections",
                    self.shared.config.max_read,
                ));
                drop(conn);
            }
        }
        Ok(())
    }

    fn on_data(&mut self, conn_id: u64, data: Bytes) {
        let Some(entry) = self.conns.get_mut(&conn_id) else {
            warn!(peer = %self.shared.peer_key, conn_id, "data for unknown connection, dropping");
            return;
        };

        if entry.core.is_local() && entry.core.state() == ConnState::Pending {
            // Data before the Connect echo: treat as an implicit acknowledgment.
            entry.core.set_state(ConnState::Open);
            if let Some(ack) = entry.ack.take() {
                let _ = ack.send(Ok(()));
            }
        }

        if let Some(spill) = &entry.spill {
            if spill.is_closed() {
                return;
            }
            // One slot stays free for the Finish marker.
            if spill.capacity() > 1 {
                let _ = spill.try_send(Spill::Data(data));
                return;
            }
            warn!(peer = %self.shared.peer_key, conn_id, "read buffer overflow, closing connection");
            self.fail_conn(conn_id, TunnelError::Timeout(format!("read buffer overflow on connection {conn_id}")));
            return;
        }

        let data = match entry.inbound.try_send(data) {
            Ok(()) | Err(TrySendError::Closed(_)) => return,
            Err(TrySendError::Full(data)) => data,
        };

        let (spill_tx, spill_rx) = mpsc::channel(self.shared.config.read_queue_capacity.max(1) + 1);
        let _ = spill_tx.try_send(Spill::Data(data));
        entry.spill = Some(spill_tx);
        tokio::spawn(drain_spill(self.shared.clone(), entry.core.clone(), entry.inbound.clone(), spill_rx));
    }

    fn on_remote_close(&mut self, conn_id: u64, message: Option<String>) {
        let Some(mut entry) = self.conns.remove(&conn_id) else {
            warn!(peer = %self.shared.peer_key, conn_id, "close for unknown connection, dropping");
            return;
        };

        entry.core.mark_remote_closed();
        let pending = entry.core.state() == ConnState::Pending;
        let err = message.map(|m| if pending { TunnelError::Dial(m) } else { TunnelError::Remote(m) });
        debug!(peer = %self.shared.peer_key, conn_id, error = ?err, "remote closed connection");

        if let Some(ack) = entry.ack.take() {
            let _ = ack.send(Err(err
                .clone()
                .unwrap_or_else(|| TunnelError::Dial("connection closed by peer before it was established".into()))));
        }
        if let Some(spill) = entry.spill.take() {
            if spill.try_send(Spill::Finish(err.clone())).is_ok() {
                return;
            }
        }
        entry.core.finish(err);
    }

    /// Close one connection from the read pump's side and tell the peer.
    fn fail_conn(&mut self, conn_id: u64, err: TunnelError) {
        let Some(mut entry) = self.conns.remove(&conn_id) else { return };
        if entry.core.claim_close_frame() {
            self.shared.send_frame_nowait(self.shared.error_frame(conn_id, &err));
        }
        if let Some(ack) = entry.ack.take() {
            let _ = ack.send(Err(err.clone()));
        }
        entry.core.finish(Some(err));
    }

    fn teardown(&mut self) {
        let reason = self.shared.close_reason();

        // Connections registered after the loop stopped.
        while let Ok(control) = self.control_rx.try_recv() {
            match control {
                Control::Open { core, ack, .. } => {
                    core.mark_remote_closed();
                    core.finish(Some(reason.clone()));
                    let _ = ack.send(Err(reason.clone()));
                }
                Control::Forget { conn_id } => {
                    self.conns.remove(&conn_id);
                }
                Control::Count { reply } => {
                    let _ = reply.send(0);
                }
            }
        }

        let count = self.conns.len();
        for (_, mut entry) in self.conns.drain() {
            entry.core.mark_remote_closed();
            if let Some(ack) = entry.ack.take() {
                let _ = ack.send(Err(reason.clone()));
            }
            entry.core.finish(Some(reason.clone()));
        }
        self.accept_tx = None;

        self.shared.set_state(SessionState::Closed);
        self.shared.done.cancel();
        info!(peer = %self.shared.peer_key, session_id = %self.shared.id, connections = count, "session closed");
    }
}

/// Feed parked Data to a connection whose buffer was full, without holding up
/// the read pump. The connection fails if its reader makes no room within
/// `read_buffer_wait`.
async fn drain_spill(
    shared: Arc<SessionShared>,
    core: Arc<ConnCore>,
    inbound: mpsc::Sender<Bytes>,
    mut spill_rx: mpsc::Receiver<Spill>,
) {
    let wait = shared.config.read_buffer_wait;
    while let Some(item) = spill_rx.recv().await {
        let data = match item {
            Spill::Data(data) => data,
            Spill::Finish(err) => {
                core.finish(err);
                return;
            }
        };

        let sent = tokio::select! {
            res = tokio::time::timeout(wait, inbound.send(data)) => res,
            () = core.finished() => return,
        };
        match sent {
            Ok(Ok(())) => {}
            // Reader dropped.
            Ok(Err(_)) => return,
            Err(_) => {
                warn!(peer = %shared.peer_key, conn_id = core.id, "read buffer full, closing connection");
                let err = TunnelError::Timeout(format!("read buffer full for {wait:?}"));
                if core.claim_close_frame() {
                    shared.send_frame_nowait(shared.error_frame(core.id, &err));
                }
                let _ = shared.control.send(Control::Forget { conn_id: core.id });
                core.finish(Some(err));
                return;
            }
        }
    }
}

// =============================================================================
// WRITE PUMP
// =============================================================================

async fn write_pump(shared: Arc<SessionShared>, mut sink: BoxSink, mut rx: mpsc::Receiver<Outbound>) {
    loop {
        let item = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let msg = match item {
            Outbound::Frame(frame) => WireMessage::Binary(Bytes::from(frames::encode_frame(&frame))),
            Outbound::Ping(data) => WireMessage::Ping(data),
            Outbound::Pong(data) => WireMessage::Pong(data),
        };

        tokio::select! {
            res = sink.send(msg) => {
                if let Err(err) = res {
                    shared.fail(err);
                    break;
                }
            }
            () = shared.shutdown.cancelled() => break,
        }
    }

    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
        let _ = sink.send(WireMessage::Close).await;
        let _ = sink.close().await;
    })
    .await;
    debug!(peer = %shared.peer_key, session_id = %shared.id, "write pump stopped");
}

// =============================================================================
// KEEPALIVE
// =============================================================================

async fn keepalive(shared: Arc<SessionShared>, pong_rx: watch::Receiver<Instant>) {
    let mut ticker = tokio::time::interval(shared.config.ping_write_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let last_pong = *pong_rx.borrow();
        let wait = shared.config.ping_wait_duration;
        if last_pong.elapsed() > wait {
            shared.fail(TunnelError::Timeout(format!("no pong received within {wait:?}")));
            return;
        }

        if shared.outbound.try_send(Outbound::Ping(Bytes::new())).is_err() {
            debug!(peer = %shared.peer_key, "write queue full, skipping ping");
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
