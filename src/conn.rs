//! Virtual connection: one logical byte stream inside a session.
//!
//! DESIGN
//! ======
//! The session's read pump owns routing; a connection only holds:
//! - a bounded receiver of inbound Data payloads (the per-connection buffer),
//! - a `PollSender` into the session's write queue (writes wait for room),
//! - a shared [`ConnCore`] with the lifecycle state, the terminal error and a
//!   cancellation token that wakes blocked readers.
//!
//! Closing is claim-once: whichever side first claims the close flag (local
//! close, `Drop`, remote Close/Error, or session teardown) decides whether a
//! Close or Error frame goes out, so the peer sees at most one.
//!
//! Bytes that arrived before a remote Close are still delivered; the reader
//! sees EOF only after draining them. A remote Error (or a session failure)
//! surfaces as an error from the read that would otherwise block.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use frames::Frame;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, PollSender, WaitForCancellationFutureOwned};
use tracing::debug;
use uuid::Uuid;

use crate::error::TunnelError;
use crate::session::{Control, Outbound, SessionShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Dialed but not yet acknowledged, or received but not yet accepted.
    Pending = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

// =============================================================================
// SHARED CORE
// =============================================================================

/// Lifecycle state shared between a connection handle and the read pump.
pub(crate) struct ConnCore {
    pub(crate) id: u64,
    pub(crate) proto: String,
    pub(crate) address: String,
    local: bool,
    state: AtomicU8,
    close_claimed: AtomicBool,
    reason: OnceLock<TunnelError>,
    closed: CancellationToken,
}

impl ConnCore {
    fn new(id: u64, proto: String, address: String, local: bool) -> Self {
        Self {
            id,
            proto,
            address,
            local,
            state: AtomicU8::new(ConnState::Pending as u8),
            close_claimed: AtomicBool::new(false),
            reason: OnceLock::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Dialed from this side of the tunnel.
    pub(crate) fn is_local(&self) -> bool {
        self.local
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// States only move forward.
    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Returns true for exactly one caller: the one that sends the close frame.
    pub(crate) fn claim_close_frame(&self) -> bool {
        !self.close_claimed.swap(true, Ordering::AcqRel)
    }

    /// The peer already knows the connection is gone; never send it a frame.
    pub(crate) fn mark_remote_closed(&self) {
        self.close_claimed.store(true, Ordering::Release);
        self.set_state(ConnState::Closing);
    }

    /// Record the terminal error (first one wins) and wake blocked readers.
    pub(crate) fn finish(&self, err: Option<TunnelError>) {
        if let Some(err) = err {
            let _ = self.reason.set(err);
        }
        self.set_state(ConnState::Closed);
        self.closed.cancel();
    }

    pub(crate) fn reason(&self) -> Option<TunnelError> {
        self.reason.get().cloned()
    }

    fn is_finished(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been finished.
    pub(crate) async fn finished(&self) {
        self.closed.cancelled().await;
    }
}

// =============================================================================
// CLOSE HANDLE
// =============================================================================

/// Cloneable handle that closes a connection from another task, e.g. while
/// the connection itself is split into pipe halves.
#[derive(Clone)]
pub struct ConnCloser {
    core: Arc<ConnCore>,
    session: Arc<SessionShared>,
}

impl ConnCloser {
    /// Close gracefully; the peer sees EOF after buffered data. Idempotent.
    pub async fn close(&self) {
        self.shutdown(None).await;
    }

    /// Close with an error; the peer's reads fail with it. Idempotent.
    pub async fn close_with(&self, err: TunnelError) {
        self.shutdown(Some(err)).await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.is_finished()
    }

    async fn shutdown(&self, err: Option<TunnelError>) {
        let claimed = self.core.claim_close_frame();
        if claimed {
            self.core.set_state(ConnState::Closing);
            let frame = match &err {
                Some(err) => self.session.error_frame(self.core.id, err),
                None => Frame::close(self.core.id),
            };
            // A dead session already told the peer everything it needs to know.
            let _ = self.session.send_frame(frame).await;
            debug!(peer = %self.session.peer_key, conn_id = self.core.id, error = ?err, "connection closed locally");
        }
        let _ = self.session.control.send(Control::Forget { conn_id: self.core.id });
        // A connection that was already closed keeps its original outcome.
        self.core.finish(if claimed { err } else { None });
    }
}

// =============================================================================
// VIRTUAL CONNECTION
// =============================================================================

/// One logical bidirectional byte stream multiplexed over a session.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]; `poll_shutdown` closes the
/// whole connection. The inherent [`read`](Self::read) and
/// [`write`](Self::write) return [`TunnelError`] directly.
pub struct VirtualConn {
    core: Arc<ConnCore>,
    session: Arc<SessionShared>,
    inbound: mpsc::Receiver<Bytes>,
    writer: PollSender<Outbound>,
    pending: Bytes,
    read_done: bool,
    closed_wait: Pin<Box<WaitForCancellationFutureOwned>>,
    deadline: Option<Pin<Box<Sleep>>>,
    dial_deadline: Option<Duration>,
}

impl std::fmt::Debug for VirtualConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualConn")
            .field("id", &self.core.id)
            .field("proto", &self.core.proto)
            .field("address", &self.core.address)
            .field("state", &self.core.state())
            .finish_non_exhaustive()
    }
}

impl VirtualConn {
    fn new(
        session: Arc<SessionShared>,
        core: ConnCore,
        dial_deadline: Option<Duration>,
    ) -> (Self, mpsc::Sender<Bytes>) {
        let core = Arc::new(core);
        let (inbound_tx, inbound) = mpsc::channel(session.config.read_queue_capacity.max(1));
        let closed_wait = Box::pin(core.closed.clone().cancelled_owned());
        let writer = PollSender::new(session.outbound.clone());
        let conn = Self {
            core,
            session,
            inbound,
            writer,
            pending: Bytes::new(),
            read_done: false,
            closed_wait,
            deadline: None,
            dial_deadline,
        };
        (conn, inbound_tx)
    }

    pub(crate) fn outgoing(
        session: Arc<SessionShared>,
        id: u64,
        proto: &str,
        address: &str,
    ) -> (Self, mpsc::Sender<Bytes>) {
        Self::new(session, ConnCore::new(id, proto.to_owned(), address.to_owned(), true), None)
    }

    pub(crate) fn incoming(
        session: Arc<SessionShared>,
        id: u64,
        proto: String,
        address: String,
        dial_deadline: Option<Duration>,
    ) -> (Self, mpsc::Sender<Bytes>) {
        Self::new(session, ConnCore::new(id, proto, address, false), dial_deadline)
    }

    pub(crate) fn core(&self) -> &Arc<ConnCore> {
        &self.core
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.core.id
    }

    #[must_use]
    pub fn proto(&self) -> &str {
        &self.core.proto
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.core.address
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        self.core.state()
    }

    #[must_use]
    pub fn peer_key(&self) -> &str {
        &self.session.peer_key
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    /// Dial deadline carried by the Connect request, if the dialer set one.
    #[must_use]
    pub fn dial_deadline(&self) -> Option<Duration> {
        self.dial_deadline
    }

    #[must_use]
    pub fn closer(&self) -> ConnCloser {
        ConnCloser { core: self.core.clone(), session: self.session.clone() }
    }

    /// Fail pending and future reads and writes with a timeout once
    /// `deadline` passes. `None` clears it.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Acknowledge an incoming Connect after the local dial succeeded.
    ///
    /// # Errors
    ///
    /// Returns the session's close reason if the acknowledgment can't be
    /// queued, or [`TunnelError::Closed`] if the connection is already gone.
    pub async fn accept(&mut self) -> Result<(), TunnelError> {
        if self.core.is_local() || self.core.state() != ConnState::Pending {
            return Ok(());
        }
        if self.core.is_finished() {
            return Err(self.core.reason().unwrap_or(TunnelError::Closed));
        }
        self.session
            .send_frame(Frame::connect(self.core.id, self.core.proto.as_str(), self.core.address.as_str(), 0))
            .await?;
        self.core.set_state(ConnState::Open);
        Ok(())
    }

    /// Refuse an incoming Connect; the dialer's call fails with `err`.
    pub async fn reject(self, err: TunnelError) {
        self.close_with(err).await;
    }

    /// Close gracefully. Idempotent.
    pub async fn close(&self) {
        self.closer().close().await;
    }

    /// Close with an error delivered to the peer. Idempotent.
    pub async fn close_with(&self, err: TunnelError) {
        self.closer().close_with(err).await;
    }

    /// Read into `buf`; `Ok(0)` is EOF.
    ///
    /// # Errors
    ///
    /// The remote error, session failure, or deadline timeout that ended the
    /// connection.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let mut read_buf = ReadBuf::new(buf);
        std::future::poll_fn(|cx| self.poll_read_inner(cx, &mut read_buf)).await?;
        Ok(read_buf.filled().len())
    }

    /// Write up to one frame's worth of `buf`; returns bytes accepted.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Closed`] after close, the connection's terminal error,
    /// or a deadline timeout.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, TunnelError> {
        std::future::poll_fn(|cx| self.poll_write_inner(cx, buf)).await
    }

    // -------------------------------------------------------------------------
    // Polling internals
    // -------------------------------------------------------------------------

    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<TunnelError> {
        match self.deadline.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).map(|()| TunnelError::Timeout("i/o deadline exceeded".into())),
            None => Poll::Pending,
        }
    }

    fn terminal_read(&self) -> Result<(), TunnelError> {
        match self.core.reason() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn copy_pending(&mut self, buf: &mut ReadBuf<'_>) {
        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending.split_to(n));
    }

    fn poll_read_inner(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<Result<(), TunnelError>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !self.pending.is_empty() {
            self.copy_pending(buf);
            return Poll::Ready(Ok(()));
        }
        if self.read_done {
            return Poll::Ready(self.terminal_read());
        }

        loop {
            match self.inbound.poll_recv(cx) {
                Poll::Ready(Some(chunk)) if chunk.is_empty() => {}
                Poll::Ready(Some(chunk)) => {
                    self.pending = chunk;
                    self.copy_pending(buf);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(None) => {
                    self.read_done = true;
                    return Poll::Ready(self.terminal_read());
                }
                Poll::Pending => break,
            }
        }

        // The buffer is empty; a finished connection has nothing more to give.
        if self.closed_wait.as_mut().poll(cx).is_ready() {
            self.read_done = true;
            return Poll::Ready(self.terminal_read());
        }
        if let Poll::Ready(err) = self.poll_deadline(cx) {
            return Poll::Ready(Err(err));
        }
        Poll::Pending
    }

    fn write_error(&self) -> Option<TunnelError> {
        if self.core.is_finished() || matches!(self.core.state(), ConnState::Closing | ConnState::Closed) {
            return Some(self.core.reason().unwrap_or(TunnelError::Closed));
        }
        None
    }

    fn poll_write_inner(&mut self, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize, TunnelError>> {
        if let Some(err) = self.write_error() {
            return Poll::Ready(Err(err));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match self.writer.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Err(self.session.close_reason())),
            Poll::Pending => {
                if let Poll::Ready(err) = self.poll_deadline(cx) {
                    return Poll::Ready(Err(err));
                }
                return Poll::Pending;
            }
        }

        let n = data.len().min(self.session.config.max_read);
        let frame = Frame::data(self.core.id, Bytes::copy_from_slice(&data[..n]));
        if self.writer.send_item(Outbound::Frame(frame)).is_err() {
            return Poll::Ready(Err(self.session.close_reason()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_close_inner(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TunnelError>> {
        if !self.core.close_claimed.load(Ordering::Acquire) {
            let reserved = ready!(self.writer.poll_reserve(cx)).is_ok();
            if self.core.claim_close_frame() {
                self.core.set_state(ConnState::Closing);
                if reserved {
                    let _ = self.writer.send_item(Outbound::Frame(Frame::close(self.core.id)));
                }
            } else if reserved {
                self.writer.abort_send();
            }
        }
        let _ = self.session.control.send(Control::Forget { conn_id: self.core.id });
        self.core.finish(None);
        Poll::Ready(Ok(()))
    }
}

impl Drop for VirtualConn {
    fn drop(&mut self) {
        if self.core.claim_close_frame() {
            self.session.send_frame_nowait(Frame::close(self.core.id));
        }
        let _ = self.session.control.send(Control::Forget { conn_id: self.core.id });
        self.core.finish(None);
    }
}

impl AsyncRead for VirtualConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_read_inner(cx, buf).map_err(io::Error::from)
    }
}

impl AsyncWrite for VirtualConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().poll_write_inner(cx, buf).map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the write pump as soon as they are accepted.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_close_inner(cx).map_err(io::Error::from)
    }
}

#[cfg(test)]
#[path = "conn_test.rs"]
mod tests;
