//! WebSocket message adapters.
//!
//! The server accepts agents through axum's upgrade while the agent dials
//! out with `tokio-tungstenite`. Both sides expose a different `Message`
//! type, so a session runs over a boxed [`Transport`] speaking
//! [`WireMessage`] and each side converts at the edge.

use std::pin::Pin;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;

use crate::error::TunnelError;

/// Transport-level message, independent of the WebSocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// One encoded tunnel frame.
    Binary(Bytes),
    /// Not used by the protocol; logged and ignored on receipt.
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

pub type BoxSink = Pin<Box<dyn Sink<WireMessage, Error = TunnelError> + Send>>;
pub type BoxStream = Pin<Box<dyn Stream<Item = Result<WireMessage, TunnelError>> + Send>>;

/// The two halves of one physical duplex stream.
pub struct Transport {
    pub sink: BoxSink,
    pub stream: BoxStream,
}

impl Transport {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<WireMessage, Error = TunnelError> + Send + 'static,
        R: Stream<Item = Result<WireMessage, TunnelError>> + Send + 'static,
    {
        Self { sink: Box::pin(sink), stream: Box::pin(stream) }
    }

    /// Wrap a socket accepted through axum's `WebSocketUpgrade`.
    #[must_use]
    pub fn from_axum(socket: axum::extract::ws::WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(|e| TunnelError::transport(e))
            .with(|msg: WireMessage| future::ready(Ok::<_, TunnelError>(axum::extract::ws::Message::from(msg))));
        let stream = stream.map(|msg| msg.map(WireMessage::from).map_err(|e| TunnelError::transport(e)));
        Self::new(sink, stream)
    }

    /// Wrap a client-side `tokio-tungstenite` stream.
    pub fn from_tungstenite<T>(socket: WebSocketStream<T>) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(|e| TunnelError::transport(e))
            .with(|msg: WireMessage| future::ready(Ok::<_, TunnelError>(tungstenite::Message::from(msg))));
        let stream = stream.map(|msg| msg.map(WireMessage::from).map_err(|e| TunnelError::transport(e)));
        Self::new(sink, stream)
    }
}

// =============================================================================
// AXUM
// =============================================================================

impl From<axum::extract::ws::Message> for WireMessage {
    fn from(msg: axum::extract::ws::Message) -> Self {
        use axum::extract::ws::Message;
        match msg {
            Message::Binary(data) => Self::Binary(data),
            Message::Text(text) => Self::Text(text.as_str().to_owned()),
            Message::Ping(data) => Self::Ping(data),
            Message::Pong(data) => Self::Pong(data),
            Message::Close(_) => Self::Close,
        }
    }
}

impl From<WireMessage> for axum::extract::ws::Message {
    fn from(msg: WireMessage) -> Self {
        match msg {
            WireMessage::Binary(data) => Self::Binary(data),
            WireMessage::Text(text) => Self::Text(text.into()),
            WireMessage::Ping(data) => Self::Ping(data),
            WireMessage::Pong(data) => Self::Pong(data),
            WireMessage::Close => Self::Close(None),
        }
    }
}

// =============================================================================
// TUNGSTENITE
// =============================================================================

impl From<tungstenite::Message> for WireMessage {
    fn from(msg: tungstenite::Message) -> Self {
        use tungstenite::Message;
        match msg {
            Message::Binary(data) => Self::Binary(data),
            Message::Text(text) => Self::Text(text.as_str().to_owned()),
            Message::Ping(data) => Self::Ping(data),
            Message::Pong(data) => Self::Pong(data),
            // Raw frames only surface when reading with a custom config; treat
            // their payload as binary.
            Message::Frame(frame) => Self::Binary(Bytes::copy_from_slice(frame.payload())),
            Message::Close(_) => Self::Close,
        }
    }
}

impl From<WireMessage> for tungstenite::Message {
    fn from(msg: WireMessage) -> Self {
        match msg {
            WireMessage::Binary(data) => Self::Binary(data),
            WireMessage::Text(text) => Self::Text(text.into()),
            WireMessage::Ping(data) => Self::Ping(data),
            WireMessage::Pong(data) => Self::Pong(data),
            WireMessage::Close => Self::Close(None),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "wire_test.rs"]
mod tests;
