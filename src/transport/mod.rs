//! Transport capability used by the session engine.
//!
//! The engine never touches sockets directly. A [`Transport`] opens a
//! connection to an endpoint and hands back a framed sink/stream pair; the
//! engine owns the connection exclusively and replaces it on reconnect. The
//! crate ships a WebSocket implementation; anything that can move frames in
//! both directions (or emulate the upstream side, see
//! [`Transport::emulation`]) can be plugged in instead.

pub mod websocket;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Sink, Stream};
use thiserror::Error;

use crate::config::Protocol;

pub use websocket::WebSocketTransport;

/// One transport-level frame. Text frames carry the JSON protocol, binary
/// frames the Protobuf protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<CloseFrame>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport not supported in this environment")]
    Unsupported,
    #[error("invalid endpoint: {0}")]
    BadEndpoint(String),
    #[error("failed to open transport: {0}")]
    Connect(#[source] anyhow::Error),
    #[error("transport read failed: {0}")]
    Read(String),
    #[error("transport write failed: {0}")]
    Write(String),
    #[error("transport closed")]
    Closed,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;
pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send>>;

/// An open transport connection, exclusively owned by one session.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// A way of reaching the server.
pub trait Transport: Send + Sync + 'static {
    /// Transport name used in diagnostics and connected events.
    fn name(&self) -> &str;

    /// Whether the transport can work in this environment at all.
    fn supported(&self) -> bool {
        true
    }

    /// True for transports that cannot carry upstream frames over the
    /// connection itself. For those the encoded connect command is passed
    /// as `initial_frame` and its reply arrives on the inbound stream,
    /// while later upstream frames go through a side channel behind the
    /// sink.
    fn emulation(&self) -> bool {
        false
    }

    /// Opens a connection to `endpoint`.
    fn connect(
        &self,
        endpoint: &str,
        protocol: Protocol,
        initial_frame: Option<Frame>,
    ) -> ConnectFuture;
}

/// An endpoint paired with the transport used to reach it. The session
/// engine walks its endpoint list in order until one of them opens.
#[derive(Clone)]
pub struct Endpoint {
    pub url: String,
    pub transport: Arc<dyn Transport>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Endpoint { url: url.into(), transport }
    }

    /// Default WebSocket endpoint.
    pub fn websocket(url: impl Into<String>) -> Self {
        Endpoint::new(url, Arc::new(WebSocketTransport))
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("transport", &self.transport.name())
            .finish()
    }
}
