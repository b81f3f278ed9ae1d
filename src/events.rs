//! Event payloads delivered to client and subscription callbacks.

use std::collections::HashMap;

use crate::client::State;
use crate::errors::CloseReason;
use crate::protocol::{ClientInfo, StreamPosition};

/// Passed to `Client::on_state` on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateEvent {
    pub state: State,
    pub prev_state: State,
}

/// Passed to `Client::on_connected` after a successful handshake.
#[derive(Debug, Clone)]
pub struct ConnectedEvent {
    /// Client identifier assigned by the server.
    pub client: String,
    /// Server version string.
    pub version: String,
    /// Name of the transport that carried the handshake.
    pub transport: String,
    pub data: Vec<u8>,
}

/// Passed to `Client::on_disconnected` once per distinct disconnect cause.
#[derive(Debug, Clone)]
pub struct DisconnectedEvent {
    pub code: u32,
    pub reason: String,
}

/// Passed to `Client::on_close` when the session reaches its terminal state.
#[derive(Debug, Clone)]
pub struct ClosedEvent {
    pub reason: CloseReason,
}

/// A publication delivered on a channel.
#[derive(Debug, Clone)]
pub struct PublicationEvent {
    pub channel: String,
    pub data: Vec<u8>,
    pub offset: u64,
    pub info: Option<ClientInfo>,
    pub tags: HashMap<String, String>,
}

/// Someone joined a channel with join/leave notifications enabled.
#[derive(Debug, Clone)]
pub struct JoinEvent {
    pub channel: String,
    pub info: Option<ClientInfo>,
}

/// Someone left a channel with join/leave notifications enabled.
#[derive(Debug, Clone)]
pub struct LeaveEvent {
    pub channel: String,
    pub info: Option<ClientInfo>,
}

/// A connection-scoped message outside any channel.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: Vec<u8>,
}

/// Passed to subscription `on_subscribed` callbacks and to the client-level
/// `on_subscribed` for server-side subscriptions.
#[derive(Debug, Clone)]
pub struct SubscribedEvent {
    pub channel: String,
    /// Whether the server replayed the exact gap since the supplied
    /// stream position.
    pub recovered: bool,
    pub position: Option<StreamPosition>,
    pub data: Vec<u8>,
}

/// Passed to subscription `on_unsubscribed` callbacks and to the
/// client-level `on_unsubscribed` for server-side subscriptions.
#[derive(Debug, Clone)]
pub struct UnsubscribedEvent {
    pub channel: String,
    pub code: u32,
    pub reason: String,
}
