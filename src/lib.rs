//! # tokio-realtime
//!
//! Async Rust client for Centrifugo-style real-time pub/sub servers.
//!
//! The client maintains a single logical session over a long-lived
//! bidirectional transport: it authenticates with a token, multiplexes
//! request/reply commands and channel subscriptions over that session,
//! dispatches server pushes in wire order, keeps the connection alive with
//! ping/pong in both directions, and transparently reconnects, recovering
//! missed publications from the last known stream position.
//!
//! ## Quick start
//!
//! ```rust
//! use tokio_realtime::client::Client;
//! use tokio_realtime::config::Config;
//!
//! let config = Config::new().use_json().with_token("token");
//! // let client = Client::new("ws://localhost:8000/connection/websocket", config);
//! // client.connect().await?;
//! //
//! // let sub = client.new_subscription("news");
//! // sub.on_publication(|event| println!("{:?}", event.data));
//! // sub.subscribe().await?;
//! //
//! // client.publish("news", br#"{"hello":"world"}"#.to_vec()).await?;
//! ```
//!
//! ## Modules
//!
//! - [`client`]: session engine and the public client surface
//! - [`subscription`]: per-channel subscription state machine
//! - [`transport`]: transport capability and the WebSocket implementation
//! - [`protocol`]: command/reply/push model over the wire envelopes
//! - [`config`]: options, keepalive windows, token providers, backoff
//! - [`events`]: payloads delivered to callbacks
//! - [`errors`]: error taxonomy and close reasons

pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod protocol;
pub mod subscription;
pub mod transport;
pub mod utils;
