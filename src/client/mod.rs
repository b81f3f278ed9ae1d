//! Client public surface.
//!
//! A [`Client`] maintains one logical session to the server: it connects,
//! authenticates with a token, multiplexes channel subscriptions over the
//! session, transparently reconnects, and recovers missed publications.
//! Request/reply methods issued while the session is not yet connected
//! queue with a deadline and go out once the session reaches `Connected`.
//!
//! ```rust
//! use tokio_realtime::client::Client;
//! use tokio_realtime::config::Config;
//!
//! let config = Config::new().use_json().with_token("secret");
//! // let client = Client::new("ws://localhost:8000/connection/websocket", config);
//! // client.connect().await?;
//! // let sub = client.new_subscription("news");
//! // sub.subscribe().await?;
//! ```

pub(crate) mod connection;
pub(crate) mod handshake;
pub(crate) mod inner;
pub(crate) mod io;
pub(crate) mod subscription_handler;
pub mod types;

use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use slotmap::SlotMap;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::errors::{CloseReason, ReplyError};
use crate::events::{
    ClosedEvent, ConnectedEvent, DisconnectedEvent, JoinEvent, LeaveEvent, MessageEvent,
    PublicationEvent, StateEvent, SubscribedEvent, UnsubscribedEvent,
};
use crate::protocol::{
    Command, HistoryRequest, HistoryResult, PresenceRequest, PresenceResult,
    PresenceStatsRequest, PresenceStatsResult, PublishRequest, Reply, RpcRequest, SendRequest,
    StreamPosition,
};
use crate::subscription::{Subscription, SubscriptionInner, SubscriptionOptions};
use crate::transport::Endpoint;
use crate::{errors as crate_errors, subscription};

use inner::ClientInner;
use io::ControlMessage;

pub use crate::errors::RequestError;
pub use types::State;

/// A future you can await for the result, or drop if you do not care.
pub struct FutureResult<T>(pub(crate) T);

impl<T, R> IntoFuture for FutureResult<T>
where
    T: Future<Output = R>,
{
    type Output = R;
    type IntoFuture = T;

    fn into_future(self) -> Self::IntoFuture {
        self.0
    }
}

/// Options for [`Client::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    pub limit: i32,
    pub since: Option<StreamPosition>,
    pub reverse: bool,
}

/// High-level client handle. Cheap to clone; all operations are
/// internally synchronized.
#[derive(Clone)]
pub struct Client(pub(crate) Arc<Mutex<ClientInner>>);

impl Client {
    /// Creates a client talking WebSocket to `url`.
    pub fn new(url: &str, config: Config) -> Self {
        Self::with_endpoints(vec![Endpoint::websocket(url)], config)
    }

    /// Creates a client with an explicit endpoint list. Endpoints are
    /// probed in order until one opens; entries whose transport closed
    /// before ever opening advance the walk with zero delay.
    ///
    /// # Panics
    ///
    /// Panics when `endpoints` is empty.
    pub fn with_endpoints(endpoints: Vec<Endpoint>, config: Config) -> Self {
        assert!(!endpoints.is_empty(), "at least one endpoint is required");

        let rt = config
            .runtime
            .unwrap_or_else(tokio::runtime::Handle::current);

        Self(Arc::new(Mutex::new(ClientInner {
            rt,
            endpoints,
            endpoint_index: 0,
            ever_opened: false,
            reconnect_attempt: 0,
            state: State::Disconnected,
            token: config.token,
            connect_data: config.data,
            name: config.name,
            version: config.version,
            protocol: config.protocol,
            reconnect_strategy: config.reconnect_strategy,
            read_timeout: config.read_timeout,
            ping_interval: config.ping_interval,
            pong_timeout: config.pong_timeout,
            max_server_ping_delay: config.max_server_ping_delay,
            private_channel_prefix: config.private_channel_prefix,
            get_connection_token: config.get_connection_token,
            get_subscription_token: config.get_subscription_token,
            refresh_required: false,
            closer_write: None,
            control_write: None,
            refresh_task: None,
            client_id: String::new(),
            session_id: String::new(),
            node: String::new(),
            close_reason: None,
            last_disconnect_code: None,
            on_state: None,
            on_connected: None,
            on_disconnected: None,
            on_close: None,
            on_message: None,
            on_error: None,
            on_subscribed: None,
            on_unsubscribed: None,
            on_publication: None,
            on_join: None,
            on_leave: None,
            on_connected_ch: Vec::new(),
            on_disconnected_ch: Vec::new(),
            subscriptions: SlotMap::with_key(),
            sub_name_to_id: HashMap::new(),
            server_subs: HashMap::new(),
            pub_ch_write: None,
            sub_ch_write: None,
        })))
    }

    /// Starts connecting. Resolves once the session is connected; calling
    /// it while connecting or connected is a no-op.
    pub fn connect(&self) -> FutureResult<impl Future<Output = Result<(), ()>>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.0.lock().unwrap();
        match inner.state {
            State::Disconnected => {
                inner.on_connected_ch.push(tx);
                inner.move_to_connecting(self.0.clone());
            }
            State::Connecting => {
                inner.on_connected_ch.push(tx);
            }
            State::Connected => {
                let _ = tx.send(Ok(()));
            }
            State::Closed => {
                let _ = tx.send(Err(()));
            }
        }
        FutureResult(async {
            match rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(())) => Err(()),
                Err(_) => Err(()),
            }
        })
    }

    /// Disconnects. Resolves once the session settled in `Disconnected`;
    /// a no-op while already disconnected, except any pending reconnect
    /// attempt is cancelled either way.
    pub fn disconnect(&self) -> FutureResult<impl Future<Output = ()>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.0.lock().unwrap();
        if inner.state == State::Disconnected || inner.state == State::Closed {
            let _ = tx.send(());
        } else {
            inner.on_disconnected_ch.push(tx);
            inner.move_to_disconnected();
        }
        FutureResult(async {
            let _ = rx.await;
        })
    }

    /// Closes the session for good. Terminal and idempotent: client
    /// subscriptions are cleared and every later call fails fast.
    pub fn close(&self) {
        let mut inner = self.0.lock().unwrap();
        inner.close(CloseReason::Client);
    }

    /// Publishes data into a channel.
    pub fn publish(
        &self,
        channel: &str,
        data: Vec<u8>,
    ) -> FutureResult<impl Future<Output = Result<(), RequestError>>> {
        let (deadline, rx) = self.enqueue(Command::Publish(PublishRequest {
            channel: channel.into(),
            data,
        }));
        FutureResult(async move {
            let result = tokio::time::timeout_at(deadline.into(), rx).await;
            match result {
                Ok(Ok(Ok(Reply::Publish(_)))) => Ok(()),
                other => Err(Self::request_error(other)),
            }
        })
    }

    /// Calls a server-side RPC method.
    pub fn rpc(
        &self,
        method: &str,
        data: Vec<u8>,
    ) -> FutureResult<impl Future<Output = Result<Vec<u8>, RequestError>>> {
        let (deadline, rx) = self.enqueue(Command::Rpc(RpcRequest {
            method: method.into(),
            data,
        }));
        FutureResult(async move {
            let result = tokio::time::timeout_at(deadline.into(), rx).await;
            match result {
                Ok(Ok(Ok(Reply::Rpc(rpc_result)))) => Ok(rpc_result.data),
                other => Err(Self::request_error(other)),
            }
        })
    }

    /// Sends a one-way message to the server. Best effort, no reply.
    pub fn send(
        &self,
        data: Vec<u8>,
    ) -> FutureResult<impl Future<Output = Result<(), RequestError>>> {
        let (deadline, rx) = self.enqueue(Command::Send(SendRequest { data }));
        FutureResult(async move {
            let result = tokio::time::timeout_at(deadline.into(), rx).await;
            match result {
                Ok(Ok(Ok(Reply::Empty))) => Ok(()),
                other => Err(Self::request_error(other)),
            }
        })
    }

    /// Fetches channel history.
    pub fn history(
        &self,
        channel: &str,
        options: HistoryOptions,
    ) -> FutureResult<impl Future<Output = Result<HistoryResult, RequestError>>> {
        let (deadline, rx) = self.enqueue(Command::History(HistoryRequest {
            channel: channel.into(),
            limit: options.limit,
            since: options.since,
            reverse: options.reverse,
        }));
        FutureResult(async move {
            let result = tokio::time::timeout_at(deadline.into(), rx).await;
            match result {
                Ok(Ok(Ok(Reply::History(history)))) => Ok(history),
                other => Err(Self::request_error(other)),
            }
        })
    }

    /// Fetches current channel presence.
    pub fn presence(
        &self,
        channel: &str,
    ) -> FutureResult<impl Future<Output = Result<PresenceResult, RequestError>>> {
        let (deadline, rx) = self.enqueue(Command::Presence(PresenceRequest {
            channel: channel.into(),
        }));
        FutureResult(async move {
            let result = tokio::time::timeout_at(deadline.into(), rx).await;
            match result {
                Ok(Ok(Ok(Reply::Presence(presence)))) => Ok(presence),
                other => Err(Self::request_error(other)),
            }
        })
    }

    /// Fetches channel presence statistics.
    pub fn presence_stats(
        &self,
        channel: &str,
    ) -> FutureResult<impl Future<Output = Result<PresenceStatsResult, RequestError>>> {
        let (deadline, rx) = self.enqueue(Command::PresenceStats(PresenceStatsRequest {
            channel: channel.into(),
        }));
        FutureResult(async move {
            let result = tokio::time::timeout_at(deadline.into(), rx).await;
            match result {
                Ok(Ok(Ok(Reply::PresenceStats(stats)))) => Ok(stats),
                other => Err(Self::request_error(other)),
            }
        })
    }

    /// Buffers outgoing commands until [`Client::stop_batching`], which
    /// flushes them as a single frame. Only affects a live connection.
    pub fn start_batching(&self) {
        let inner = self.0.lock().unwrap();
        if let Some(ref control_write) = inner.control_write {
            let _ = control_write.try_send(ControlMessage::StartBatching);
        }
    }

    pub fn stop_batching(&self) {
        let inner = self.0.lock().unwrap();
        if let Some(ref control_write) = inner.control_write {
            let _ = control_write.try_send(ControlMessage::StopBatching);
        }
    }

    /// Registers (or returns the existing) subscription for a channel.
    pub fn new_subscription(&self, channel: &str) -> Subscription {
        self.new_subscription_with(channel, SubscriptionOptions::default())
    }

    /// Registers a subscription with explicit options. Options apply only
    /// on first registration; an existing subscription is returned as is.
    pub fn new_subscription_with(
        &self,
        channel: &str,
        options: SubscriptionOptions,
    ) -> Subscription {
        let mut inner = self.0.lock().unwrap();
        if let Some(key) = inner.sub_name_to_id.get(channel) {
            return Subscription::new(self, *key);
        }

        let timeout = inner.read_timeout;
        let key = inner
            .subscriptions
            .insert(SubscriptionInner::new(channel, options, timeout));
        inner.sub_name_to_id.insert(channel.to_string(), key);
        Subscription::new(self, key)
    }

    pub fn get_subscription(&self, channel: &str) -> Option<Subscription> {
        let inner = self.0.lock().unwrap();
        inner
            .sub_name_to_id
            .get(channel)
            .map(|id| Subscription::new(self, *id))
    }

    /// Removes an unsubscribed subscription from the registry.
    pub fn remove_subscription(
        &self,
        subscription: Subscription,
    ) -> Result<(), crate_errors::RemoveSubscriptionError> {
        let mut inner = self.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get(subscription.id) {
            if sub.state != subscription::State::Unsubscribed {
                Err(crate_errors::RemoveSubscriptionError::NotUnsubscribed)
            } else {
                let sub = inner.subscriptions.remove(subscription.id).unwrap();
                inner.sub_name_to_id.remove(&*sub.channel);
                Ok(())
            }
        } else {
            Ok(())
        }
    }

    pub fn state(&self) -> State {
        self.0.lock().unwrap().state
    }

    /// Client identifier assigned by the server, empty until connected.
    pub fn client_id(&self) -> String {
        self.0.lock().unwrap().client_id.clone()
    }

    /// Replaces the connection token used for the next connect attempt.
    pub fn set_token(&self, token: impl Into<String>) {
        self.0.lock().unwrap().token = token.into();
    }

    pub fn on_state(&self, func: impl FnMut(StateEvent) + Send + 'static) {
        self.0.lock().unwrap().on_state = Some(Box::new(func));
    }

    pub fn on_connected(&self, func: impl FnMut(ConnectedEvent) + Send + 'static) {
        self.0.lock().unwrap().on_connected = Some(Box::new(func));
    }

    pub fn on_disconnected(&self, func: impl FnMut(DisconnectedEvent) + Send + 'static) {
        self.0.lock().unwrap().on_disconnected = Some(Box::new(func));
    }

    pub fn on_close(&self, func: impl FnMut(ClosedEvent) + Send + 'static) {
        self.0.lock().unwrap().on_close = Some(Box::new(func));
    }

    pub fn on_message(&self, func: impl FnMut(MessageEvent) + Send + 'static) {
        self.0.lock().unwrap().on_message = Some(Box::new(func));
    }

    pub fn on_error(&self, func: impl FnMut(anyhow::Error) + Send + 'static) {
        self.0.lock().unwrap().on_error = Some(Box::new(func));
    }

    /// Server-side subscription established for this connection.
    pub fn on_subscribed(&self, func: impl FnMut(SubscribedEvent) + Send + 'static) {
        self.0.lock().unwrap().on_subscribed = Some(Box::new(func));
    }

    /// Server-side subscription removed.
    pub fn on_unsubscribed(&self, func: impl FnMut(UnsubscribedEvent) + Send + 'static) {
        self.0.lock().unwrap().on_unsubscribed = Some(Box::new(func));
    }

    /// Publication on a server-side subscription.
    pub fn on_publication(&self, func: impl FnMut(PublicationEvent) + Send + 'static) {
        self.0.lock().unwrap().on_publication = Some(Box::new(func));
    }

    pub fn on_join(&self, func: impl FnMut(JoinEvent) + Send + 'static) {
        self.0.lock().unwrap().on_join = Some(Box::new(func));
    }

    pub fn on_leave(&self, func: impl FnMut(LeaveEvent) + Send + 'static) {
        self.0.lock().unwrap().on_leave = Some(Box::new(func));
    }

    /// Queues a command on the gating store. While not connected the
    /// command waits for connectivity; after `Closed` it fails fast.
    fn enqueue(
        &self,
        command: Command,
    ) -> (Instant, oneshot::Receiver<Result<Reply, ReplyError>>) {
        let mut inner = self.0.lock().unwrap();
        let deadline = Instant::now() + inner.read_timeout;

        if inner.state == State::Closed {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(ReplyError::Closed));
            return (deadline, rx);
        }

        if inner.pub_ch_write.is_none() {
            let (store, _) = types::MessageStore::new(inner.read_timeout);
            inner.pub_ch_write = Some(store);
        }
        let rx = inner.pub_ch_write.as_mut().unwrap().send(command);
        (deadline, rx)
    }

    #[allow(clippy::type_complexity)]
    fn request_error(
        result: Result<
            Result<Result<Reply, ReplyError>, oneshot::error::RecvError>,
            tokio::time::error::Elapsed,
        >,
    ) -> RequestError {
        match result {
            Ok(Ok(Ok(Reply::Error(err)))) => RequestError::ErrorResponse(err),
            Ok(Ok(Ok(reply))) => RequestError::UnexpectedReply(reply),
            Ok(Ok(Err(ReplyError::Closed))) => RequestError::Closed,
            Ok(Ok(Err(err))) => err.into(),
            Ok(Err(err)) => err.into(),
            Err(err) => err.into(),
        }
    }
}
