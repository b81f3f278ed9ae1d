//! Session engine internals: the client state machine and the
//! connect/reconnect cycle.
//!
//! All shared state lives behind one mutex; background tasks lock it,
//! mutate, and release without awaiting, so every callback observes a
//! consistent snapshot. The connection cycle is a retry loop: delay,
//! token, transport, handshake. A cycle that loses an established
//! connection either respawns itself (reconnect) or settles into
//! `Disconnected`; `Closed` is terminal and stops everything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slotmap::SlotMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::config::{ConnectionTokenFn, Protocol, ReconnectStrategy, SubscriptionTokenFn};
use crate::errors::CloseReason;
use crate::events::{
    ClosedEvent, ConnectedEvent, DisconnectedEvent, JoinEvent, LeaveEvent, MessageEvent,
    PublicationEvent, StateEvent, SubscribedEvent, UnsubscribedEvent,
};
use crate::protocol::{ClientInfo, Command, RefreshRequest, Reply};
use crate::subscription::{self, SubscriptionId, SubscriptionInner};
use crate::transport::Endpoint;
use crate::utils::{clamp_timer, jittered_retry_delay};

use super::connection::ConnectionManager;
use super::handshake::{EstablishedConnection, HandshakeManager};
use super::io::{ControlMessage, ControlSender, Disconnect};
use super::subscription_handler::{publish_task, SubscriptionHandler};
use super::types::{MessageStore, ServerSubscription, State};

pub(crate) struct ClientInner {
    pub(crate) rt: Handle,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) endpoint_index: usize,
    /// Whether any transport opened since the session started connecting;
    /// false keeps the endpoint walk at zero delay.
    pub(crate) ever_opened: bool,
    /// Reconnect attempt counter; reset on every successful connect.
    pub(crate) reconnect_attempt: u32,
    pub(crate) state: State,
    pub(crate) token: String,
    pub(crate) connect_data: Vec<u8>,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) protocol: Protocol,
    pub(crate) reconnect_strategy: Arc<dyn ReconnectStrategy>,
    pub(crate) read_timeout: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) pong_timeout: Duration,
    pub(crate) max_server_ping_delay: Duration,
    pub(crate) private_channel_prefix: String,
    pub(crate) get_connection_token: Option<ConnectionTokenFn>,
    pub(crate) get_subscription_token: Option<SubscriptionTokenFn>,
    /// Set when the server flagged the connection token expired; the next
    /// connect attempt fetches a fresh one first.
    pub(crate) refresh_required: bool,
    pub(crate) closer_write: Option<mpsc::Sender<bool>>,
    pub(crate) control_write: Option<ControlSender>,
    pub(crate) refresh_task: Option<AbortHandle>,
    pub(crate) client_id: String,
    pub(crate) session_id: String,
    pub(crate) node: String,
    pub(crate) close_reason: Option<CloseReason>,
    pub(crate) last_disconnect_code: Option<u32>,
    pub(crate) on_state: Option<Box<dyn FnMut(StateEvent) + Send + 'static>>,
    pub(crate) on_connected: Option<Box<dyn FnMut(ConnectedEvent) + Send + 'static>>,
    pub(crate) on_disconnected: Option<Box<dyn FnMut(DisconnectedEvent) + Send + 'static>>,
    pub(crate) on_close: Option<Box<dyn FnMut(ClosedEvent) + Send + 'static>>,
    pub(crate) on_message: Option<Box<dyn FnMut(MessageEvent) + Send + 'static>>,
    pub(crate) on_error: Option<Box<dyn FnMut(anyhow::Error) + Send + 'static>>,
    pub(crate) on_subscribed: Option<Box<dyn FnMut(SubscribedEvent) + Send + 'static>>,
    pub(crate) on_unsubscribed: Option<Box<dyn FnMut(UnsubscribedEvent) + Send + 'static>>,
    pub(crate) on_publication: Option<Box<dyn FnMut(PublicationEvent) + Send + 'static>>,
    pub(crate) on_join: Option<Box<dyn FnMut(JoinEvent) + Send + 'static>>,
    pub(crate) on_leave: Option<Box<dyn FnMut(LeaveEvent) + Send + 'static>>,
    pub(crate) on_connected_ch: Vec<oneshot::Sender<Result<(), ()>>>,
    pub(crate) on_disconnected_ch: Vec<oneshot::Sender<()>>,
    pub(crate) subscriptions: SlotMap<SubscriptionId, SubscriptionInner>,
    pub(crate) sub_name_to_id: HashMap<String, SubscriptionId>,
    pub(crate) server_subs: HashMap<String, ServerSubscription>,
    pub(crate) pub_ch_write: Option<MessageStore>,
    pub(crate) sub_ch_write: Option<mpsc::UnboundedSender<SubscriptionId>>,
}

impl ClientInner {
    pub(crate) fn current_endpoint(&self) -> Endpoint {
        self.endpoints[self.endpoint_index % self.endpoints.len()].clone()
    }

    /// Moves to the next endpoint; returns whether there is another one
    /// worth probing.
    pub(crate) fn advance_endpoint(&mut self) -> bool {
        if self.endpoints.len() > 1 {
            self.endpoint_index = (self.endpoint_index + 1) % self.endpoints.len();
            true
        } else {
            false
        }
    }

    pub(crate) fn move_to_connecting(&mut self, outer: Arc<Mutex<Self>>) {
        debug_assert_ne!(self.state, State::Connecting);
        if self.state == State::Connected {
            // losing an established connection keeps `ever_opened`, so the
            // first reconnect attempt backs off instead of hammering
            self.teardown_connection();
            self.reconnect_attempt = self.reconnect_attempt.max(1);
        } else {
            self.ever_opened = false;
            self.reconnect_attempt = 0;
        }
        if self.pub_ch_write.is_none() {
            let (pub_ch_write, _) = MessageStore::new(self.read_timeout);
            self.pub_ch_write = Some(pub_ch_write);
        }
        self._set_state(State::Connecting);
        self.start_connecting(outer);
    }

    pub(crate) fn move_to_connected(&mut self, event: ConnectedEvent) {
        assert_eq!(self.state, State::Connecting);
        self.reconnect_attempt = 0;
        self._set_state(State::Connected);
        if let Some(ref mut on_connected) = self.on_connected {
            on_connected(event);
        }
        for ch in self.on_connected_ch.drain(..) {
            let _ = ch.send(Ok(()));
        }
    }

    pub(crate) fn move_to_disconnected(&mut self) {
        assert_ne!(self.state, State::Disconnected);
        if self.state == State::Closed {
            return;
        }
        self.teardown_connection();
        if let Some(store) = self.pub_ch_write.as_mut() {
            store.drain_close();
        }
        self.pub_ch_write = None;
        for ch in self.on_connected_ch.drain(..) {
            let _ = ch.send(Err(()));
        }
        self._set_state(State::Disconnected);
    }

    /// Terminal close. Clears client subscriptions; server-subscription
    /// positions survive only for reasons that allow it.
    pub(crate) fn close(&mut self, reason: CloseReason) {
        if self.state == State::Closed {
            return;
        }
        log::debug!("closing session, reason={}", reason);
        self.close_reason = Some(reason);
        self.teardown_connection();

        let ids: Vec<SubscriptionId> = self.subscriptions.keys().collect();
        for id in ids {
            if let Some(sub) = self.subscriptions.get_mut(id) {
                if sub.state != subscription::State::Unsubscribed {
                    sub.move_to_unsubscribed(0, "client closed");
                }
            }
        }

        if !reason.keeps_positions() {
            self.server_subs.clear();
        }

        if let Some(store) = self.pub_ch_write.as_mut() {
            store.drain_close();
        }
        self.pub_ch_write = None;

        self._set_state(State::Closed);
        if let Some(ref mut on_close) = self.on_close {
            on_close(ClosedEvent { reason });
        }
        for ch in self.on_connected_ch.drain(..) {
            let _ = ch.send(Err(()));
        }
        for ch in self.on_disconnected_ch.drain(..) {
            let _ = ch.send(());
        }
    }

    /// Cuts the current connection loose: stops its tasks, cancels the
    /// refresh timer and demotes subscriptions back to `Subscribing`.
    fn teardown_connection(&mut self) {
        if let Some(closer) = self.closer_write.take() {
            let _ = closer.try_send(false);
        }
        self.control_write = None;
        self.sub_ch_write = None;
        if let Some(handle) = self.refresh_task.take() {
            handle.abort();
        }
        for (_, sub) in self.subscriptions.iter_mut() {
            if let Some(handle) = sub.refresh_task.take() {
                handle.abort();
            }
            if sub.options.token_unique_per_connection {
                sub.token = None;
            }
            if sub.state == subscription::State::Subscribed {
                sub.move_to_subscribing();
            }
        }
    }

    /// One disconnect event per distinct cause.
    pub(crate) fn emit_disconnected(&mut self, code: u32, reason: &str) {
        if self.last_disconnect_code == Some(code) {
            return;
        }
        self.last_disconnect_code = Some(code);
        if let Some(ref mut on_disconnected) = self.on_disconnected {
            on_disconnected(DisconnectedEvent { code, reason: reason.to_string() });
        }
    }

    pub(crate) fn emit_server_subscribed(&mut self, event: SubscribedEvent) {
        if let Some(ref mut on_subscribed) = self.on_subscribed {
            on_subscribed(event);
        }
    }

    pub(crate) fn emit_server_unsubscribed(&mut self, event: UnsubscribedEvent) {
        if let Some(ref mut on_unsubscribed) = self.on_unsubscribed {
            on_unsubscribed(event);
        }
    }

    pub(crate) fn emit_server_publication(&mut self, event: PublicationEvent) {
        if let Some(ref mut on_publication) = self.on_publication {
            on_publication(event);
        }
    }

    pub(crate) fn emit_server_join(&mut self, channel: String, info: Option<ClientInfo>) {
        if let Some(ref mut on_join) = self.on_join {
            on_join(JoinEvent { channel, info });
        }
    }

    pub(crate) fn emit_server_leave(&mut self, channel: String, info: Option<ClientInfo>) {
        if let Some(ref mut on_leave) = self.on_leave {
            on_leave(LeaveEvent { channel, info });
        }
    }

    pub(crate) fn emit_message(&mut self, event: MessageEvent) {
        if let Some(ref mut on_message) = self.on_message {
            on_message(event);
        }
    }

    /// Schedules the connection token refresh timer. A result arriving
    /// after the client identifier changed is discarded.
    pub(crate) fn schedule_refresh(
        &mut self,
        rt: &Handle,
        client: Arc<Mutex<ClientInner>>,
        ttl: u32,
    ) {
        let connected_client_id = self.client_id.clone();
        let task = rt.spawn(async move {
            let mut ttl = ttl;
            loop {
                tokio::time::sleep(clamp_timer(Duration::from_secs(ttl as u64))).await;

                let (provider, timeout, control_write) = {
                    let inner = client.lock().unwrap();
                    if inner.state != State::Connected || inner.client_id != connected_client_id
                    {
                        return;
                    }
                    (
                        inner.get_connection_token.clone(),
                        inner.read_timeout,
                        inner.control_write.clone(),
                    )
                };

                let Some(provider) = provider else {
                    log::debug!("connection token expires but no provider configured");
                    return;
                };

                let token = match provider().await {
                    Ok(token) if token.is_empty() => {
                        client.lock().unwrap().close(CloseReason::RefreshFailed);
                        return;
                    }
                    Ok(token) => token,
                    Err(err) => {
                        log::debug!("refresh token fetch failed: {}", err);
                        tokio::time::sleep(jittered_retry_delay()).await;
                        ttl = 0;
                        continue;
                    }
                };

                {
                    let mut inner = client.lock().unwrap();
                    if inner.client_id != connected_client_id {
                        return;
                    }
                    inner.token = token.clone();
                }

                let Some(control_write) = control_write else {
                    return;
                };
                let (tx, rx) = oneshot::channel();
                let message = ControlMessage::Call {
                    command: Command::Refresh(RefreshRequest { token }),
                    reply: tx,
                    timeout,
                };
                if control_write.send(message).await.is_err() {
                    return;
                }

                match rx.await {
                    Ok(Ok(Reply::Refresh(result))) => {
                        {
                            let inner = client.lock().unwrap();
                            if inner.client_id != connected_client_id {
                                return;
                            }
                        }
                        if !result.expires {
                            return;
                        }
                        ttl = result.ttl;
                    }
                    Ok(Ok(Reply::Error(err))) if err.temporary => {
                        log::debug!("refresh failed temporarily: {}", err);
                        tokio::time::sleep(jittered_retry_delay()).await;
                        ttl = 0;
                    }
                    Ok(Ok(Reply::Error(err))) => {
                        log::debug!("refresh failed: {}", err);
                        client.lock().unwrap().close(CloseReason::RefreshFailed);
                        return;
                    }
                    // connection died; the next connect carries the token
                    _ => return,
                }
            }
        });

        if let Some(previous) = self.refresh_task.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    /// Runs one full connection cycle: retry loop, connected phase, and
    /// the decision what to do when the connection ends.
    async fn do_connection_cycle(client: Arc<Mutex<Self>>) {
        let client1 = client.clone();
        let outcome: Option<Disconnect> = async move {
            let established = loop {
                let (closer_write, mut closer_read, attempt) = {
                    let mut inner = client.lock().unwrap();
                    let (closer_write, closer_read) = mpsc::channel::<bool>(1);
                    inner.closer_write = Some(closer_write.clone());
                    (closer_write, closer_read, inner.reconnect_attempt)
                };

                let result: Result<EstablishedConnection, bool> = async {
                    ConnectionManager::do_check_state(&client, State::Connecting)?;
                    ConnectionManager::do_delay(&client, &mut closer_read, attempt).await?;

                    ConnectionManager::do_check_state(&client, State::Connecting)?;
                    HandshakeManager::ensure_token(&client).await?;

                    ConnectionManager::do_check_state(&client, State::Connecting)?;
                    let mut prepared = HandshakeManager::prepare(&client);
                    let initial_frame = prepared.initial_frame.take();
                    let conn =
                        ConnectionManager::do_connect(&client, &mut closer_read, initial_frame)
                            .await?;

                    ConnectionManager::do_check_state(&client, State::Connecting)?;
                    HandshakeManager::do_handshake(
                        &client,
                        closer_write,
                        closer_read,
                        conn,
                        prepared,
                    )
                    .await
                }
                .await;

                {
                    let mut inner = client.lock().unwrap();
                    if inner.state != State::Connecting {
                        return None;
                    }
                    if matches!(result, Err(false)) {
                        for ch in inner.on_connected_ch.drain(..) {
                            let _ = ch.send(Err(()));
                        }
                    }
                }

                match result {
                    Ok(established) => break established,
                    Err(true) => {
                        let mut inner = client.lock().unwrap();
                        inner.reconnect_attempt = inner.reconnect_attempt.saturating_add(1);
                        continue;
                    }
                    Err(false) => return None,
                }
            };

            let (sub_ch_write, sub_ch_read) = mpsc::unbounded_channel();
            let (rt, initial_subs) = {
                let mut inner = client.lock().unwrap();
                inner.control_write = Some(established.control_write.clone());
                inner.sub_ch_write = Some(sub_ch_write);
                inner.move_to_connected(ConnectedEvent {
                    client: established.connect.client.clone(),
                    version: established.connect.version.clone(),
                    transport: established.transport_name.clone(),
                    data: established.connect.data.clone(),
                });
                let initial_subs: Vec<SubscriptionId> = inner
                    .subscriptions
                    .iter()
                    .filter(|(_, sub)| sub.state == subscription::State::Subscribing)
                    .map(|(id, _)| id)
                    .collect();
                (inner.rt.clone(), initial_subs)
            };

            HandshakeManager::after_connected(&client, &established);

            // flush commands queued while we were away
            rt.spawn(publish_task(
                client.clone(),
                established.control_write.clone(),
                |inner| inner.pub_ch_write.as_mut(),
            ));
            rt.spawn(SubscriptionHandler::run(
                client.clone(),
                initial_subs,
                sub_ch_read,
                established.control_write.clone(),
                rt.clone(),
            ));

            let ended = established.io_future.await;

            {
                let mut inner = client.lock().unwrap();
                if inner.state == State::Connected {
                    inner.emit_disconnected(ended.code, &ended.reason);
                }
            }
            Some(ended)
        }
        .await;

        {
            let mut inner = client1.lock().unwrap();
            match outcome {
                Some(ended) if ended.reconnect => {
                    if inner.state == State::Connected {
                        inner.move_to_connecting(client1.clone());
                    }
                }
                Some(ended) => {
                    if inner.state == State::Connected {
                        // server-initiated terminal codes close the session
                        if matches!(ended.code, 3500..=3999 | 4500..=4999) {
                            inner.close(CloseReason::Server);
                        } else {
                            inner.move_to_disconnected();
                        }
                    }
                    for ch in inner.on_disconnected_ch.drain(..) {
                        let _ = ch.send(());
                    }
                }
                None => {
                    for ch in inner.on_disconnected_ch.drain(..) {
                        let _ = ch.send(());
                    }
                }
            }
        }
    }

    fn start_connecting(&mut self, client: Arc<Mutex<Self>>) {
        self.rt.spawn(async move {
            Self::do_connection_cycle(client).await;
        });
    }

    fn _set_state(&mut self, state: State) {
        log::debug!("state: {:?} -> {:?}", self.state, state);
        let prev_state = self.state;
        self.state = state;
        if let Some(ref mut on_state) = self.on_state {
            on_state(StateEvent { state, prev_state });
        }
    }
}
