//! Session handshake: the connect command, its reply classification and
//! the push router installed on the new connection.
//!
//! The connect command is registered in the in-flight table before the
//! transport opens (a call without a send). For ordinary transports the
//! pre-encoded envelope is queued on the control channel and goes out as
//! the first frame; for emulation transports it is handed to the transport
//! as the initial frame, because their connect reply arrives on the inbound
//! stream while upstream frames travel a side channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::errors::{
    connect_error_retryable, CloseReason, ReplyError, CODE_TOKEN_EXPIRED,
    CODE_UNRECOVERABLE_POSITION,
};
use crate::events::{
    MessageEvent, PublicationEvent, SubscribedEvent, UnsubscribedEvent,
};
use crate::protocol::{
    Command, ConnectRequest, ConnectResult, PushData, RawCommand, Reply, StreamPosition,
    SubscribeRequest,
};
use crate::subscription;
use crate::transport::Frame;
use crate::utils::encode_frames;

use super::inner::ClientInner;
use super::io::{
    record_disconnect, run_connection, ControlMessage, ControlSender, Disconnect, DisconnectSlot,
    InFlightMap, Keepalive,
};
use super::types::{ServerSubscription, State};

pub(crate) type IoFuture = Pin<Box<dyn Future<Output = Disconnect> + Send>>;

/// Everything a connection attempt needs before the transport opens.
pub(crate) struct PreparedHandshake {
    pub(crate) in_flight: Arc<InFlightMap>,
    pub(crate) control_write: ControlSender,
    control_read: mpsc::Receiver<ControlMessage>,
    pub(crate) keepalive: Arc<Keepalive>,
    activity_read: mpsc::Receiver<()>,
    pub(crate) disconnect: DisconnectSlot,
    connect_rx: oneshot::Receiver<Result<Reply, ReplyError>>,
    pub(crate) initial_frame: Option<Frame>,
    pub(crate) transport_name: String,
}

/// A connection that survived the handshake.
pub(crate) struct EstablishedConnection {
    pub(crate) io_future: IoFuture,
    pub(crate) control_write: ControlSender,
    pub(crate) keepalive: Arc<Keepalive>,
    pub(crate) closer_write: mpsc::Sender<bool>,
    pub(crate) disconnect: DisconnectSlot,
    pub(crate) connect: ConnectResult,
    pub(crate) transport_name: String,
}

pub(crate) struct HandshakeManager;

impl HandshakeManager {
    /// Acquires a connection token when the current one is missing or was
    /// flagged expired. `Err(true)` backs off and retries, `Err(false)`
    /// stops the cycle (the session is closed as unauthorized).
    pub(crate) async fn ensure_token(client: &Arc<Mutex<ClientInner>>) -> Result<(), bool> {
        let (needed, provider) = {
            let inner = client.lock().unwrap();
            (
                inner.refresh_required || inner.token.is_empty(),
                inner.get_connection_token.clone(),
            )
        };

        if !needed {
            return Ok(());
        }
        let Some(provider) = provider else {
            // no provider configured: connect with whatever token we hold
            return Ok(());
        };

        match provider().await {
            Ok(token) if token.is_empty() => {
                log::debug!("token provider returned empty token");
                let mut inner = client.lock().unwrap();
                inner.close(CloseReason::Unauthorized);
                Err(false)
            }
            Ok(token) => {
                let mut inner = client.lock().unwrap();
                inner.token = token;
                inner.refresh_required = false;
                Ok(())
            }
            Err(err) => {
                log::debug!("token provider failed: {}", err);
                let mut inner = client.lock().unwrap();
                if let Some(ref mut on_error) = inner.on_error {
                    on_error(crate::errors::TokenError::Provider(err).into());
                }
                Err(true)
            }
        }
    }

    /// Builds the connect command and registers it as a call without a
    /// send, returning everything the connection tasks will need.
    pub(crate) fn prepare(client: &Arc<Mutex<ClientInner>>) -> PreparedHandshake {
        let inner = client.lock().unwrap();

        let in_flight = InFlightMap::new();
        let (control_write, control_read) = mpsc::channel(32);
        let (keepalive, activity_read) = Keepalive::new();
        let disconnect: DisconnectSlot = Arc::new(Mutex::new(None));
        let (connect_tx, connect_rx) = oneshot::channel();

        // every recoverable server subscription asks for its gap back
        let subs = inner
            .server_subs
            .iter()
            .filter(|(_, sub)| sub.recoverable)
            .map(|(channel, sub)| {
                (
                    channel.clone(),
                    SubscribeRequest {
                        recover: true,
                        offset: sub.offset,
                        epoch: sub.epoch.clone(),
                        ..Default::default()
                    },
                )
            })
            .collect();

        let command = Command::Connect(ConnectRequest {
            token: inner.token.clone(),
            data: inner.connect_data.clone(),
            subs,
            name: inner.name.clone(),
            version: inner.version.clone(),
        });

        let id = in_flight.register(&inner.rt, connect_tx, inner.read_timeout);
        let mut raw = RawCommand::from(command);
        raw.id = id;

        let endpoint = inner.current_endpoint();
        let initial_frame = if endpoint.transport.emulation() {
            encode_frames(&[raw], inner.protocol, |_| {})
        } else {
            // buffered until the writer task starts draining
            let _ = control_write.try_send(ControlMessage::Registered(raw));
            None
        };

        PreparedHandshake {
            in_flight,
            control_write,
            control_read,
            keepalive,
            activity_read,
            disconnect,
            connect_rx,
            initial_frame,
            transport_name: endpoint.transport.name().to_string(),
        }
    }

    /// Spawns the connection tasks and waits for the connect reply.
    ///
    /// `Err(true)` reconnects with backoff, `Err(false)` ends the cycle;
    /// fatal connect errors close the session before returning.
    pub(crate) async fn do_handshake(
        client: &Arc<Mutex<ClientInner>>,
        closer_write: mpsc::Sender<bool>,
        closer_read: mpsc::Receiver<bool>,
        conn: crate::transport::Connection,
        prepared: PreparedHandshake,
    ) -> Result<EstablishedConnection, bool> {
        let PreparedHandshake {
            in_flight,
            control_write,
            control_read,
            keepalive,
            activity_read,
            disconnect,
            connect_rx,
            initial_frame: _,
            transport_name,
        } = prepared;

        let rt = {
            let inner = client.lock().unwrap();
            inner.rt.clone()
        };
        let protocol = {
            let inner = client.lock().unwrap();
            inner.protocol
        };

        let client1 = client.clone();
        let client2 = client.clone();
        let push_closer = closer_write.clone();
        let push_disconnect = disconnect.clone();

        let mut io_future: IoFuture = Box::pin(run_connection(
            rt,
            conn,
            in_flight,
            control_read,
            control_write.clone(),
            closer_read,
            closer_write.clone(),
            keepalive.clone(),
            activity_read,
            disconnect.clone(),
            protocol,
            false,
            move |reply| route_push(&client1, reply, &push_closer, &push_disconnect),
            move |err| {
                let mut inner = client2.lock().unwrap();
                if let Some(ref mut on_error) = inner.on_error {
                    on_error(err);
                }
            },
        ));

        tokio::select! {
            biased;

            ended = &mut io_future => {
                Err(ended.reconnect)
            }

            result = connect_rx => {
                match result {
                    Ok(Ok(Reply::Connect(connect))) => {
                        log::debug!(
                            "connection established with {} {}",
                            connect.client,
                            connect.version
                        );
                        Ok(EstablishedConnection {
                            io_future,
                            control_write,
                            keepalive,
                            closer_write,
                            disconnect,
                            connect,
                            transport_name,
                        })
                    }
                    Ok(Ok(Reply::Error(err))) => {
                        log::debug!("handshake failed: {}", &err.message);
                        if err.code == CODE_UNRECOVERABLE_POSITION {
                            client.lock().unwrap().close(CloseReason::UnrecoverablePosition);
                            let _ = closer_write.try_send(false);
                            io_future.await;
                            Err(false)
                        } else if connect_error_retryable(&err) {
                            if err.code == CODE_TOKEN_EXPIRED {
                                client.lock().unwrap().refresh_required = true;
                            }
                            let _ = closer_write.try_send(true);
                            Err(io_future.await.reconnect)
                        } else {
                            client.lock().unwrap().close(CloseReason::ConnectFailed);
                            let _ = closer_write.try_send(false);
                            io_future.await;
                            Err(false)
                        }
                    }
                    Ok(Ok(reply)) => {
                        log::debug!("unexpected reply: {:?}", reply);
                        let _ = closer_write.try_send(false);
                        Err(io_future.await.reconnect)
                    }
                    Ok(Err(err)) => {
                        // connection lost or timed out mid-handshake
                        log::debug!("handshake failed: {:?}", err);
                        let _ = closer_write.try_send(true);
                        Err(io_future.await.reconnect)
                    }
                    Err(err) => {
                        log::debug!("handshake failed: {:?}", err);
                        let _ = closer_write.try_send(true);
                        Err(io_future.await.reconnect)
                    }
                }
            }
        }
    }

    /// Applies the connect reply after the state moved to `Connected`:
    /// records identity, arms keepalive, schedules token refresh and
    /// replays the announced server subscriptions.
    pub(crate) fn after_connected(
        client: &Arc<Mutex<ClientInner>>,
        established: &EstablishedConnection,
    ) {
        let mut inner = client.lock().unwrap();
        let connect = &established.connect;

        inner.client_id = connect.client.clone();
        inner.session_id = connect.session.clone();
        inner.node = connect.node.clone();
        inner.last_disconnect_code = None;

        if connect.ping > 0 {
            established.keepalive.arm_server(
                std::time::Duration::from_secs(connect.ping as u64),
                inner.max_server_ping_delay,
                connect.pong,
            );
        } else {
            established.keepalive.arm_client(
                &inner.rt.clone(),
                inner.ping_interval,
                inner.pong_timeout,
                established.control_write.clone(),
                established.closer_write.clone(),
                established.disconnect.clone(),
            );
        }

        if connect.expires {
            let rt = inner.rt.clone();
            let ttl = connect.ttl;
            let client = client.clone();
            inner.schedule_refresh(&rt, client, ttl);
        }

        process_server_subs(&mut inner, connect);
    }
}

/// Refreshes the server-subscription registry from a connect reply,
/// emitting subscribe events and replaying recovered publications.
fn process_server_subs(inner: &mut ClientInner, connect: &ConnectResult) {
    // entries the server no longer announces are gone
    inner.server_subs.retain(|channel, _| connect.subs.contains_key(channel));

    for (channel, result) in connect.subs.iter() {
        let mut entry = ServerSubscription {
            offset: result.offset,
            epoch: result.epoch.clone(),
            recoverable: result.recoverable,
        };

        // recovered publications replay in offset order before the
        // subscribed event
        if result.recovered {
            for publication in result.publications.iter() {
                if publication.offset != 0 {
                    entry.offset = publication.offset;
                }
                inner.emit_server_publication(PublicationEvent {
                    channel: channel.clone(),
                    data: publication.data.clone(),
                    offset: publication.offset,
                    info: publication.info.clone(),
                    tags: publication.tags.clone(),
                });
            }
            if result.offset > entry.offset {
                entry.offset = result.offset;
            }
        }

        inner.emit_server_subscribed(SubscribedEvent {
            channel: channel.clone(),
            recovered: result.recovered,
            position: (result.recoverable || result.positioned).then(|| StreamPosition {
                offset: entry.offset,
                epoch: result.epoch.clone(),
            }),
            data: result.data.clone(),
        });

        inner.server_subs.insert(channel.clone(), entry);
    }
}

/// Routes one push in wire order. Runs synchronously inside the reader
/// task, under the client lock.
fn route_push(
    client: &Arc<Mutex<ClientInner>>,
    reply: Reply,
    closer_write: &mpsc::Sender<bool>,
    disconnect: &DisconnectSlot,
) {
    let Reply::Push(push) = reply else {
        log::debug!("unexpected push: {:?}", reply);
        return;
    };

    let mut inner = client.lock().unwrap();
    let channel = push.channel;

    match push.data {
        PushData::Publication(publication) => {
            if let Some(sub_id) = inner.sub_name_to_id.get(&channel).copied() {
                if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
                    if sub.state == subscription::State::Subscribed {
                        sub.handle_publication(publication);
                    }
                }
            } else if let Some(entry) = inner.server_subs.get_mut(&channel) {
                if publication.offset != 0 {
                    entry.offset = publication.offset;
                }
                inner.emit_server_publication(PublicationEvent {
                    channel,
                    data: publication.data,
                    offset: publication.offset,
                    info: publication.info,
                    tags: publication.tags,
                });
            }
        }
        PushData::Join(join) => {
            if let Some(sub_id) = inner.sub_name_to_id.get(&channel).copied() {
                if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
                    sub.handle_join(join.info);
                }
            } else {
                inner.emit_server_join(channel, join.info);
            }
        }
        PushData::Leave(leave) => {
            if let Some(sub_id) = inner.sub_name_to_id.get(&channel).copied() {
                if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
                    sub.handle_leave(leave.info);
                }
            } else {
                inner.emit_server_leave(channel, leave.info);
            }
        }
        PushData::Unsubscribe(unsubscribe) => {
            if let Some(sub_id) = inner.sub_name_to_id.get(&channel).copied() {
                if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
                    if sub.state != subscription::State::Unsubscribed {
                        sub.move_to_unsubscribed(unsubscribe.code, &unsubscribe.reason);
                    }
                }
                // keep the driver's active set in sync
                if let Some(nudge) = inner.sub_ch_write.as_ref() {
                    let _ = nudge.send(sub_id);
                }
            } else if inner.server_subs.remove(&channel).is_some() {
                inner.emit_server_unsubscribed(UnsubscribedEvent {
                    channel,
                    code: unsubscribe.code,
                    reason: unsubscribe.reason,
                });
            }
        }
        PushData::Subscribe(subscribe) => {
            inner.server_subs.insert(
                channel.clone(),
                ServerSubscription {
                    offset: subscribe.offset,
                    epoch: subscribe.epoch.clone(),
                    recoverable: subscribe.recoverable,
                },
            );
            inner.emit_server_subscribed(SubscribedEvent {
                channel,
                recovered: false,
                position: (subscribe.recoverable || subscribe.positioned).then(|| {
                    StreamPosition { offset: subscribe.offset, epoch: subscribe.epoch }
                }),
                data: subscribe.data,
            });
        }
        PushData::Message(message) => {
            inner.emit_message(MessageEvent { data: message.data });
        }
        PushData::Disconnect(push_disconnect) => {
            log::debug!(
                "disconnect push, code={}, reason={}",
                push_disconnect.code,
                push_disconnect.reason
            );
            record_disconnect(disconnect, Disconnect {
                code: push_disconnect.code,
                reason: push_disconnect.reason,
                reconnect: push_disconnect.reconnect,
            });
            let _ = closer_write.try_send(push_disconnect.reconnect);
            if inner.state == State::Connected && !push_disconnect.reconnect {
                // terminal server-side disconnect closes the session
                inner.close(CloseReason::Server);
            }
        }
        PushData::Refresh(_) | PushData::Connect(_) | PushData::Empty => {
            log::debug!("ignoring push on channel {:?}", channel);
        }
    }
}
