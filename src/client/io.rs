//! Connection I/O: command multiplexing, serial inbound dispatch and
//! keepalive.
//!
//! One connection runs three tasks. The writer drains the control channel,
//! assigns command ids, and encodes batches into single frames. The reader
//! decodes inbound frames and dispatches each envelope in wire order:
//! replies resolve their in-flight waiter, pushes go to the session's push
//! handler, empty replies are server pings. The watchdog closes the
//! connection when the server ping deadline elapses.
//!
//! Push handlers run synchronously inside the reader loop, so the order of
//! user-visible events always matches the order envelopes appeared on the
//! wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::config::Protocol;
use crate::errors::{should_reconnect, ReplyError, CODE_NO_PING};
use crate::protocol::{Command, PingRequest, RawCommand, RawReply, Reply};
use crate::transport::{Connection, Frame};
use crate::utils::{decode_frames, encode_frames};

/// Why a connection ended, fed into the reconnect decision and the
/// disconnect event.
#[derive(Debug, Clone)]
pub(crate) struct Disconnect {
    pub(crate) code: u32,
    pub(crate) reason: String,
    pub(crate) reconnect: bool,
}

impl Disconnect {
    pub(crate) fn transport_closed() -> Self {
        Disconnect { code: 4, reason: "transport closed".into(), reconnect: true }
    }

    pub(crate) fn no_ping() -> Self {
        Disconnect { code: CODE_NO_PING as u32, reason: "no ping".into(), reconnect: true }
    }
}

/// Shared slot recording the first known disconnect cause. Later writers
/// lose: the first cause is the one reported.
pub(crate) type DisconnectSlot = Arc<Mutex<Option<Disconnect>>>;

pub(crate) fn record_disconnect(slot: &DisconnectSlot, disconnect: Disconnect) {
    slot.lock().unwrap().get_or_insert(disconnect);
}

/// Messages from the session engine to the writer task.
pub(crate) enum ControlMessage {
    /// Request/reply command. The writer assigns the id, registers the
    /// waiter and enforces the timeout.
    Call {
        command: Command,
        reply: oneshot::Sender<Result<Reply, ReplyError>>,
        timeout: Duration,
    },
    /// Pre-registered envelope written verbatim (the connect command,
    /// whose waiter is registered before the transport opens).
    Registered(RawCommand),
    /// Best-effort command without an id and without a reply.
    Fire(Command),
    StartBatching,
    StopBatching,
}

pub(crate) type ControlSender = mpsc::Sender<ControlMessage>;
pub(crate) type ReplySender = oneshot::Sender<Result<Reply, ReplyError>>;

/// In-flight command table.
///
/// Ids are strictly increasing within a session and never reused; each
/// record owns an optional timeout task aborted on resolution.
pub(crate) struct InFlightMap {
    next_id: AtomicU32,
    map: Mutex<HashMap<u32, (ReplySender, Option<AbortHandle>)>>,
}

impl InFlightMap {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(InFlightMap {
            next_id: AtomicU32::new(1),
            map: Mutex::new(HashMap::new()),
        })
    }

    fn alloc_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                break id;
            }
        }
    }

    /// Registers a waiter without writing anything and returns its id.
    /// Emulated transports use this to pre-register the connect command
    /// whose reply arrives before the upstream channel exists.
    pub(crate) fn register(
        self: &Arc<Self>,
        rt: &Handle,
        reply: ReplySender,
        timeout: Duration,
    ) -> u32 {
        let id = self.alloc_id();

        let abort_handle = if timeout == Duration::MAX {
            None
        } else {
            let map = self.clone();
            Some(
                rt.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some((ch, _)) = map.map.lock().unwrap().remove(&id) {
                        let _ = ch.send(Err(ReplyError::Timeout(timeout)));
                    }
                })
                .abort_handle(),
            )
        };

        self.map.lock().unwrap().insert(id, (reply, abort_handle));
        id
    }

    /// Routes a reply to its waiter. Returns false for unknown ids.
    pub(crate) fn resolve(&self, id: u32, reply: Reply) -> bool {
        match self.map.lock().unwrap().remove(&id) {
            Some((ch, abort_handle)) => {
                let _ = ch.send(Ok(reply));
                if let Some(handle) = abort_handle {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn reject(&self, id: u32, err: ReplyError) {
        if let Some((ch, abort_handle)) = self.map.lock().unwrap().remove(&id) {
            let _ = ch.send(Err(err));
            if let Some(handle) = abort_handle {
                handle.abort();
            }
        }
    }

    /// Rejects every in-flight command with `Closed` and empties the table.
    pub(crate) fn drain_close(&self) {
        for (_, (sender, abort_handle)) in self.map.lock().unwrap().drain() {
            let _ = sender.send(Err(ReplyError::Closed));
            if let Some(handle) = abort_handle {
                handle.abort();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) enum KeepaliveMode {
    #[default]
    Disabled,
    /// The server pings; the watchdog fires after `watchdog` of silence.
    /// `pong` asks the client to answer each ping with an empty frame.
    Server { watchdog: Duration, pong: bool },
}

/// Keepalive state shared between the handshake (which arms it from the
/// connect reply) and the connection tasks.
pub(crate) struct Keepalive {
    mode: Mutex<KeepaliveMode>,
    activity: mpsc::Sender<()>,
    ping_task: Mutex<Option<AbortHandle>>,
}

impl Keepalive {
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<()>) {
        let (activity_tx, activity_rx) = mpsc::channel(1);
        let keepalive = Arc::new(Keepalive {
            mode: Mutex::new(KeepaliveMode::Disabled),
            activity: activity_tx,
            ping_task: Mutex::new(None),
        });
        (keepalive, activity_rx)
    }

    /// Switches to server-driven mode: the watchdog arms for
    /// `ping + max_delay` and any inbound frame rearms it.
    pub(crate) fn arm_server(&self, ping: Duration, max_delay: Duration, pong: bool) {
        *self.mode.lock().unwrap() = KeepaliveMode::Server { watchdog: ping + max_delay, pong };
        // nudge the watchdog so it picks up the new deadline
        let _ = self.activity.try_send(());
    }

    /// Switches to client-driven mode: a ping command is issued every
    /// `interval` and must be answered within `pong_timeout`.
    pub(crate) fn arm_client(
        self: &Arc<Self>,
        rt: &Handle,
        interval: Duration,
        pong_timeout: Duration,
        control_write: ControlSender,
        closer_write: mpsc::Sender<bool>,
        disconnect: DisconnectSlot,
    ) {
        if interval.is_zero() {
            return;
        }

        let task = rt.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let (tx, rx) = oneshot::channel();
                let message = ControlMessage::Call {
                    command: Command::Ping(PingRequest {}),
                    reply: tx,
                    timeout: pong_timeout,
                };
                if control_write.send(message).await.is_err() {
                    return;
                }

                match rx.await {
                    Ok(Ok(_)) => continue,
                    Ok(Err(ReplyError::Timeout(_))) => {
                        log::debug!("no pong from server, disconnecting");
                        record_disconnect(&disconnect, Disconnect::no_ping());
                        let _ = closer_write.try_send(true);
                        return;
                    }
                    _ => return,
                }
            }
        });

        *self.ping_task.lock().unwrap() = Some(task.abort_handle());
    }

    fn pong_required(&self) -> bool {
        matches!(*self.mode.lock().unwrap(), KeepaliveMode::Server { pong: true, .. })
    }

    fn watchdog_timeout(&self) -> Option<Duration> {
        match *self.mode.lock().unwrap() {
            KeepaliveMode::Server { watchdog, .. } => Some(watchdog),
            _ => None,
        }
    }

    fn disarm(&self) {
        if let Some(handle) = self.ping_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn rearm(&self) {
        let _ = self.activity.try_send(());
    }
}

/// Runs one connection to completion and reports why it ended.
///
/// Owns the transport connection exclusively; when this future resolves
/// the in-flight table has been drained and every waiter rejected.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_connection(
    rt: Handle,
    conn: Connection,
    in_flight: Arc<InFlightMap>,
    control_read: mpsc::Receiver<ControlMessage>,
    control_write: ControlSender,
    closer_read: mpsc::Receiver<bool>,
    closer_write: mpsc::Sender<bool>,
    keepalive: Arc<Keepalive>,
    activity_read: mpsc::Receiver<()>,
    disconnect: DisconnectSlot,
    protocol: Protocol,
    batching: bool,
    on_push: impl Fn(Reply) + Send + Sync + 'static,
    on_error: impl Fn(anyhow::Error) + Send + Sync + 'static,
) -> Disconnect {
    let Connection { sink, stream } = conn;
    let on_error = Arc::new(on_error);

    let watchdog_task = {
        let keepalive = keepalive.clone();
        let closer_write = closer_write.clone();
        let disconnect = disconnect.clone();
        rt.spawn(watchdog(keepalive, activity_read, closer_write, disconnect))
    };

    let reader_task = rt.spawn(reader(
        stream,
        closer_read,
        in_flight.clone(),
        keepalive.clone(),
        disconnect.clone(),
        control_write,
        protocol,
        on_push,
        on_error.clone(),
    ));

    let (writer_stop_tx, writer_stop_rx) = oneshot::channel();
    let writer_task = rt.spawn(writer(
        sink,
        control_read,
        writer_stop_rx,
        in_flight.clone(),
        rt.clone(),
        protocol,
        batching,
        on_error,
    ));

    // the engine keeps control senders alive across the teardown, so the
    // writer is stopped explicitly once the reader is done
    let reader_result = reader_task.await;
    let _ = writer_stop_tx.send(());
    let _ = writer_task.await;
    watchdog_task.abort();
    keepalive.disarm();

    in_flight.drain_close();

    let do_reconnect = reader_result.unwrap_or(true);
    let cause = disconnect.lock().unwrap().take();
    let cause = cause.unwrap_or_else(|| {
        Disconnect { reconnect: do_reconnect, ..Disconnect::transport_closed() }
    });
    log::debug!(
        "connection finished, code={}, reason={}, reconnect={}",
        cause.code,
        cause.reason,
        cause.reconnect
    );
    cause
}

#[allow(clippy::too_many_arguments)]
async fn reader(
    mut stream: crate::transport::FrameStream,
    mut closer_read: mpsc::Receiver<bool>,
    in_flight: Arc<InFlightMap>,
    keepalive: Arc<Keepalive>,
    disconnect: DisconnectSlot,
    control_write: ControlSender,
    protocol: Protocol,
    on_push: impl Fn(Reply) + Send + Sync + 'static,
    on_error: Arc<impl Fn(anyhow::Error) + Send + Sync + 'static>,
) -> bool {
    'outer: loop {
        tokio::select! {
            biased;

            do_reconnect = closer_read.recv() => {
                break 'outer do_reconnect.unwrap_or(false);
            }

            inbound = stream.next() => {
                let frame = match inbound {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        log::debug!("failed to read frame: {}", err);
                        on_error(anyhow!(err));
                        break 'outer true;
                    }
                    None => break 'outer true,
                };

                // any inbound traffic proves the connection is alive
                keepalive.rearm();

                if let Frame::Close(close_frame) = frame {
                    if let Some(close_frame) = close_frame {
                        let reconnect = should_reconnect(close_frame.code);
                        log::debug!(
                            "connection closed by remote, code={}, reason={}",
                            close_frame.code,
                            close_frame.reason
                        );
                        record_disconnect(&disconnect, Disconnect {
                            code: close_frame.code as u32,
                            reason: close_frame.reason,
                            reconnect,
                        });
                        break 'outer reconnect;
                    }
                    break 'outer true;
                }

                let result = decode_frames::<RawReply>(&frame, protocol, |decoded| {
                    let raw = match decoded {
                        Ok(raw) => raw,
                        Err(err) => {
                            on_error(err);
                            return Ok(());
                        }
                    };

                    let id = raw.id;
                    let reply = Reply::from(raw);

                    if id != 0 {
                        if !in_flight.resolve(id, reply) {
                            log::debug!("unknown reply id={}", id);
                            on_error(anyhow!("unknown reply id={}", id));
                        }
                    } else if let Reply::Empty = reply {
                        // server ping
                        if keepalive.pong_required() {
                            let _ = control_write.try_send(ControlMessage::Fire(Command::Empty));
                        }
                    } else {
                        on_push(reply);
                    }

                    Ok(())
                });

                if let Err(err) = result {
                    on_error(err);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn writer(
    mut sink: crate::transport::FrameSink,
    mut control_read: mpsc::Receiver<ControlMessage>,
    mut stop: oneshot::Receiver<()>,
    in_flight: Arc<InFlightMap>,
    rt: Handle,
    protocol: Protocol,
    mut batching: bool,
    on_error: Arc<impl Fn(anyhow::Error) + Send + Sync + 'static>,
) {
    let mut staged: Vec<RawCommand> = Vec::new();
    let mut batch = Vec::new();

    'outer: loop {
        let count = tokio::select! {
            biased;

            _ = &mut stop => break 'outer,

            count = control_read.recv_many(&mut batch, 32) => count,
        };
        if count == 0 {
            break 'outer;
        }

        for message in batch.drain(..) {
            match message {
                ControlMessage::Call { command, reply, timeout } => {
                    if timeout == Duration::ZERO {
                        let _ = reply.send(Err(ReplyError::Timeout(timeout)));
                        continue;
                    }
                    let id = in_flight.register(&rt, reply, timeout);
                    let mut raw = RawCommand::from(command);
                    raw.id = id;
                    staged.push(raw);
                }
                ControlMessage::Registered(raw) => staged.push(raw),
                ControlMessage::Fire(command) => staged.push(RawCommand::from(command)),
                ControlMessage::StartBatching => batching = true,
                ControlMessage::StopBatching => batching = false,
            }
        }

        if batching || staged.is_empty() {
            continue;
        }

        // the whole accumulated batch goes out as one frame
        let ids: Vec<u32> = staged.iter().map(|raw| raw.id).collect();
        let frame = encode_frames(&staged, protocol, |idx| {
            if ids[idx] != 0 {
                in_flight.reject(ids[idx], ReplyError::Write("failed to encode".into()));
            }
        });
        staged.clear();

        let Some(frame) = frame else {
            continue;
        };

        if let Err(err) = sink.send(frame).await {
            for id in ids {
                if id != 0 {
                    in_flight.reject(id, ReplyError::Write(err.to_string()));
                }
            }
            on_error(anyhow!(err));
            break 'outer;
        }
    }

    let _ = sink.send(Frame::Close(None)).await;
    let _ = sink.close().await;
}

async fn watchdog(
    keepalive: Arc<Keepalive>,
    mut activity_read: mpsc::Receiver<()>,
    closer_write: mpsc::Sender<bool>,
    disconnect: DisconnectSlot,
) {
    loop {
        match keepalive.watchdog_timeout() {
            None => {
                if activity_read.recv().await.is_none() {
                    return;
                }
            }
            Some(timeout) => {
                tokio::select! {
                    item = activity_read.recv() => {
                        if item.is_none() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(timeout) => {
                        log::debug!("no ping from server, disconnecting");
                        record_disconnect(&disconnect, Disconnect::no_ping());
                        let _ = closer_write.try_send(true);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_flight_ids_are_monotonic_and_unique() {
        let map = InFlightMap::new();
        let rt = Handle::current();

        let mut last = 0;
        for _ in 0..64 {
            let (tx, _rx) = oneshot::channel();
            let id = map.register(&rt, tx, Duration::MAX);
            assert!(id > last);
            last = id;
        }
        assert_eq!(map.len(), 64);
    }

    #[tokio::test]
    async fn drain_close_rejects_everything_once() {
        let map = InFlightMap::new();
        let rt = Handle::current();

        let (tx, rx) = oneshot::channel();
        map.register(&rt, tx, Duration::MAX);
        map.drain_close();

        assert!(matches!(rx.await.unwrap(), Err(ReplyError::Closed)));
        assert_eq!(map.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn registered_command_times_out() {
        let map = InFlightMap::new();
        let rt = Handle::current();

        let (tx, rx) = oneshot::channel();
        let id = map.register(&rt, tx, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(matches!(rx.await.unwrap(), Err(ReplyError::Timeout(_))));
        // the record is gone, a late reply is a no-op
        assert!(!map.resolve(id, Reply::Empty));
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn resolved_reply_reaches_waiter() {
        let map = InFlightMap::new();
        let rt = Handle::current();

        let (tx, rx) = oneshot::channel();
        let id = map.register(&rt, tx, Duration::from_secs(5));
        assert!(map.resolve(id, Reply::Empty));
        assert!(matches!(rx.await.unwrap(), Ok(Reply::Empty)));
    }
}
