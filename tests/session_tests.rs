//! Session engine tests against a scripted in-memory transport.
//!
//! Every test plays the server side by hand: it reads the frames the client
//! wrote and feeds replies and pushes back, so state transitions, ordering
//! and timer behavior can be asserted deterministically (timers run under
//! tokio's paused clock).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use tokio_realtime::client::{Client, HistoryOptions, RequestError, State};
use tokio_realtime::config::Config;
use tokio_realtime::errors::ReplyError;
use tokio_realtime::transport::{
    CloseFrame, ConnectFuture, Connection, Endpoint, Frame, Transport, TransportError,
};

/// Test-side handle of one scripted connection.
struct ScriptedServer {
    to_client: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl ScriptedServer {
    /// Waits for the next text frame and returns its decoded envelopes,
    /// one per line.
    async fn recv_commands(&mut self) -> Vec<serde_json::Value> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(120), self.from_client.recv())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client side of the transport is gone");
            match frame {
                Frame::Text(text) => {
                    return text
                        .lines()
                        .map(|line| serde_json::from_str(line).unwrap())
                        .collect();
                }
                Frame::Close(_) => continue,
                Frame::Binary(_) => panic!("unexpected binary frame on json protocol"),
            }
        }
    }

    fn no_frame_written(&mut self) -> bool {
        matches!(
            self.from_client.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        )
    }

    fn send_json(&self, value: serde_json::Value) {
        let _ = self.to_client.send(Ok(Frame::Text(value.to_string())));
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(Ok(Frame::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))));
    }
}

type ScriptedConn = (
    mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    mpsc::UnboundedSender<Frame>,
);

/// A transport whose connections are pre-scripted. Each `connect` call
/// consumes the next scripted connection; when none are left it fails.
struct ScriptedTransport {
    emulation: bool,
    saw_initial_frame: AtomicBool,
    conns: Mutex<VecDeque<ScriptedConn>>,
}

impl ScriptedTransport {
    fn new(connections: usize) -> (Arc<Self>, Vec<ScriptedServer>) {
        Self::with_emulation(connections, false)
    }

    fn with_emulation(connections: usize, emulation: bool) -> (Arc<Self>, Vec<ScriptedServer>) {
        let mut conns = VecDeque::new();
        let mut servers = Vec::new();
        for _ in 0..connections {
            let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
            let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
            conns.push_back((to_client_rx, from_client_tx));
            servers.push(ScriptedServer {
                to_client: to_client_tx,
                from_client: from_client_rx,
            });
        }
        (
            Arc::new(ScriptedTransport {
                emulation,
                saw_initial_frame: AtomicBool::new(false),
                conns: Mutex::new(conns),
            }),
            servers,
        )
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn emulation(&self) -> bool {
        self.emulation
    }

    fn connect(
        &self,
        _endpoint: &str,
        _protocol: tokio_realtime::config::Protocol,
        initial_frame: Option<Frame>,
    ) -> ConnectFuture {
        if initial_frame.is_some() {
            self.saw_initial_frame.store(true, Ordering::SeqCst);
        }
        let conn = self.conns.lock().unwrap().pop_front();
        Box::pin(async move {
            let Some((to_client_rx, from_client_tx)) = conn else {
                return Err(TransportError::Connect(anyhow::anyhow!(
                    "no scripted connection left"
                )));
            };
            if let Some(frame) = initial_frame {
                let _ = from_client_tx.send(frame);
            }
            let sink = futures::sink::unfold(from_client_tx, |tx, frame: Frame| async move {
                tx.send(frame)
                    .map_err(|_| TransportError::Write("scripted server gone".into()))?;
                Ok(tx)
            });
            let stream = futures::stream::unfold(to_client_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Connection {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}

fn scripted_client(transport: Arc<ScriptedTransport>, config: Config) -> Client {
    let _ = env_logger::builder().is_test(true).try_init();
    Client::with_endpoints(vec![Endpoint::new("scripted://server", transport)], config)
}

fn connect_reply(id: u64) -> serde_json::Value {
    json!({
        "id": id,
        "connect": {
            "client": "c1",
            "version": "5.0.0",
            "session": "s",
            "node": "n",
            "ping": 25
        }
    })
}

fn command_id(command: &serde_json::Value) -> u64 {
    command["id"].as_u64().expect("command without id")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn fresh_connect_lifecycle() {
    let (transport, mut servers) = ScriptedTransport::new(1);
    let mut server = servers.remove(0);

    let config = Config::new().use_json().with_token("T").with_name("tester");
    let client = scripted_client(transport, config);

    let states = Arc::new(Mutex::new(Vec::new()));
    let states1 = states.clone();
    client.on_state(move |event| {
        states1.lock().unwrap().push((event.prev_state, event.state));
    });

    let connected = Arc::new(Mutex::new(None));
    let connected1 = connected.clone();
    client.on_connected(move |event| {
        *connected1.lock().unwrap() = Some(event);
    });

    let connect_fut = client.connect();

    let commands = server.recv_commands().await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0]["connect"]["token"], "T");
    assert_eq!(commands[0]["connect"]["name"], "tester");
    let id = command_id(&commands[0]);

    server.send_json(json!({
        "id": id,
        "connect": {
            "client": "c1",
            "version": "5.0.0",
            "session": "s",
            "node": "n",
            "ping": 25,
            "pong": true
        }
    }));

    connect_fut.await.unwrap();
    assert_eq!(client.state(), State::Connected);
    assert_eq!(client.client_id(), "c1");

    assert_eq!(
        *states.lock().unwrap(),
        vec![
            (State::Disconnected, State::Connecting),
            (State::Connecting, State::Connected),
        ]
    );

    let event = connected.lock().unwrap().take().unwrap();
    assert_eq!(event.client, "c1");
    assert_eq!(event.transport, "scripted");

    // server ping is an empty reply; pong was requested, expect an empty
    // command frame back
    server.send_json(json!({}));
    let pong = server.recv_commands().await;
    assert_eq!(pong, vec![json!({})]);
}

#[tokio::test(start_paused = true)]
async fn commands_queue_until_connected() {
    let (transport, mut servers) = ScriptedTransport::new(1);
    let mut server = servers.remove(0);

    let client = scripted_client(transport, Config::new().use_json());

    // issued before connect: nothing may hit the wire
    let publish_fut = client.publish("x", br#"{"v":1}"#.to_vec());
    assert!(server.no_frame_written());

    let connect_fut = client.connect();
    let commands = server.recv_commands().await;
    assert_eq!(commands.len(), 1, "only the connect command goes out first");
    server.send_json(connect_reply(command_id(&commands[0])));
    connect_fut.await.unwrap();

    // now the queued publish flushes
    let commands = server.recv_commands().await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0]["publish"]["channel"], "x");
    assert_eq!(commands[0]["publish"]["data"], json!({"v": 1}));
    let id = command_id(&commands[0]);
    assert!(id > 1, "command ids grow monotonically after connect");

    server.send_json(json!({"id": id, "publish": {}}));
    publish_fut.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn rpc_call_times_out() {
    let (transport, mut servers) = ScriptedTransport::new(1);
    let mut server = servers.remove(0);

    let client = scripted_client(transport, Config::new().use_json());
    let connect_fut = client.connect();
    let commands = server.recv_commands().await;
    server.send_json(connect_reply(command_id(&commands[0])));
    connect_fut.await.unwrap();

    let rpc_fut = client.rpc("m", Vec::new());
    let commands = server.recv_commands().await;
    assert_eq!(commands[0]["rpc"]["method"], "m");

    // no reply scripted: the 5 s call timeout fires
    let err = rpc_fut.await.unwrap_err();
    assert!(
        matches!(
            err,
            RequestError::ReplyError(ReplyError::Timeout(_)) | RequestError::Timeout(_)
        ),
        "unexpected error: {err}"
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_recovers_server_subscription() {
    let (transport, mut servers) = ScriptedTransport::new(2);
    let mut second = servers.remove(1);
    let mut first = servers.remove(0);

    let client = scripted_client(transport, Config::new().use_json());

    let events = Arc::new(Mutex::new(Vec::new()));
    let events1 = events.clone();
    client.on_publication(move |event| {
        events1
            .lock()
            .unwrap()
            .push(format!("pub:{}:{}", event.channel, event.offset));
    });
    let events2 = events.clone();
    client.on_subscribed(move |event| {
        events2
            .lock()
            .unwrap()
            .push(format!("subscribed:{}:{}", event.channel, event.recovered));
    });

    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let disconnects1 = disconnects.clone();
    client.on_disconnected(move |event| {
        disconnects1.lock().unwrap().push((event.code, event.reason));
    });

    let connect_fut = client.connect();
    let commands = first.recv_commands().await;
    first.send_json(json!({
        "id": command_id(&commands[0]),
        "connect": {
            "client": "c1", "session": "s", "node": "n", "ping": 25,
            "subs": {
                "c": {"recoverable": true, "epoch": "e", "offset": 10}
            }
        }
    }));
    connect_fut.await.unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        vec!["subscribed:c:false".to_string()]
    );
    events.lock().unwrap().clear();

    // drop the connection with a reconnectable transport code
    first.close(4, "crash");

    // the next connect command asks for the gap since offset 10
    let commands = second.recv_commands().await;
    let connect = &commands[0]["connect"];
    assert_eq!(connect["subs"]["c"]["recover"], json!(true));
    assert_eq!(connect["subs"]["c"]["offset"], json!(10));
    assert_eq!(connect["subs"]["c"]["epoch"], "e");

    second.send_json(json!({
        "id": command_id(&commands[0]),
        "connect": {
            "client": "c2", "session": "s", "node": "n", "ping": 25,
            "subs": {
                "c": {
                    "recoverable": true, "epoch": "e", "offset": 12,
                    "recovered": true,
                    "publications": [
                        {"data": {"n": 11}, "offset": 11},
                        {"data": {"n": 12}, "offset": 12}
                    ]
                }
            }
        }
    }));

    wait_until(|| client.state() == State::Connected).await;
    wait_until(|| events.lock().unwrap().len() == 3).await;

    // missed publications replay in offset order, then the subscribed event
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "pub:c:11".to_string(),
            "pub:c:12".to_string(),
            "subscribed:c:true".to_string(),
        ]
    );

    assert_eq!(*disconnects.lock().unwrap(), vec![(4, "crash".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_position_closes_session() {
    let (transport, mut servers) = ScriptedTransport::new(1);
    let mut server = servers.remove(0);

    let client = scripted_client(transport, Config::new().use_json());

    let closed = Arc::new(Mutex::new(None));
    let closed1 = closed.clone();
    client.on_close(move |event| {
        *closed1.lock().unwrap() = Some(event.reason);
    });

    let connect_fut = client.connect();
    let commands = server.recv_commands().await;
    server.send_json(json!({
        "id": command_id(&commands[0]),
        "error": {"code": 112, "message": "unrecoverable position"}
    }));

    assert!(connect_fut.await.is_err());
    wait_until(|| client.state() == State::Closed).await;

    let reason = closed.lock().unwrap().take().unwrap();
    assert_eq!(reason.to_string(), "unrecoverable position");

    // every later call fails fast
    let err = client.publish("x", b"{}".to_vec()).await.unwrap_err();
    assert!(
        matches!(
            err,
            RequestError::Closed | RequestError::ReplyError(ReplyError::Closed)
        ),
        "unexpected error: {err}"
    );
}

#[tokio::test(start_paused = true)]
async fn missing_server_ping_triggers_reconnect() {
    let (transport, mut servers) = ScriptedTransport::new(2);
    let mut second = servers.remove(1);
    let mut first = servers.remove(0);

    let client = scripted_client(transport, Config::new().use_json());

    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let disconnects1 = disconnects.clone();
    client.on_disconnected(move |event| {
        disconnects1.lock().unwrap().push((event.code, event.reason));
    });

    let connect_fut = client.connect();
    let commands = first.recv_commands().await;
    // ping 25 + max_server_ping_delay 10 arms a 35 s watchdog
    first.send_json(connect_reply(command_id(&commands[0])));
    connect_fut.await.unwrap();

    // withhold all further frames; the watchdog fires and the client
    // reconnects on the second scripted connection
    let commands = second.recv_commands().await;
    assert!(commands[0]["connect"].is_object());

    assert_eq!(
        *disconnects.lock().unwrap(),
        vec![(11, "no ping".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn subscription_lifecycle_and_publications() {
    let (transport, mut servers) = ScriptedTransport::new(1);
    let mut server = servers.remove(0);

    let client = scripted_client(transport, Config::new().use_json());
    let connect_fut = client.connect();
    let commands = server.recv_commands().await;
    server.send_json(connect_reply(command_id(&commands[0])));
    connect_fut.await.unwrap();

    let sub = client.new_subscription("news");
    let offsets = Arc::new(Mutex::new(Vec::new()));
    let offsets1 = offsets.clone();
    sub.on_publication(move |event| {
        offsets1.lock().unwrap().push(event.offset);
    });

    let sub_fut = sub.subscribe();
    let commands = server.recv_commands().await;
    assert_eq!(commands[0]["subscribe"]["channel"], "news");
    let id = command_id(&commands[0]);
    server.send_json(json!({
        "id": id,
        "subscribe": {"recoverable": true, "epoch": "e", "offset": 5}
    }));
    sub_fut.await.unwrap();

    assert_eq!(sub.state(), tokio_realtime::subscription::State::Subscribed);
    let position = sub.position().unwrap();
    assert_eq!(position.offset, 5);
    assert_eq!(position.epoch, "e");

    // a publication advances the tracked position before emitting
    server.send_json(json!({
        "push": {"channel": "news", "pub": {"data": {"v": 7}, "offset": 6}}
    }));
    wait_until(|| offsets.lock().unwrap().len() == 1).await;
    assert_eq!(*offsets.lock().unwrap(), vec![6]);
    assert_eq!(sub.position().unwrap().offset, 6);

    // idempotence: subscribing a subscribed channel resolves immediately
    sub.subscribe().await.unwrap();

    // server-initiated unsubscribe push drops the subscription
    server.send_json(json!({
        "push": {"channel": "news", "unsubscribe": {"code": 2500, "reason": "server"}}
    }));
    wait_until(|| sub.state() == tokio_realtime::subscription::State::Unsubscribed).await;
}

#[tokio::test(start_paused = true)]
async fn pending_subscriptions_flush_in_one_frame() {
    let (transport, mut servers) = ScriptedTransport::new(1);
    let mut server = servers.remove(0);

    let client = scripted_client(transport, Config::new().use_json());

    let sub_a = client.new_subscription("alpha");
    let sub_b = client.new_subscription("beta");
    let fut_a = sub_a.subscribe();
    let fut_b = sub_b.subscribe();

    let connect_fut = client.connect();
    let commands = server.recv_commands().await;
    assert_eq!(commands.len(), 1);
    server.send_json(connect_reply(command_id(&commands[0])));
    connect_fut.await.unwrap();

    // both resubscribes travel in a single batched frame
    let commands = server.recv_commands().await;
    assert_eq!(commands.len(), 2);
    let mut channels: Vec<&str> = commands
        .iter()
        .map(|c| c["subscribe"]["channel"].as_str().unwrap())
        .collect();
    channels.sort_unstable();
    assert_eq!(channels, vec!["alpha", "beta"]);

    for command in &commands {
        server.send_json(json!({"id": command_id(command), "subscribe": {}}));
    }
    fut_a.await.unwrap();
    fut_b.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn subscribe_error_fails_subscription() {
    let (transport, mut servers) = ScriptedTransport::new(1);
    let mut server = servers.remove(0);

    let client = scripted_client(transport, Config::new().use_json());
    let connect_fut = client.connect();
    let commands = server.recv_commands().await;
    server.send_json(connect_reply(command_id(&commands[0])));
    connect_fut.await.unwrap();

    let sub = client.new_subscription("forbidden");
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors1 = errors.clone();
    sub.on_error(move |err| {
        errors1.lock().unwrap().push(err.to_string());
    });

    let sub_fut = sub.subscribe();
    let commands = server.recv_commands().await;
    server.send_json(json!({
        "id": command_id(&commands[0]),
        "error": {"code": 103, "message": "permission denied"}
    }));

    assert!(sub_fut.await.is_err());
    assert_eq!(sub.state(), tokio_realtime::subscription::State::Unsubscribed);
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn history_and_presence_calls() {
    let (transport, mut servers) = ScriptedTransport::new(1);
    let mut server = servers.remove(0);

    let client = scripted_client(transport, Config::new().use_json());
    let connect_fut = client.connect();
    let commands = server.recv_commands().await;
    server.send_json(connect_reply(command_id(&commands[0])));
    connect_fut.await.unwrap();

    let history_fut = client.history("c", HistoryOptions { limit: 10, ..Default::default() });
    let commands = server.recv_commands().await;
    assert_eq!(commands[0]["history"]["channel"], "c");
    assert_eq!(commands[0]["history"]["limit"], 10);
    server.send_json(json!({
        "id": command_id(&commands[0]),
        "history": {
            "publications": [{"data": {"a": 1}, "offset": 1}],
            "epoch": "e",
            "offset": 1
        }
    }));
    let history = history_fut.await.unwrap();
    assert_eq!(history.publications.len(), 1);
    assert_eq!(history.epoch, "e");

    let presence_fut = client.presence("c");
    let commands = server.recv_commands().await;
    server.send_json(json!({
        "id": command_id(&commands[0]),
        "presence": {"presence": {"c1": {"user": "u1", "client": "c1"}}}
    }));
    let presence = presence_fut.await.unwrap();
    assert_eq!(presence.presence.len(), 1);
    assert_eq!(presence.presence["c1"].user, "u1");
}

#[tokio::test(start_paused = true)]
async fn emulation_transport_gets_connect_as_initial_frame() {
    let (transport, mut servers) = ScriptedTransport::with_emulation(1, true);
    let mut server = servers.remove(0);
    let probe = transport.clone();

    let client = scripted_client(transport, Config::new().use_json());
    let connect_fut = client.connect();

    // the connect command travels as the transport's initial frame, with
    // its reply waiter registered before the transport opened
    let commands = server.recv_commands().await;
    assert!(commands[0]["connect"].is_object());
    assert!(probe.saw_initial_frame.load(Ordering::SeqCst));

    server.send_json(connect_reply(command_id(&commands[0])));
    connect_fut.await.unwrap();
    assert_eq!(client.state(), State::Connected);
}

#[tokio::test(start_paused = true)]
async fn user_disconnect_stops_the_session() {
    let (transport, mut servers) = ScriptedTransport::new(1);
    let mut server = servers.remove(0);

    let client = scripted_client(transport, Config::new().use_json());
    let connect_fut = client.connect();
    let commands = server.recv_commands().await;
    server.send_json(connect_reply(command_id(&commands[0])));
    connect_fut.await.unwrap();

    client.disconnect().await;
    assert_eq!(client.state(), State::Disconnected);

    // no reconnect attempt happens afterwards
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.state(), State::Disconnected);
}
