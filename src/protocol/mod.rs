//! Protocol model: typed commands, replies and pushes over the raw wire
//! envelopes.
//!
//! The wire format multiplexes every request kind into one envelope struct
//! with optional fields (`RawCommand` / `RawReply`). The enums here give the
//! rest of the crate a closed set of variants to match on; conversions in
//! both directions are lossless. An envelope with no payload at all maps to
//! `Empty`, which the server uses as an application-level ping.

mod wire;

pub use wire::*;

use serde::{Serialize, Serializer};

/// Client-to-server command.
#[derive(Debug, Clone)]
pub enum Command {
    Connect(ConnectRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Publish(PublishRequest),
    Presence(PresenceRequest),
    PresenceStats(PresenceStatsRequest),
    History(HistoryRequest),
    Ping(PingRequest),
    Send(SendRequest),
    Rpc(RpcRequest),
    Refresh(RefreshRequest),
    SubRefresh(SubRefreshRequest),
    /// No payload; sent as a pong answer to server pings.
    Empty,
}

impl Command {
    /// Fire-and-forget commands carry no id and get no reply.
    pub(crate) fn expects_reply(&self) -> bool {
        !matches!(
            self,
            Command::Send(_) | Command::Unsubscribe(_) | Command::Empty
        )
    }
}

/// Server-to-client reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Push(Push),
    Error(Error),
    Connect(ConnectResult),
    Subscribe(SubscribeResult),
    Unsubscribe(UnsubscribeResult),
    Publish(PublishResult),
    Presence(PresenceResult),
    PresenceStats(PresenceStatsResult),
    History(HistoryResult),
    Ping(PingResult),
    Rpc(RpcResult),
    Refresh(RefreshResult),
    SubRefresh(SubRefreshResult),
    /// No payload; the server-initiated ping frame.
    Empty,
}

/// Server-initiated push bound to a channel (possibly empty for
/// connection-scoped pushes such as `Message` and `Disconnect`).
#[derive(Debug, Clone)]
pub struct Push {
    pub channel: String,
    pub data: PushData,
}

#[derive(Debug, Clone)]
pub enum PushData {
    Publication(Publication),
    Join(Join),
    Leave(Leave),
    Unsubscribe(Unsubscribe),
    Message(Message),
    Subscribe(Subscribe),
    Connect(Box<Connect>),
    Disconnect(Disconnect),
    Refresh(Refresh),
    Empty,
}

impl From<Command> for RawCommand {
    fn from(value: Command) -> Self {
        match value {
            Command::Connect(v) => RawCommand { connect: Some(v), ..Default::default() },
            Command::Subscribe(v) => RawCommand { subscribe: Some(v), ..Default::default() },
            Command::Unsubscribe(v) => RawCommand { unsubscribe: Some(v), ..Default::default() },
            Command::Publish(v) => RawCommand { publish: Some(v), ..Default::default() },
            Command::Presence(v) => RawCommand { presence: Some(v), ..Default::default() },
            Command::PresenceStats(v) => {
                RawCommand { presence_stats: Some(v), ..Default::default() }
            }
            Command::History(v) => RawCommand { history: Some(v), ..Default::default() },
            Command::Ping(v) => RawCommand { ping: Some(v), ..Default::default() },
            Command::Send(v) => RawCommand { send: Some(v), ..Default::default() },
            Command::Rpc(v) => RawCommand { rpc: Some(v), ..Default::default() },
            Command::Refresh(v) => RawCommand { refresh: Some(v), ..Default::default() },
            Command::SubRefresh(v) => RawCommand { sub_refresh: Some(v), ..Default::default() },
            Command::Empty => RawCommand::default(),
        }
    }
}

impl From<RawReply> for Reply {
    // a well-formed envelope populates exactly one slot; the first one
    // found wins and a bare envelope is the server ping
    fn from(value: RawReply) -> Self {
        let RawReply {
            error,
            push,
            connect,
            subscribe,
            unsubscribe,
            publish,
            presence,
            presence_stats,
            history,
            ping,
            rpc,
            refresh,
            sub_refresh,
            ..
        } = value;

        error
            .map(Reply::Error)
            .or_else(|| push.map(|push| Reply::Push(push.into())))
            .or_else(|| connect.map(Reply::Connect))
            .or_else(|| subscribe.map(Reply::Subscribe))
            .or_else(|| unsubscribe.map(Reply::Unsubscribe))
            .or_else(|| publish.map(Reply::Publish))
            .or_else(|| presence.map(Reply::Presence))
            .or_else(|| presence_stats.map(Reply::PresenceStats))
            .or_else(|| history.map(Reply::History))
            .or_else(|| ping.map(Reply::Ping))
            .or_else(|| rpc.map(Reply::Rpc))
            .or_else(|| refresh.map(Reply::Refresh))
            .or_else(|| sub_refresh.map(Reply::SubRefresh))
            .unwrap_or(Reply::Empty)
    }
}

impl From<RawPush> for Push {
    fn from(value: RawPush) -> Self {
        let RawPush {
            channel,
            publication,
            join,
            leave,
            unsubscribe,
            message,
            subscribe,
            connect,
            disconnect,
            refresh,
        } = value;

        let data = publication
            .map(PushData::Publication)
            .or_else(|| join.map(PushData::Join))
            .or_else(|| leave.map(PushData::Leave))
            .or_else(|| unsubscribe.map(PushData::Unsubscribe))
            .or_else(|| message.map(PushData::Message))
            .or_else(|| subscribe.map(PushData::Subscribe))
            .or_else(|| connect.map(PushData::Connect))
            .or_else(|| disconnect.map(PushData::Disconnect))
            .or_else(|| refresh.map(PushData::Refresh))
            .unwrap_or(PushData::Empty);

        Self { channel, data }
    }
}

fn serialize_json<T: AsRef<[u8]>, S: Serializer>(
    bytes: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match serde_json::from_slice::<serde_json::Value>(bytes.as_ref()) {
        Ok(value) => value.serialize(serializer),
        Err(err) => Err(serde::ser::Error::custom(format!(
            "payload is not valid json ({err}); binary payloads need the protobuf protocol"
        ))),
    }
}

fn deserialize_json<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<u8>, D::Error> {
    use serde::Deserialize;

    let value = serde_json::Value::deserialize(deserializer)?;
    serde_json::to_vec(&value).map_err(serde::de::Error::custom)
}

fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    value == &T::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_envelope_roundtrip() {
        let command = Command::Subscribe(SubscribeRequest {
            channel: "news".into(),
            recover: true,
            offset: 10,
            epoch: "e".into(),
            ..Default::default()
        });
        let raw = RawCommand::from(command);
        assert!(raw.subscribe.is_some());
        assert!(raw.connect.is_none());

        let line = serde_json::to_string(&raw).unwrap();
        assert!(line.contains("\"subscribe\""));
        assert!(line.contains("\"recover\":true"));
        // zero id is elided from the json envelope
        assert!(!line.contains("\"id\""));
    }

    #[test]
    fn reply_with_no_payload_is_empty() {
        let reply: Reply = serde_json::from_str::<RawReply>("{}").unwrap().into();
        assert!(matches!(reply, Reply::Empty));
    }

    #[test]
    fn push_routing_by_payload_kind() {
        let raw: RawReply = serde_json::from_str(
            r#"{"push":{"channel":"c","pub":{"data":{"v":1},"offset":3}}}"#,
        )
        .unwrap();
        assert_eq!(raw.id, 0);
        let Reply::Push(push) = Reply::from(raw) else {
            panic!("expected push");
        };
        assert_eq!(push.channel, "c");
        let PushData::Publication(publication) = push.data else {
            panic!("expected publication");
        };
        assert_eq!(publication.offset, 3);
        let data: serde_json::Value = serde_json::from_slice(&publication.data).unwrap();
        assert_eq!(data, serde_json::json!({"v": 1}));
    }

    #[test]
    fn fire_and_forget_commands() {
        assert!(!Command::Send(SendRequest::default()).expects_reply());
        assert!(!Command::Empty.expects_reply());
        assert!(Command::Publish(PublishRequest::default()).expects_reply());
    }
}
