use std::time::Duration;

use tokio_realtime::client::{Client, State};
use tokio_realtime::config::{BackoffReconnect, Config, Protocol};
use tokio_realtime::errors::{should_reconnect, RemoveSubscriptionError};
use tokio_realtime::subscription::SubscriptionOptions;
use tokio_realtime::utils::{decode_json, encode_json};

#[tokio::test]
async fn test_client_creation() {
    let config = Config::new().use_json();
    let client = Client::new("ws://localhost:8000/connection/websocket", config);

    assert_eq!(client.state(), State::Disconnected);
    assert_eq!(client.client_id(), "");
}

#[tokio::test]
async fn test_subscription_creation() {
    let config = Config::new().use_json();
    let client = Client::new("ws://localhost:8000/connection/websocket", config);

    let subscription = client.new_subscription("test_channel");

    assert_eq!(
        subscription.state(),
        tokio_realtime::subscription::State::Unsubscribed
    );
    assert_eq!(subscription.channel(), "test_channel");
    assert!(subscription.position().is_none());
}

#[tokio::test]
async fn test_config_methods() {
    let config = Config::new()
        .use_json()
        .with_name("test_client")
        .with_version("1.0.0")
        .with_token("test_token")
        .with_read_timeout(Duration::from_secs(30))
        .with_ping_interval(Duration::from_secs(20))
        .with_pong_timeout(Duration::from_secs(8))
        .with_max_server_ping_delay(Duration::from_secs(6))
        .with_private_channel_prefix("private:");

    assert_eq!(config.name, "test_client");
    assert_eq!(config.version, "1.0.0");
    assert_eq!(config.token, "test_token");
    assert_eq!(config.read_timeout, Duration::from_secs(30));
    assert_eq!(config.ping_interval, Duration::from_secs(20));
    assert_eq!(config.pong_timeout, Duration::from_secs(8));
    assert_eq!(config.max_server_ping_delay, Duration::from_secs(6));
    assert_eq!(config.private_channel_prefix, "private:");
}

#[tokio::test]
async fn test_subscription_management() {
    let config = Config::new().use_json();
    let client = Client::new("ws://localhost:8000/connection/websocket", config);

    let sub1 = client.new_subscription("channel1");
    let sub2 = client.new_subscription("channel2");

    assert_eq!(sub1.state(), tokio_realtime::subscription::State::Unsubscribed);
    assert_eq!(sub2.state(), tokio_realtime::subscription::State::Unsubscribed);

    // same channel returns the already registered subscription
    let again = client.new_subscription("channel1");
    assert_eq!(again.channel(), "channel1");

    let existing_sub = client.get_subscription("channel1");
    assert!(existing_sub.is_some());

    let non_existing_sub = client.get_subscription("channel3");
    assert!(non_existing_sub.is_none());

    assert!(client.remove_subscription(sub1).is_ok());
    assert!(client.get_subscription("channel1").is_none());
}

#[tokio::test]
async fn test_subscription_options() {
    let config = Config::new().use_json();
    let client = Client::new("ws://localhost:8000/connection/websocket", config);

    let options = SubscriptionOptions {
        token: Some("sub-token".into()),
        positioned: true,
        recoverable: true,
        join_leave: true,
        ..Default::default()
    };
    let sub = client.new_subscription_with("$private", options);
    assert_eq!(sub.channel(), "$private");
}

#[tokio::test]
async fn test_config_protocols() {
    let json_config = Config::new().use_json();
    assert_eq!(json_config.protocol, Protocol::Json);

    let proto_config = Config::new().use_protobuf();
    assert_eq!(proto_config.protocol, Protocol::Protobuf);
}

#[tokio::test]
async fn test_reconnect_strategy() {
    let strategy = BackoffReconnect {
        factor: 2.0,
        min_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
    };
    let config = Config::new().with_reconnect_strategy(strategy);
    let _client = Client::new("ws://localhost:8000/connection/websocket", config);
}

#[tokio::test]
async fn test_token_management() {
    let config = Config::new().use_json().with_token("initial");
    let client = Client::new("ws://localhost:8000/connection/websocket", config);

    client.set_token("rotated");
    assert_eq!(client.state(), State::Disconnected);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let config = Config::new().use_json();
    let client = Client::new("ws://localhost:8000/connection/websocket", config);

    // disconnecting a client that never connected resolves right away
    client.disconnect().await;
    assert_eq!(client.state(), State::Disconnected);
    client.disconnect().await;
    assert_eq!(client.state(), State::Disconnected);
}

#[tokio::test]
async fn test_close_is_terminal_and_idempotent() {
    let config = Config::new().use_json();
    let client = Client::new("ws://localhost:8000/connection/websocket", config);

    client.close();
    assert_eq!(client.state(), State::Closed);
    client.close();
    assert_eq!(client.state(), State::Closed);

    // connect after close fails fast
    let result = client.connect().await;
    assert!(result.is_err());
    assert_eq!(client.state(), State::Closed);
}

#[tokio::test]
async fn test_remove_subscription_rules() {
    let config = Config::new().use_json();
    let client = Client::new("ws://localhost:8000/connection/websocket", config);

    let sub = client.new_subscription("news");
    // unsubscribed from the start, removable
    assert!(matches!(client.remove_subscription(sub), Ok(())));

    let _ = RemoveSubscriptionError::NotUnsubscribed; // referenced for the api
}

#[tokio::test]
async fn test_close_code_classification() {
    assert!(should_reconnect(3000));
    assert!(should_reconnect(4499));
    assert!(!should_reconnect(3500));
    assert!(!should_reconnect(4500));
}

#[tokio::test]
async fn test_utils_functions() {
    let data = serde_json::json!({"key": "value"});
    let encoded = encode_json(&data).unwrap();
    let decoded: serde_json::Value = decode_json(&encoded).unwrap();
    assert_eq!(data, decoded);

    // empty data decodes as null
    let empty_decoded: serde_json::Value = decode_json(b"").unwrap();
    assert_eq!(empty_decoded, serde_json::Value::Null);
}

#[tokio::test]
async fn test_protocol_structures() {
    use tokio_realtime::protocol::{Command, ConnectRequest, SubscribeRequest};

    let connect_cmd = Command::Connect(ConnectRequest {
        token: "test_token".to_string(),
        name: "test_client".to_string(),
        version: "1.0.0".to_string(),
        ..Default::default()
    });

    let subscribe_cmd = Command::Subscribe(SubscribeRequest {
        channel: "test_channel".to_string(),
        recover: true,
        offset: 42,
        epoch: "xyz".to_string(),
        ..Default::default()
    });

    assert!(matches!(connect_cmd, Command::Connect(_)));
    assert!(matches!(subscribe_cmd, Command::Subscribe(_)));
}

#[tokio::test]
async fn test_config_default_values() {
    let config = Config::new();

    assert_eq!(config.protocol, Protocol::Json);
    assert_eq!(config.read_timeout, Duration::from_secs(5));
    assert_eq!(config.ping_interval, Duration::from_secs(25));
    assert_eq!(config.private_channel_prefix, "$");

    let config = config
        .use_protobuf()
        .with_read_timeout(Duration::from_secs(10));

    assert_eq!(config.protocol, Protocol::Protobuf);
    assert_eq!(config.read_timeout, Duration::from_secs(10));
}
