//! Client configuration: protocol selection, timeouts, keepalive windows,
//! token providers and the reconnect strategy.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

/// Wire encoding negotiated with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Json,
    Protobuf,
}

/// Future returned by token providers.
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<String, anyhow::Error>> + Send>>;

/// Async callback producing a fresh connection token.
pub type ConnectionTokenFn = Arc<dyn Fn() -> TokenFuture + Send + Sync>;

/// Async callback producing a fresh subscription token for a channel.
pub type SubscriptionTokenFn = Arc<dyn Fn(String) -> TokenFuture + Send + Sync>;

/// Client configuration.
///
/// Construction is builder-style: every `with_*` method consumes and
/// returns the config.
///
/// ```rust
/// use tokio_realtime::config::Config;
/// use std::time::Duration;
///
/// let config = Config::new()
///     .with_token("secret")
///     .with_name("my-app")
///     .use_json()
///     .with_read_timeout(Duration::from_secs(10));
/// ```
#[derive(Clone)]
pub struct Config {
    /// Connection token sent in the connect command.
    pub token: String,
    /// Optional payload attached to the connect command.
    pub data: Vec<u8>,
    /// Client name reported to the server.
    pub name: String,
    /// Client version reported to the server.
    pub version: String,
    pub protocol: Protocol,
    /// Runtime handle to spawn on; `Handle::current()` when absent.
    pub runtime: Option<Handle>,
    /// Per-command reply timeout, also the connect-wait deadline for
    /// commands issued while the session is not yet connected.
    pub read_timeout: Duration,
    /// Client-driven ping period, used only when the server does not
    /// announce its own ping interval in the connect reply.
    pub ping_interval: Duration,
    /// How long to wait for a pong after a client-driven ping.
    pub pong_timeout: Duration,
    /// Slack added on top of the server ping interval before the
    /// connection is considered dead.
    pub max_server_ping_delay: Duration,
    /// Channels whose name starts with this prefix require a
    /// subscription token.
    pub private_channel_prefix: String,
    pub reconnect_strategy: Arc<dyn ReconnectStrategy>,
    /// Called to obtain a new connection token when the current one is
    /// missing or flagged expired by the server.
    pub get_connection_token: Option<ConnectionTokenFn>,
    /// Called to obtain a subscription token for private channels.
    pub get_subscription_token: Option<SubscriptionTokenFn>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("protocol", &self.protocol)
            .field("read_timeout", &self.read_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("pong_timeout", &self.pong_timeout)
            .field("max_server_ping_delay", &self.max_server_ping_delay)
            .field("private_channel_prefix", &self.private_channel_prefix)
            .field("reconnect_strategy", &self.reconnect_strategy)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            token: String::new(),
            data: Vec::new(),
            name: String::from(env!("CARGO_PKG_NAME")),
            version: String::new(),
            protocol: Protocol::Json,
            runtime: None,
            read_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(10),
            max_server_ping_delay: Duration::from_secs(10),
            private_channel_prefix: String::from("$"),
            reconnect_strategy: Arc::new(BackoffReconnect::default()),
            get_connection_token: None,
            get_subscription_token: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Payload attached to the connect command, raw JSON bytes under the
    /// JSON protocol.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    pub fn with_max_server_ping_delay(mut self, delay: Duration) -> Self {
        self.max_server_ping_delay = delay;
        self
    }

    pub fn with_private_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.private_channel_prefix = prefix.into();
        self
    }

    pub fn with_reconnect_strategy(mut self, strategy: impl ReconnectStrategy) -> Self {
        self.reconnect_strategy = Arc::new(strategy);
        self
    }

    /// Installs the connection token provider.
    pub fn with_connection_token_getter<F, Fut>(mut self, getter: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, anyhow::Error>> + Send + 'static,
    {
        self.get_connection_token = Some(Arc::new(move || -> TokenFuture {
            Box::pin(getter())
        }));
        self
    }

    /// Installs the subscription token provider used for private channels.
    pub fn with_subscription_token_getter<F, Fut>(mut self, getter: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, anyhow::Error>> + Send + 'static,
    {
        self.get_subscription_token = Some(Arc::new(move |channel: String| -> TokenFuture {
            Box::pin(getter(channel))
        }));
        self
    }

    pub fn use_json(mut self) -> Self {
        self.protocol = Protocol::Json;
        self
    }

    pub fn use_protobuf(mut self) -> Self {
        self.protocol = Protocol::Protobuf;
        self
    }
}

/// Strategy deciding the pause before each reconnect attempt.
pub trait ReconnectStrategy: std::fmt::Debug + Send + Sync + 'static {
    /// Delay before attempt number `attempt` (1-based).
    fn time_before_next_attempt(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with full jitter.
///
/// The upper bound grows as `min_delay * factor^attempt`, clamped to
/// `max_delay`; the actual delay is drawn uniformly between `min_delay`
/// and that bound so simultaneously disconnected clients do not stampede
/// the server.
#[derive(Debug, Clone)]
pub struct BackoffReconnect {
    pub factor: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectStrategy for BackoffReconnect {
    fn time_before_next_attempt(&self, attempt: u32) -> Duration {
        if self.min_delay > self.max_delay {
            return self.max_delay;
        }

        let min = self.min_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let upper = (min * self.factor.powi(attempt as i32)).clamp(min, max);
        let jittered = min + rand::random::<f64>() * (upper - min);
        Duration::from_secs_f64(jittered)
    }
}

impl Default for BackoffReconnect {
    fn default() -> Self {
        BackoffReconnect {
            factor: 2.0,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_bounds() {
        let strategy = BackoffReconnect {
            factor: 2.0,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };

        for attempt in 0..16 {
            let delay = strategy.time_before_next_attempt(attempt);
            assert!(delay >= strategy.min_delay, "attempt {attempt}: {delay:?}");
            assert!(delay <= strategy.max_delay, "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn backoff_upper_bound_grows() {
        let strategy = BackoffReconnect {
            factor: 2.0,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };

        // with full jitter only the envelope is deterministic
        for attempt in 0..8 {
            let upper = Duration::from_secs_f64(
                0.1 * 2f64.powi(attempt as i32),
            );
            let delay = strategy.time_before_next_attempt(attempt);
            assert!(delay <= upper.max(strategy.min_delay));
        }
    }

    #[test]
    fn inverted_bounds_fall_back_to_max() {
        let strategy = BackoffReconnect {
            factor: 2.0,
            min_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(strategy.time_before_next_attempt(3), Duration::from_secs(1));
    }

    #[test]
    fn config_defaults() {
        let config = Config::new();
        assert_eq!(config.protocol, Protocol::Json);
        assert_eq!(config.read_timeout, Duration::from_secs(5));
        assert_eq!(config.private_channel_prefix, "$");
        assert!(config.get_connection_token.is_none());
    }
}
