//! Error taxonomy for the client session engine.

use std::time::Duration;

use thiserror::Error;

/// Disconnect code the client uses when a ping/pong deadline elapses.
pub const CODE_NO_PING: u16 = 11;

/// Connect error code meaning the connection token has expired.
pub const CODE_TOKEN_EXPIRED: u32 = 109;

/// Connect error code meaning the stream position fell out of the server log.
pub const CODE_UNRECOVERABLE_POSITION: u32 = 112;

/// Failure of a single in-flight command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("transport write failed: {0}")]
    Write(String),
}

/// Error returned to callers of request/reply client methods.
#[derive(Error, Debug)]
pub enum RequestError {
    /// The server answered with an error reply.
    ErrorResponse(crate::protocol::Error),

    /// The server answered with a reply of the wrong kind.
    UnexpectedReply(crate::protocol::Reply),

    ReplyError(#[from] ReplyError),

    /// The local deadline elapsed before any reply arrived.
    Timeout(#[from] tokio::time::error::Elapsed),

    /// The waiter was dropped before resolution.
    Cancelled(#[from] tokio::sync::oneshot::error::RecvError),

    /// The session reached its terminal state.
    Closed,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::ErrorResponse(err) => {
                write!(f, "server error: {} {}", err.code, err.message)
            }
            RequestError::UnexpectedReply(_) => write!(f, "unexpected reply from server"),
            RequestError::ReplyError(err) => write!(f, "{}", err),
            RequestError::Timeout(err) => write!(f, "request timed out: {}", err),
            RequestError::Cancelled(_) => write!(f, "request was cancelled"),
            RequestError::Closed => write!(f, "client closed"),
        }
    }
}

/// Token provider failure.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token provider returned an empty token")]
    Empty,
    #[error("no token provider configured")]
    NoProvider,
    #[error("token provider failed: {0}")]
    Provider(#[source] anyhow::Error),
}

/// Terminal close reason of a session.
///
/// `Client` and `UnrecoverablePosition` also clear the server-subscription
/// positions; the remaining reasons preserve them for a later client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Client,
    Server,
    ConnectFailed,
    RefreshFailed,
    Unauthorized,
    UnrecoverablePosition,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Client => "client",
            CloseReason::Server => "server",
            CloseReason::ConnectFailed => "connect failed",
            CloseReason::RefreshFailed => "refresh failed",
            CloseReason::Unauthorized => "unauthorized",
            CloseReason::UnrecoverablePosition => "unrecoverable position",
        }
    }

    /// Whether server-subscription stream positions survive this close.
    pub(crate) fn keeps_positions(&self) -> bool {
        !matches!(self, CloseReason::Client | CloseReason::UnrecoverablePosition)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveSubscriptionError {
    #[error("subscription must be unsubscribed to be removed")]
    NotUnsubscribed,
}

/// Server-initiated close codes in 3500..=3999 and 4500..=4999 are terminal;
/// everything else allows a reconnect attempt.
pub fn should_reconnect(close_code: u16) -> bool {
    !matches!(close_code, 3500..=3999 | 4500..=4999)
}

/// Classifies a connect error reply: retryable errors schedule a reconnect,
/// the rest close the session.
pub(crate) fn connect_error_retryable(err: &crate::protocol::Error) -> bool {
    err.temporary || err.code < 100 || err.code == CODE_TOKEN_EXPIRED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_ranges() {
        assert!(should_reconnect(4));
        assert!(should_reconnect(3000));
        assert!(should_reconnect(3499));
        assert!(should_reconnect(4000));
        assert!(should_reconnect(4499));
        assert!(!should_reconnect(3500));
        assert!(!should_reconnect(3999));
        assert!(!should_reconnect(4500));
        assert!(!should_reconnect(4999));
    }

    #[test]
    fn connect_error_classification() {
        let transport_level = crate::protocol::Error { code: 4, ..Default::default() };
        assert!(connect_error_retryable(&transport_level));

        let expired = crate::protocol::Error { code: CODE_TOKEN_EXPIRED, ..Default::default() };
        assert!(connect_error_retryable(&expired));

        let temporary = crate::protocol::Error {
            code: 100,
            temporary: true,
            ..Default::default()
        };
        assert!(connect_error_retryable(&temporary));

        let permanent = crate::protocol::Error { code: 101, ..Default::default() };
        assert!(!connect_error_retryable(&permanent));

        let unrecoverable =
            crate::protocol::Error { code: CODE_UNRECOVERABLE_POSITION, ..Default::default() };
        assert!(!connect_error_retryable(&unrecoverable));
    }

    #[test]
    fn close_reason_position_retention() {
        assert!(!CloseReason::Client.keeps_positions());
        assert!(!CloseReason::UnrecoverablePosition.keeps_positions());
        assert!(CloseReason::Server.keeps_positions());
        assert!(CloseReason::ConnectFailed.keeps_positions());
    }
}
