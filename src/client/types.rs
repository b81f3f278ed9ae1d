//! Core client types: session state, the command gating queue and the
//! server-subscription registry entry.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::errors::ReplyError;
use crate::protocol::{Command, Reply};

/// Session state. `Closed` is terminal; every other transition is driven
/// by the connect/reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Recovery bookkeeping for a subscription announced by the server at
/// connect time. Managed implicitly: created and refreshed from connect
/// replies, removed by unsubscribe pushes.
#[derive(Debug, Clone, Default)]
pub(crate) struct ServerSubscription {
    pub(crate) offset: u64,
    pub(crate) epoch: String,
    pub(crate) recoverable: bool,
}

/// A queued command waiting for connectivity, with its reply waiter and
/// expiry deadline.
pub(crate) struct MessageStoreItem {
    pub(crate) command: Command,
    pub(crate) reply: oneshot::Sender<Result<Reply, ReplyError>>,
    pub(crate) deadline: Instant,
}

impl MessageStoreItem {
    fn check_expiration(self, now: Instant, timeout: Duration) -> Option<Self> {
        if self.deadline > now {
            Some(self)
        } else {
            let _ = self.reply.send(Err(ReplyError::Timeout(timeout)));
            None
        }
    }
}

/// Gating queue for user commands issued while the session is not yet
/// connected. Commands wait here with a deadline; the connection cycle
/// drains the queue once connected, and expired entries reject their
/// waiters with a timeout.
pub(crate) struct MessageStore {
    timeout: Duration,
    activity: mpsc::Sender<()>,
    messages: VecDeque<MessageStoreItem>,
}

impl MessageStore {
    pub(crate) fn new(timeout: Duration) -> (Self, mpsc::Receiver<()>) {
        let (activity_tx, activity_rx) = mpsc::channel(1);
        let store = Self {
            timeout,
            activity: activity_tx,
            messages: VecDeque::new(),
        };
        (store, activity_rx)
    }

    /// Queues a command and returns the receiver its reply will arrive on.
    pub(crate) fn send(
        &mut self,
        command: Command,
    ) -> oneshot::Receiver<Result<Reply, ReplyError>> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = now + self.timeout;
        self.messages.push_back(MessageStoreItem {
            command,
            reply: tx,
            deadline,
        });
        while let Some(item) = self.messages.pop_front() {
            if let Some(item) = item.check_expiration(now, self.timeout) {
                self.messages.push_front(item);
                break;
            }
        }
        let _ = self.activity.try_send(());
        rx
    }

    /// Replaces the activity channel; used when a new connection cycle
    /// attaches to an existing queue.
    pub(crate) fn reset_channel(&mut self) -> mpsc::Receiver<()> {
        let (activity_tx, activity_rx) = mpsc::channel(1);
        self.activity = activity_tx;
        activity_rx
    }

    /// Pops the next unexpired command, dropping expired entries on the way.
    pub(crate) fn get_next(&mut self, time: Instant) -> Option<MessageStoreItem> {
        loop {
            let item = self.messages.pop_front()?;
            if let Some(item) = item.check_expiration(time, self.timeout) {
                return Some(item);
            }
        }
    }

    /// Rejects every queued command with `ReplyError::Closed`. Called when
    /// the session reaches a state the queue cannot survive.
    pub(crate) fn drain_close(&mut self) {
        for item in self.messages.drain(..) {
            let _ = item.reply.send(Err(ReplyError::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PingRequest;

    #[tokio::test]
    async fn expired_items_reject_with_timeout() {
        let (mut store, _activity) = MessageStore::new(Duration::ZERO);
        let rx = store.send(Command::Ping(PingRequest {}));
        // zero timeout expires the entry on the next queue scan
        assert!(store.get_next(Instant::now()).is_none());
        match rx.await {
            Ok(Err(ReplyError::Timeout(_))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn drain_close_rejects_pending() {
        let (mut store, _activity) = MessageStore::new(Duration::from_secs(5));
        let rx = store.send(Command::Ping(PingRequest {}));
        store.drain_close();
        assert!(matches!(rx.await.unwrap(), Err(ReplyError::Closed)));
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let (mut store, _activity) = MessageStore::new(Duration::from_secs(5));
        let _rx1 = store.send(Command::Ping(PingRequest {}));
        let _rx2 = store.send(Command::Empty);
        let now = Instant::now();
        assert!(matches!(store.get_next(now).unwrap().command, Command::Ping(_)));
        assert!(matches!(store.get_next(now).unwrap().command, Command::Empty));
        assert!(store.get_next(now).is_none());
    }
}
