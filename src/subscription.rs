//! Per-channel subscription state machine.
//!
//! A subscription is registered on the client by channel name and survives
//! reconnects: the session engine drives every `Subscribing` subscription
//! back through a subscribe command on each successful connect, attaching
//! the last known stream position when recovery is on.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Future;
use slotmap::new_key_type;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::client::types::MessageStore;
use crate::client::{Client, FutureResult};
use crate::errors::{ReplyError, RequestError};
use crate::events::{
    JoinEvent, LeaveEvent, PublicationEvent, SubscribedEvent, UnsubscribedEvent,
};
use crate::protocol::{Publication, PublishRequest, Reply, SubscribeResult};

new_key_type! { pub(crate) struct SubscriptionId; }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// Options applied to the subscribe command for this channel.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Static subscription token. Private channels without a static token
    /// obtain one from the client's subscription token provider.
    pub token: Option<String>,
    /// Payload attached to the subscribe command.
    pub data: Vec<u8>,
    /// Ask the server to maintain stream position for this subscription.
    pub positioned: bool,
    /// Ask the server to make this subscription recoverable.
    pub recoverable: bool,
    /// Receive join/leave notifications.
    pub join_leave: bool,
    /// Do not cache the subscription token between connections.
    pub token_unique_per_connection: bool,
}

pub(crate) struct SubscriptionInner {
    pub(crate) channel: Arc<str>,
    pub(crate) state: State,
    pub(crate) options: SubscriptionOptions,
    /// Cached subscription token; cleared per connection when the options
    /// require a unique one.
    pub(crate) token: Option<String>,
    /// Whether a stream position is known and should be sent on the next
    /// subscribe command.
    pub(crate) need_recover: bool,
    pub(crate) offset: u64,
    pub(crate) epoch: String,
    /// Pending sub-refresh timer for expiring subscription tokens.
    pub(crate) refresh_task: Option<AbortHandle>,
    on_subscribing: Option<Box<dyn FnMut() + Send + 'static>>,
    on_subscribed: Option<Box<dyn FnMut(SubscribedEvent) + Send + 'static>>,
    on_unsubscribed: Option<Box<dyn FnMut(UnsubscribedEvent) + Send + 'static>>,
    on_publication: Option<Box<dyn FnMut(PublicationEvent) + Send + 'static>>,
    on_join: Option<Box<dyn FnMut(JoinEvent) + Send + 'static>>,
    on_leave: Option<Box<dyn FnMut(LeaveEvent) + Send + 'static>>,
    on_error: Option<Box<dyn FnMut(anyhow::Error) + Send + 'static>>,
    pub(crate) on_subscribed_ch: Vec<oneshot::Sender<Result<(), ()>>>,
    pub(crate) on_unsubscribed_ch: Vec<oneshot::Sender<()>>,
    pub(crate) pub_ch_write: Option<MessageStore>,
    read_timeout: Duration,
}

impl SubscriptionInner {
    pub(crate) fn new(channel: &str, options: SubscriptionOptions, read_timeout: Duration) -> Self {
        SubscriptionInner {
            channel: channel.into(),
            state: State::Unsubscribed,
            token: options.token.clone(),
            options,
            need_recover: false,
            offset: 0,
            epoch: String::new(),
            refresh_task: None,
            on_subscribing: None,
            on_subscribed: None,
            on_unsubscribed: None,
            on_publication: None,
            on_join: None,
            on_leave: None,
            on_error: None,
            on_subscribed_ch: Vec::new(),
            on_unsubscribed_ch: Vec::new(),
            pub_ch_write: None,
            read_timeout,
        }
    }

    pub(crate) fn move_to_subscribing(&mut self) {
        if self.pub_ch_write.is_none() {
            let (pub_ch_write, _) = MessageStore::new(self.read_timeout);
            self.pub_ch_write = Some(pub_ch_write);
        }
        log::debug!("state: {:?} -> Subscribing, channel={}", self.state, self.channel);
        self.state = State::Subscribing;
        if let Some(ref mut on_subscribing) = self.on_subscribing {
            on_subscribing();
        }
    }

    pub(crate) fn move_to_subscribed(&mut self, result: &SubscribeResult) {
        log::debug!("state: {:?} -> Subscribed, channel={}", self.state, self.channel);
        self.state = State::Subscribed;

        if result.recoverable || result.positioned {
            self.need_recover = true;
            self.epoch = result.epoch.clone();
            // replayed publications already advanced the offset; only move
            // forward to the announced stream top
            if result.offset != 0 {
                self.offset = result.offset;
            }
        }

        let event = SubscribedEvent {
            channel: self.channel.to_string(),
            recovered: result.recovered,
            position: (result.recoverable || result.positioned).then(|| {
                crate::protocol::StreamPosition {
                    offset: result.offset,
                    epoch: result.epoch.clone(),
                }
            }),
            data: result.data.clone(),
        };
        if let Some(ref mut on_subscribed) = self.on_subscribed {
            on_subscribed(event);
        }
        for ch in self.on_subscribed_ch.drain(..) {
            let _ = ch.send(Ok(()));
        }
    }

    pub(crate) fn move_to_unsubscribed(&mut self, code: u32, reason: &str) {
        self.pub_ch_write = None;
        if let Some(handle) = self.refresh_task.take() {
            handle.abort();
        }
        if self.options.token_unique_per_connection {
            self.token = None;
        }
        log::debug!(
            "state: {:?} -> Unsubscribed, channel={}, code={}, reason={}",
            self.state,
            self.channel,
            code,
            reason
        );
        self.state = State::Unsubscribed;
        if let Some(ref mut on_unsubscribed) = self.on_unsubscribed {
            on_unsubscribed(UnsubscribedEvent {
                channel: self.channel.to_string(),
                code,
                reason: reason.to_string(),
            });
        }
        for ch in self.on_subscribed_ch.drain(..) {
            let _ = ch.send(Err(()));
        }
        for ch in self.on_unsubscribed_ch.drain(..) {
            let _ = ch.send(());
        }
    }

    /// Updates stream position before emitting, so a reconnect after this
    /// publication resumes past it.
    pub(crate) fn handle_publication(&mut self, publication: Publication) {
        if publication.offset != 0 {
            self.offset = publication.offset;
        }
        if let Some(ref mut on_publication) = self.on_publication {
            on_publication(PublicationEvent {
                channel: self.channel.to_string(),
                data: publication.data,
                offset: publication.offset,
                info: publication.info,
                tags: publication.tags,
            });
        }
    }

    pub(crate) fn handle_join(&mut self, info: Option<crate::protocol::ClientInfo>) {
        if let Some(ref mut on_join) = self.on_join {
            on_join(JoinEvent { channel: self.channel.to_string(), info });
        }
    }

    pub(crate) fn handle_leave(&mut self, info: Option<crate::protocol::ClientInfo>) {
        if let Some(ref mut on_leave) = self.on_leave {
            on_leave(LeaveEvent { channel: self.channel.to_string(), info });
        }
    }

    pub(crate) fn handle_error(&mut self, err: anyhow::Error) {
        if let Some(ref mut on_error) = self.on_error {
            on_error(err);
        }
    }
}

/// Handle to a registered subscription. Cheap to clone; all state lives on
/// the client.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    client: Client,
}

impl Subscription {
    pub(crate) fn new(client: &Client, key: SubscriptionId) -> Self {
        Subscription { id: key, client: client.clone() }
    }

    /// Starts subscribing. Resolves once the server confirms the
    /// subscription; subscribing an already subscribed channel is a no-op.
    pub fn subscribe(&self) -> FutureResult<impl Future<Output = Result<(), ()>>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.client.0.lock().unwrap();
        if inner.state == crate::client::State::Closed {
            let _ = tx.send(Err(()));
        } else if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            match sub.state {
                State::Subscribed => {
                    let _ = tx.send(Ok(()));
                }
                State::Subscribing => {
                    sub.on_subscribed_ch.push(tx);
                }
                State::Unsubscribed => {
                    sub.on_subscribed_ch.push(tx);
                    sub.move_to_subscribing();
                    if let Some(channel) = inner.sub_ch_write.as_ref() {
                        let _ = channel.send(self.id);
                    }
                }
            }
        } else {
            let _ = tx.send(Err(()));
        }
        FutureResult(async {
            match rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(())) => Err(()),
                Err(_) => Err(()),
            }
        })
    }

    /// Unsubscribes locally and tells the server best-effort. Idempotent.
    pub fn unsubscribe(&self) -> FutureResult<impl Future<Output = ()>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            if sub.state == State::Unsubscribed {
                let _ = tx.send(());
            } else {
                sub.on_unsubscribed_ch.push(tx);
                sub.move_to_unsubscribed(0, "unsubscribe called");
                if let Some(channel) = inner.sub_ch_write.as_ref() {
                    let _ = channel.send(self.id);
                }
            }
        } else {
            let _ = tx.send(());
        }
        FutureResult(async {
            let _ = rx.await;
        })
    }

    /// Unsubscribes and removes the subscription from the client registry.
    pub fn close(&self) -> FutureResult<impl Future<Output = ()>> {
        let unsubscribed = self.unsubscribe();
        let client = self.client.clone();
        let id = self.id;
        FutureResult(async move {
            unsubscribed.into_future().await;
            let mut inner = client.0.lock().unwrap();
            if let Some(sub) = inner.subscriptions.remove(id) {
                inner.sub_name_to_id.remove(&*sub.channel);
            }
        })
    }

    /// Publishes into this channel. Queues until the subscription is
    /// confirmed, then goes out with the per-command timeout.
    pub fn publish(
        &self,
        data: Vec<u8>,
    ) -> FutureResult<impl Future<Output = Result<(), RequestError>>> {
        let mut inner = self.client.0.lock().unwrap();
        let read_timeout = inner.read_timeout;
        let deadline = Instant::now() + read_timeout;
        let rx = if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            if let Some(ref mut pub_ch_write) = sub.pub_ch_write {
                pub_ch_write.send(crate::protocol::Command::Publish(PublishRequest {
                    channel: (*sub.channel).into(),
                    data,
                }))
            } else {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(ReplyError::Closed));
                rx
            }
        } else {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(ReplyError::Closed));
            rx
        };
        FutureResult(async move {
            let result = tokio::time::timeout_at(deadline.into(), rx).await;
            match result {
                Ok(Ok(Ok(Reply::Publish(_)))) => Ok(()),
                Ok(Ok(Ok(Reply::Error(err)))) => Err(RequestError::ErrorResponse(err)),
                Ok(Ok(Ok(reply))) => Err(RequestError::UnexpectedReply(reply)),
                Ok(Ok(Err(err))) => Err(err.into()),
                Ok(Err(err)) => Err(err.into()),
                Err(err) => Err(err.into()),
            }
        })
    }

    /// Channel history via the client.
    pub fn history(
        &self,
        options: crate::client::HistoryOptions,
    ) -> FutureResult<impl Future<Output = Result<crate::protocol::HistoryResult, RequestError>>>
    {
        self.client.history(&self.channel(), options)
    }

    /// Channel presence via the client.
    pub fn presence(
        &self,
    ) -> FutureResult<impl Future<Output = Result<crate::protocol::PresenceResult, RequestError>>>
    {
        self.client.presence(&self.channel())
    }

    pub fn channel(&self) -> String {
        let inner = self.client.0.lock().unwrap();
        inner
            .subscriptions
            .get(self.id)
            .map(|s| s.channel.to_string())
            .unwrap_or_default()
    }

    pub fn state(&self) -> State {
        let inner = self.client.0.lock().unwrap();
        inner.subscriptions.get(self.id).map(|s| s.state).unwrap_or(State::Unsubscribed)
    }

    /// Last known stream position, if the subscription tracks one.
    pub fn position(&self) -> Option<crate::protocol::StreamPosition> {
        let inner = self.client.0.lock().unwrap();
        inner.subscriptions.get(self.id).and_then(|s| {
            s.need_recover.then(|| crate::protocol::StreamPosition {
                offset: s.offset,
                epoch: s.epoch.clone(),
            })
        })
    }

    pub fn on_subscribing(&self, func: impl FnMut() + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_subscribing = Some(Box::new(func));
        }
    }

    pub fn on_subscribed(&self, func: impl FnMut(SubscribedEvent) + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_subscribed = Some(Box::new(func));
        }
    }

    pub fn on_unsubscribed(&self, func: impl FnMut(UnsubscribedEvent) + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_unsubscribed = Some(Box::new(func));
        }
    }

    pub fn on_publication(&self, func: impl FnMut(PublicationEvent) + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_publication = Some(Box::new(func));
        }
    }

    pub fn on_join(&self, func: impl FnMut(JoinEvent) + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_join = Some(Box::new(func));
        }
    }

    pub fn on_leave(&self, func: impl FnMut(LeaveEvent) + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_leave = Some(Box::new(func));
        }
    }

    pub fn on_error(&self, func: impl FnMut(anyhow::Error) + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_error = Some(Box::new(func));
        }
    }
}
