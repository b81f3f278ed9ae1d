//! Drives client-side subscriptions over a live connection.
//!
//! On connect, every subscription left in `Subscribing` is re-driven
//! through a subscribe command inside one batch, so the whole bulk goes
//! out as a single frame. Afterwards the driver reacts to state-change
//! nudges from `Subscription::subscribe` / `unsubscribe` until the
//! connection goes away.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::client::types::MessageStore;
use crate::errors::ReplyError;
use crate::protocol::{Command, Reply, SubRefreshRequest, SubscribeRequest, UnsubscribeRequest};
use crate::subscription::{self, SubscriptionId};
use crate::utils::{clamp_timer, jittered_retry_delay};

use super::inner::ClientInner;
use super::io::{ControlMessage, ControlSender};

pub(crate) struct SubscriptionHandler;

impl SubscriptionHandler {
    /// Runs for the lifetime of one connection.
    ///
    /// `initial` holds the subscriptions to re-drive right away; they are
    /// flushed as one frame between batching markers.
    pub(crate) async fn run(
        client: Arc<Mutex<ClientInner>>,
        initial: Vec<SubscriptionId>,
        mut sub_ch_read: mpsc::UnboundedReceiver<SubscriptionId>,
        control_write: ControlSender,
        rt: Handle,
    ) {
        let mut active: HashSet<SubscriptionId> = HashSet::new();

        if !initial.is_empty() {
            let _ = control_write.send(ControlMessage::StartBatching).await;
            let mut waiters = Vec::new();
            for sub_id in initial {
                if let Some(rx) = send_subscribe(&client, sub_id, &control_write).await {
                    active.insert(sub_id);
                    waiters.push((sub_id, rx));
                }
            }
            let _ = control_write.send(ControlMessage::StopBatching).await;
            for (sub_id, rx) in waiters {
                rt.spawn(await_subscribe_reply(
                    client.clone(),
                    sub_id,
                    rx,
                    control_write.clone(),
                    rt.clone(),
                ));
            }
        }

        loop {
            let mut buf = Vec::new();
            let count = sub_ch_read.recv_many(&mut buf, 32).await;
            if count == 0 {
                break;
            }

            for sub_id in buf.drain(..) {
                let (state, channel) = {
                    let inner = client.lock().unwrap();
                    match inner.subscriptions.get(sub_id) {
                        Some(sub) => (Some(sub.state), sub.channel.to_string()),
                        None => (None, String::new()),
                    }
                };

                match state {
                    Some(subscription::State::Subscribing) if !active.contains(&sub_id) => {
                        if let Some(rx) = send_subscribe(&client, sub_id, &control_write).await {
                            active.insert(sub_id);
                            rt.spawn(await_subscribe_reply(
                                client.clone(),
                                sub_id,
                                rx,
                                control_write.clone(),
                                rt.clone(),
                            ));
                        }
                    }
                    Some(subscription::State::Unsubscribed) | None => {
                        if active.remove(&sub_id) && !channel.is_empty() {
                            // best effort, the local state already changed
                            let _ = control_write
                                .send(ControlMessage::Fire(Command::Unsubscribe(
                                    UnsubscribeRequest { channel },
                                )))
                                .await;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Builds and sends the subscribe command for one subscription, acquiring
/// a token first when the channel is private. Returns the reply waiter,
/// or `None` when the subscription failed or went away meanwhile.
async fn send_subscribe(
    client: &Arc<Mutex<ClientInner>>,
    sub_id: SubscriptionId,
    control_write: &ControlSender,
) -> Option<oneshot::Receiver<Result<Reply, ReplyError>>> {
    let (channel, cached_token, options, need_recover, offset, epoch, timeout, provider, prefix) = {
        let inner = client.lock().unwrap();
        let sub = inner.subscriptions.get(sub_id)?;
        if sub.state != subscription::State::Subscribing {
            return None;
        }
        (
            sub.channel.to_string(),
            sub.token.clone(),
            sub.options.clone(),
            sub.need_recover,
            sub.offset,
            sub.epoch.clone(),
            inner.read_timeout,
            inner.get_subscription_token.clone(),
            inner.private_channel_prefix.clone(),
        )
    };

    let token = if !prefix.is_empty() && channel.starts_with(&prefix) && cached_token.is_none() {
        let Some(provider) = provider else {
            fail_subscription(client, sub_id, anyhow!("no subscription token provider"), 0);
            return None;
        };
        match provider(channel.clone()).await {
            Ok(token) if token.is_empty() => {
                fail_subscription(client, sub_id, anyhow!("empty subscription token"), 0);
                return None;
            }
            Ok(token) => {
                let mut inner = client.lock().unwrap();
                if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
                    sub.token = Some(token.clone());
                }
                Some(token)
            }
            Err(err) => {
                fail_subscription(client, sub_id, err, 0);
                return None;
            }
        }
    } else {
        cached_token
    };

    // state may have changed while the token was being fetched
    {
        let inner = client.lock().unwrap();
        let sub = inner.subscriptions.get(sub_id)?;
        if sub.state != subscription::State::Subscribing {
            return None;
        }
    }

    let request = SubscribeRequest {
        channel,
        token: token.unwrap_or_default(),
        recover: need_recover,
        offset: if need_recover { offset } else { 0 },
        epoch: if need_recover { epoch } else { String::new() },
        data: options.data.clone(),
        positioned: options.positioned,
        recoverable: options.recoverable,
        join_leave: options.join_leave,
    };

    let (tx, rx) = oneshot::channel();
    let message = ControlMessage::Call {
        command: Command::Subscribe(request),
        reply: tx,
        timeout,
    };
    control_write.send(message).await.ok()?;
    Some(rx)
}

async fn await_subscribe_reply(
    client: Arc<Mutex<ClientInner>>,
    sub_id: SubscriptionId,
    rx: oneshot::Receiver<Result<Reply, ReplyError>>,
    control_write: ControlSender,
    rt: Handle,
) {
    match rx.await {
        Ok(Ok(Reply::Subscribe(mut result))) => {
            {
                let mut inner = client.lock().unwrap();
                let Some(sub) = inner.subscriptions.get_mut(sub_id) else {
                    return;
                };
                if sub.state != subscription::State::Subscribing {
                    return;
                }

                // recovered publications replay before the subscribed event
                for publication in std::mem::take(&mut result.publications) {
                    sub.handle_publication(publication);
                }
                sub.move_to_subscribed(&result);

                if result.expires {
                    schedule_sub_refresh(
                        &mut inner,
                        client.clone(),
                        sub_id,
                        result.ttl,
                        control_write.clone(),
                        &rt,
                    );
                }
            }

            // flush publishes queued on this subscription
            publish_task(client, control_write, move |inner| {
                inner
                    .subscriptions
                    .get_mut(sub_id)
                    .and_then(|sub| sub.pub_ch_write.as_mut())
            })
            .await;
        }
        Ok(Ok(Reply::Error(err))) => {
            log::debug!("subscribe failed: {} {}", err.code, err.message);
            let code = err.code;
            fail_subscription(&client, sub_id, anyhow!(err.to_string()), code);
        }
        Ok(Ok(reply)) => {
            log::debug!("unexpected subscribe reply: {:?}", reply);
            fail_subscription(&client, sub_id, anyhow!("unexpected reply"), 0);
        }
        Ok(Err(ReplyError::Closed)) => {
            // connection went away, the next connect re-drives the
            // subscription from its Subscribing state
        }
        Ok(Err(err)) => {
            fail_subscription(&client, sub_id, anyhow!(err.to_string()), 0);
        }
        Err(_) => {}
    }
}

fn fail_subscription(
    client: &Arc<Mutex<ClientInner>>,
    sub_id: SubscriptionId,
    err: anyhow::Error,
    code: u32,
) {
    let mut inner = client.lock().unwrap();
    if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
        let reason = err.to_string();
        sub.handle_error(err);
        if sub.state != subscription::State::Unsubscribed {
            sub.move_to_unsubscribed(code, &reason);
        }
    }
    // tell the driver so a later subscribe() starts from a clean slate
    if let Some(channel) = inner.sub_ch_write.as_ref() {
        let _ = channel.send(sub_id);
    }
}

/// Schedules the sub-refresh timer for an expiring subscription token.
/// The previous timer for the same subscription is replaced.
fn schedule_sub_refresh(
    inner: &mut ClientInner,
    client: Arc<Mutex<ClientInner>>,
    sub_id: SubscriptionId,
    ttl: u32,
    control_write: ControlSender,
    rt: &Handle,
) {
    let task = rt.spawn(async move {
        let mut ttl = ttl;
        loop {
            tokio::time::sleep(clamp_timer(Duration::from_secs(ttl as u64))).await;

            let (channel, provider, timeout) = {
                let inner = client.lock().unwrap();
                let Some(sub) = inner.subscriptions.get(sub_id) else {
                    return;
                };
                if sub.state != subscription::State::Subscribed {
                    return;
                }
                (
                    sub.channel.to_string(),
                    inner.get_subscription_token.clone(),
                    inner.read_timeout,
                )
            };

            let Some(provider) = provider else {
                return;
            };

            let token = match provider(channel.clone()).await {
                Ok(token) if token.is_empty() => {
                    fail_subscription(&client, sub_id, anyhow!("empty subscription token"), 0);
                    return;
                }
                Ok(token) => token,
                Err(err) => {
                    log::debug!("sub refresh token fetch failed: {}", err);
                    tokio::time::sleep(jittered_retry_delay()).await;
                    ttl = 0;
                    continue;
                }
            };

            {
                let mut inner = client.lock().unwrap();
                if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
                    sub.token = Some(token.clone());
                }
            }

            let (tx, rx) = oneshot::channel();
            let message = ControlMessage::Call {
                command: Command::SubRefresh(SubRefreshRequest { channel, token }),
                reply: tx,
                timeout,
            };
            if control_write.send(message).await.is_err() {
                return;
            }

            match rx.await {
                Ok(Ok(Reply::SubRefresh(result))) => {
                    if !result.expires {
                        return;
                    }
                    ttl = result.ttl;
                }
                Ok(Ok(Reply::Error(err))) if err.temporary => {
                    log::debug!("sub refresh failed temporarily: {}", err);
                    tokio::time::sleep(jittered_retry_delay()).await;
                    ttl = 0;
                }
                Ok(Ok(Reply::Error(err))) => {
                    let code = err.code;
                    fail_subscription(&client, sub_id, anyhow!(err.to_string()), code);
                    return;
                }
                _ => return,
            }
        }
    });

    if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
        if let Some(previous) = sub.refresh_task.replace(task.abort_handle()) {
            previous.abort();
        }
    } else {
        task.abort();
    }
}

/// Pumps queued commands from a gating store into the control channel.
/// Exits when the store is dropped or replaced, or when the connection's
/// writer goes away.
pub(crate) async fn publish_task(
    client: Arc<Mutex<ClientInner>>,
    control_write: ControlSender,
    get_store: impl Fn(&mut ClientInner) -> Option<&mut MessageStore>,
) {
    let mut pub_ch_read = {
        let mut inner = client.lock().unwrap();
        let Some(store) = get_store(&mut inner) else {
            return;
        };
        store.reset_channel()
    };

    const MAX_CAPACITY: usize = 32;
    let mut buffer = Vec::new();
    loop {
        {
            // lock mutex and fill our buffer
            let mut inner = client.lock().unwrap();
            let Some(store) = get_store(&mut inner) else {
                break;
            };
            let now = Instant::now();
            for _ in 0..MAX_CAPACITY {
                if let Some(item) = store.get_next(now) {
                    buffer.push(item);
                } else {
                    break;
                }
            }
        }
        if buffer.is_empty() {
            // wait for activity
            let Some(()) = pub_ch_read.recv().await else {
                break;
            };
        } else {
            // send messages
            for item in buffer.drain(..) {
                if !item.command.expects_reply() {
                    // fire-and-forget: hand to the writer, resolve now
                    if control_write.send(ControlMessage::Fire(item.command)).await.is_err() {
                        return;
                    }
                    let _ = item.reply.send(Ok(Reply::Empty));
                    continue;
                }
                let timeout = item.deadline.saturating_duration_since(Instant::now());
                let message = ControlMessage::Call {
                    command: item.command,
                    reply: item.reply,
                    timeout,
                };
                if control_write.send(message).await.is_err() {
                    return;
                }
            }
        }
    }
}
