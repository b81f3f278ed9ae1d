//! Reconnect pacing and transport selection.
//!
//! The session engine walks the configured endpoint list in order. An
//! endpoint that fails before its transport ever opened advances the index
//! and retries with zero delay, so alternate transports are probed quickly;
//! once any transport has opened, the jittered backoff policy applies.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::types::State;
use crate::transport::{self, Frame, TransportError};

use super::inner::ClientInner;

pub(crate) struct ConnectionManager;

impl ConnectionManager {
    /// Waits out the reconnect delay, interruptible by a user disconnect.
    ///
    /// `Err(false)` means the wait was interrupted and the cycle must stop.
    pub(crate) fn do_delay<'a>(
        client: &Arc<Mutex<ClientInner>>,
        closer_read: &'a mut mpsc::Receiver<bool>,
        reconnect_attempts: u32,
    ) -> impl Future<Output = Result<(), bool>> + 'a {
        let delay = {
            let inner = client.lock().unwrap();
            // a close before any transport opened keeps walking the
            // endpoint list without delay, but only for one full pass
            let probing = !inner.ever_opened
                && inner.endpoints.len() > 1
                && (reconnect_attempts as usize) < inner.endpoints.len();
            if reconnect_attempts == 0 || probing {
                Duration::ZERO
            } else {
                inner
                    .reconnect_strategy
                    .time_before_next_attempt(reconnect_attempts)
            }
        };

        async move {
            let task = async {
                if reconnect_attempts > 0 {
                    log::debug!(
                        "reconnecting attempt {}, delay={:?}",
                        reconnect_attempts,
                        delay
                    );
                }
                tokio::time::sleep(delay).await;
                Ok(())
            };

            tokio::select! {
                biased;
                _ = closer_read.recv() => {
                    log::debug!("reconnect interrupted by user");
                    Err(false)
                }
                result = task => result
            }
        }
    }

    /// Opens the current endpoint's transport.
    ///
    /// On failure the endpoint index advances so the next attempt probes
    /// the next entry; `Err(true)` schedules that attempt, `Err(false)`
    /// aborts the cycle.
    pub(crate) fn do_connect<'a>(
        client: &Arc<Mutex<ClientInner>>,
        closer_read: &'a mut mpsc::Receiver<bool>,
        initial_frame: Option<Frame>,
    ) -> impl Future<Output = Result<transport::Connection, bool>> + 'a {
        let (endpoint, protocol) = {
            let inner = client.lock().unwrap();
            (inner.current_endpoint(), inner.protocol)
        };

        let client = client.clone();
        async move {
            let task = async {
                if !endpoint.transport.supported() {
                    log::debug!("transport {} not supported, skipping", endpoint.transport.name());
                    let mut inner = client.lock().unwrap();
                    let more = inner.advance_endpoint();
                    return Err(more);
                }

                let connect = endpoint.transport.connect(&endpoint.url, protocol, initial_frame);
                match connect.await {
                    Ok(conn) => {
                        let mut inner = client.lock().unwrap();
                        inner.ever_opened = true;
                        Ok(conn)
                    }
                    Err(err) => {
                        log::debug!("{err}");
                        let mut inner = client.lock().unwrap();
                        if inner.state != State::Connecting {
                            return Err(false);
                        }

                        let more = inner.advance_endpoint();
                        let do_reconnect = match err {
                            // a bad url never gets better; only retry if
                            // other endpoints remain to probe
                            TransportError::BadEndpoint(_) | TransportError::Unsupported => more,
                            _ => true,
                        };

                        if let Some(ref mut on_error) = inner.on_error {
                            on_error(err.into());
                        }
                        Err(do_reconnect)
                    }
                }
            };

            tokio::select! {
                biased;
                _ = closer_read.recv() => {
                    log::debug!("connect interrupted by user");
                    Err(false)
                }
                result = task => result
            }
        }
    }

    /// Verifies the session is still in `expected` state.
    pub(crate) fn do_check_state(
        client: &Arc<Mutex<ClientInner>>,
        expected: State,
    ) -> Result<(), bool> {
        let inner = client.lock().unwrap();
        if inner.state != expected {
            return Err(false);
        }
        Ok(())
    }
}
