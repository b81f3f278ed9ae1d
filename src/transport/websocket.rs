//! WebSocket transport over tokio-tungstenite.

use anyhow::anyhow;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::Protocol;

use super::{CloseFrame, ConnectFuture, Connection, Frame, Transport, TransportError};

/// The default transport. Frames map one-to-one onto WebSocket text/binary
/// messages; WebSocket-level ping/pong is handled inside tungstenite and
/// never reaches the session engine.
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    fn connect(
        &self,
        endpoint: &str,
        _protocol: Protocol,
        initial_frame: Option<Frame>,
    ) -> ConnectFuture {
        let url = endpoint.to_string();
        Box::pin(async move {
            log::debug!("connecting to {}", url);
            let (stream, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok(ok) => ok,
                Err(tungstenite::Error::Url(err)) => {
                    return Err(TransportError::BadEndpoint(err.to_string()));
                }
                Err(err) => return Err(TransportError::Connect(anyhow!(err))),
            };

            let (mut write_ws, read_ws) = stream.split();

            if let Some(frame) = initial_frame {
                write_ws
                    .send(message_from_frame(frame))
                    .await
                    .map_err(|err| TransportError::Write(err.to_string()))?;
            }

            let sink = write_ws
                .sink_map_err(|err: tungstenite::Error| TransportError::Write(err.to_string()))
                .with(|frame: Frame| {
                    futures::future::ready(Ok::<Message, TransportError>(message_from_frame(
                        frame,
                    )))
                });

            let stream = read_ws.filter_map(|message| {
                futures::future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                    Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
                    Ok(Message::Close(close_frame)) => {
                        Some(Ok(Frame::Close(close_frame.map(|frame| CloseFrame {
                            code: frame.code.into(),
                            reason: frame.reason.into_owned(),
                        }))))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::Read(err.to_string()))),
                })
            });

            Ok(Connection {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}

fn message_from_frame(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Close(close_frame) => Message::Close(close_frame.map(|frame| {
            tungstenite::protocol::CloseFrame {
                code: frame.code.into(),
                reason: frame.reason.into(),
            }
        })),
    }
}
