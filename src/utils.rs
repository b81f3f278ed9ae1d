//! Frame codec and small helpers shared across the crate.

use std::io::BufRead;
use std::time::Duration;

use anyhow::anyhow;
use prost::Message as ProstMessage;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Protocol;
use crate::transport::Frame;

/// Longest single-shot timer the engine will arm. Server-supplied TTLs are
/// clamped here so they stay inside the platform timer range.
pub(crate) const MAX_TIMER: Duration = Duration::from_millis(i32::MAX as u64);

pub(crate) fn clamp_timer(duration: Duration) -> Duration {
    duration.min(MAX_TIMER)
}

/// 5-10 s with jitter, the pause between token refresh retries.
pub(crate) fn jittered_retry_delay() -> Duration {
    Duration::from_millis(5000 + rand::random::<u64>() % 5000)
}

/// Same as `serde_json::to_vec`, named for symmetry with [`decode_json`].
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// Same as `serde_json::from_slice`, but handles empty data correctly:
/// an absent payload decodes as JSON `null`.
pub fn decode_json<T: DeserializeOwned>(mut data: &[u8]) -> Result<T, serde_json::Error> {
    if data.is_empty() {
        data = b"null";
    }
    serde_json::from_slice(data)
}

/// Decodes every envelope in a frame in wire order, invoking `handle_frame`
/// per envelope. The JSON protocol packs one envelope per line; Protobuf
/// packs length-delimited messages back to back.
pub(crate) fn decode_frames<T: DeserializeOwned + ProstMessage + Default>(
    frame: &Frame,
    protocol: Protocol,
    handle_frame: impl FnMut(anyhow::Result<T>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    match (protocol, frame) {
        (Protocol::Json, Frame::Text(text)) => decode_frames_json(text.as_bytes(), handle_frame),
        (Protocol::Json, Frame::Binary(data)) => decode_frames_json(data, handle_frame),
        (Protocol::Protobuf, Frame::Binary(data)) => decode_frames_protobuf(data, handle_frame),
        (Protocol::Protobuf, Frame::Text(_)) => {
            Err(anyhow!("unexpected text frame on protobuf protocol"))
        }
        (_, Frame::Close(_)) => Ok(()),
    }
}

fn decode_frames_json<T: DeserializeOwned>(
    data: &[u8],
    mut handle_frame: impl FnMut(anyhow::Result<T>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    for line in data.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::debug!("failed to read line: {}", err);
                handle_frame(Err(anyhow!(err)))?;
                continue;
            }
        };

        log::trace!("<-- {}", line);

        handle_frame(match serde_json::from_str(&line) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                log::debug!("failed to parse frame: {}", err);
                Err(anyhow!(err))
            }
        })?;
    }

    Ok(())
}

fn decode_frames_protobuf<T: ProstMessage + Default>(
    mut data: &[u8],
    mut handle_frame: impl FnMut(anyhow::Result<T>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    while !data.is_empty() {
        let Ok(len) = prost::decode_length_delimiter(data) else {
            break;
        };
        let len_delimiter_len = prost::length_delimiter_len(len);
        if len_delimiter_len + len > data.len() {
            // need bounds check because len_delimiter is user controlled
            log::trace!("<-- {} (??)", format_protobuf(data));
            break;
        }

        log::trace!("<-- {}", format_protobuf(&data[..len_delimiter_len + len]));
        data = &data[len_delimiter_len..];

        let result = T::decode(&data[..len]).map_err(|err| anyhow!(err));

        data = &data[len..];
        handle_frame(result)?;
    }

    Ok(())
}

/// Encodes a batch of envelopes into a single frame. Returns `None` when
/// nothing survived encoding.
pub(crate) fn encode_frames<T: Serialize + ProstMessage>(
    commands: &[T],
    protocol: Protocol,
    mut on_encode_error: impl FnMut(usize),
) -> Option<Frame> {
    match protocol {
        Protocol::Json => {
            let mut lines = Vec::with_capacity(commands.len());
            for (idx, command) in commands.iter().enumerate() {
                match serde_json::to_string(command) {
                    Ok(line) => {
                        log::trace!("--> {}", &line);
                        lines.push(line);
                    }
                    Err(err) => {
                        on_encode_error(idx);
                        log::debug!("failed to encode command: {:?}", err);
                    }
                }
            }

            if lines.is_empty() {
                None
            } else {
                Some(Frame::Text(lines.join("\n")))
            }
        }
        Protocol::Protobuf => {
            let mut buf = Vec::new();
            for command in commands.iter() {
                let buf_len = buf.len();
                command.encode_length_delimited(&mut buf).unwrap();
                log::trace!("--> {}", format_protobuf(&buf[buf_len..]));
            }
            Some(Frame::Binary(buf))
        }
    }
}

fn format_protobuf(buf: &[u8]) -> String {
    fn buf_to_hex(buf: &[u8]) -> String {
        buf.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join("")
    }

    let Ok(len) = prost::decode_length_delimiter(buf) else {
        return buf_to_hex(buf);
    };
    let len_delimiter_len = prost::length_delimiter_len(len);

    let (len, body) = buf.split_at_checked(len_delimiter_len).unwrap_or((buf, &[]));
    format!("{} {}", buf_to_hex(len), buf_to_hex(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RawCommand, RawReply};

    #[test]
    fn decode_json_handles_empty_payload() {
        let value: serde_json::Value = decode_json(b"").unwrap();
        assert_eq!(value, serde_json::Value::Null);
    }

    #[test]
    fn json_frames_split_on_newlines() {
        let frame = Frame::Text("{\"id\":1,\"rpc\":{}}\n{\"id\":2,\"publish\":{}}".into());
        let mut ids = Vec::new();
        decode_frames::<RawReply>(&frame, Protocol::Json, |reply| {
            ids.push(reply.unwrap().id);
            Ok(())
        })
        .unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn protobuf_truncated_length_delimiter_is_ignored() {
        // length says 100 bytes but only a few follow
        let frame = Frame::Binary(vec![100, 1, 2, 3]);
        let mut count = 0;
        decode_frames::<RawReply>(&frame, Protocol::Protobuf, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn encode_roundtrips_protobuf_batch() {
        let commands = vec![RawCommand { id: 7, ..Default::default() }];
        let Some(Frame::Binary(data)) = encode_frames(&commands, Protocol::Protobuf, |_| {})
        else {
            panic!("expected binary frame");
        };

        let mut seen = Vec::new();
        decode_frames::<RawCommand>(&Frame::Binary(data), Protocol::Protobuf, |command| {
            seen.push(command.unwrap().id);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![7]);
    }

    #[test]
    fn timer_clamp() {
        assert_eq!(clamp_timer(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(clamp_timer(Duration::from_secs(1 << 40)), MAX_TIMER);
    }
}
