//! Framed JSON wire protocol spoken between the pool and worker processes.
//!
//! Requests flow from the pool to a worker's stdin and responses flow back
//! on its stdout. Each message is one JSON object inside one frame:
//!
//! ```text
//! Newline:         {"id":1,"command":"ping","args":{},"timestamp":"..."}\n
//! LengthPrefixed:  [u32 big-endian length][{"id":1,"command":"ping",...}]
//! ```
//!
//! [`MessageCodec`] implements `tokio_util` [`Decoder`] and [`Encoder`], so a
//! frame that is only partially read when a read is cancelled stays buffered
//! in the `FramedRead` and is completed by the next read.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

/// Default maximum size of a single frame payload (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Errors raised while framing or parsing messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame exceeded the configured limit.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge {
        /// Observed (or announced) payload size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A frame was not a valid message.
    #[error("malformed frame: {reason}")]
    Malformed {
        /// Parser diagnostic.
        reason: String,
    },

    /// A response carried an id with no pending request.
    #[error("response id {id} matches no pending request")]
    Unmatched {
        /// The unmatched id.
        id: u64,
    },

    /// The channel closed, possibly mid-frame.
    #[error("channel closed")]
    Closed,

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// How messages are delimited on the byte stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One JSON object per line.
    #[default]
    Newline,
    /// A 4-byte big-endian length followed by the JSON payload.
    LengthPrefixed,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Newline => "newline",
            Self::LengthPrefixed => "length_prefixed",
        })
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newline" | "ndjson" | "lines" => Ok(Self::Newline),
            "length_prefixed" | "length-prefixed" | "packet" => Ok(Self::LengthPrefixed),
            other => Err(format!("unknown framing: {other}")),
        }
    }
}

/// A command sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique per channel.
    pub id: u64,
    /// Command name understood by the worker.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Map<String, Value>,
    /// ISO-8601 send time.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: String,
}

impl Request {
    /// Build a request stamped with the current time.
    #[must_use]
    pub fn new(id: u64, command: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            id,
            command: command.into(),
            args,
            timestamp: timestamp_now(),
        }
    }
}

/// A worker's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered.
    pub id: u64,
    /// Whether the command succeeded.
    pub success: bool,
    /// Command output on success.
    #[serde(default)]
    pub result: Option<Map<String, Value>>,
    /// Error description on failure.
    #[serde(default)]
    pub error: Option<String>,
    /// ISO-8601 send time.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: String,
}

impl Response {
    /// Build a successful response.
    #[must_use]
    pub fn ok(id: u64, result: Map<String, Value>) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
            timestamp: timestamp_now(),
        }
    }

    /// Build a failed response.
    #[must_use]
    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error.into()),
            timestamp: timestamp_now(),
        }
    }
}

/// Current UTC time as RFC 3339 with millisecond precision.
#[must_use]
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// Workers written against the packet bridge send epoch seconds as a float.
fn lenient_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(epoch_to_rfc3339)
            .unwrap_or_else(|| n.to_string()),
        _ => String::new(),
    })
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_to_rfc3339(secs: f64) -> Option<String> {
    if !secs.is_finite() {
        return None;
    }
    let millis = (secs * 1000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Frames and unframes JSON messages.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    framing: Framing,
    max_message_size: usize,
    // Bytes already scanned for a newline.
    next_index: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(Framing::Newline, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MessageCodec {
    /// Create a codec with the given framing and payload limit.
    #[must_use]
    pub const fn new(framing: Framing, max_message_size: usize) -> Self {
        Self {
            framing,
            max_message_size,
            next_index: 0,
        }
    }

    /// The framing in use.
    #[must_use]
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    /// The payload limit in bytes.
    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Serialize `message` into a complete frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MessageTooLarge` if the payload exceeds the
    /// limit, or `ProtocolError::Malformed` if it cannot be serialized.
    pub fn encode_frame<T: Serialize>(&self, message: &T) -> Result<Bytes, ProtocolError> {
        let mut dst = BytesMut::new();
        self.write_frame(message, &mut dst)?;
        Ok(dst.freeze())
    }

    fn write_frame<T: Serialize>(
        &self,
        message: &T,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        // Compact JSON escapes control characters, so the payload never
        // contains a raw newline.
        let payload = serde_json::to_vec(message).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
        })?;
        self.check_size(payload.len())?;

        match self.framing {
            Framing::Newline => {
                dst.reserve(payload.len() + 1);
                dst.put_slice(&payload);
                dst.put_u8(b'\n');
            }
            Framing::LengthPrefixed => {
                let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::MessageTooLarge {
                    size: payload.len(),
                    limit: self.max_message_size,
                })?;
                dst.reserve(payload.len() + LENGTH_PREFIX_BYTES);
                dst.put_u32(len);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }

    const fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            let start = self.next_index.min(src.len());
            let newline = src[start..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                // A line without its delimiter can never shrink below the limit.
                if src.len() > self.max_message_size.saturating_add(1) {
                    return Err(ProtocolError::MessageTooLarge {
                        size: src.len(),
                        limit: self.max_message_size,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let end = start + offset;
            self.next_index = 0;
            let mut line = src.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            self.check_size(line.len())?;
            return Ok(Some(line.freeze()));
        }
    }

    fn decode_length_prefixed(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let len = u32::from_be_bytes(prefix) as usize;
        self.check_size(len)?;

        let total = LENGTH_PREFIX_BYTES + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_BYTES);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing {
            Framing::Newline => self.decode_line(src),
            Framing::LengthPrefixed => self.decode_length_prefixed(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            return Ok(None);
        }
        Err(ProtocolError::Closed)
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.write_frame(&item, dst)
    }
}

fn parse<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(frame).map_err(|e| ProtocolError::Malformed {
        reason: e.to_string(),
    })
}

/// Parse a request frame.
///
/// # Errors
///
/// Returns `ProtocolError::Malformed` on invalid JSON or missing `id`/`command`.
pub fn decode_request(frame: &[u8]) -> Result<Request, ProtocolError> {
    parse(frame)
}

/// Parse a response frame.
///
/// # Errors
///
/// Returns `ProtocolError::Malformed` on invalid JSON or missing `id`/`success`.
pub fn decode_response(frame: &[u8]) -> Result<Response, ProtocolError> {
    parse(frame)
}

/// Read the next frame, waiting until it is complete.
///
/// Cancel-safe: bytes of a partial frame stay buffered in `reader`.
///
/// # Errors
///
/// Returns `ProtocolError::Closed` when the stream ends, or any codec error.
pub async fn read_frame<R>(reader: &mut FramedRead<R, MessageCodec>) -> Result<Bytes, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    reader.next().await.unwrap_or(Err(ProtocolError::Closed))
}

/// Read and parse the next message.
///
/// # Errors
///
/// Same as [`read_frame`], plus `ProtocolError::Malformed` for unparsable frames.
pub async fn read_message<R, T>(
    reader: &mut FramedRead<R, MessageCodec>,
) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let frame = read_frame(reader).await?;
    parse(&frame)
}

/// Match a response to its pending request and remove that entry.
///
/// # Errors
///
/// Returns `ProtocolError::Unmatched` when no request with the response's id
/// is pending. The caller should log and drop the response.
pub fn correlate<T>(
    response: &Response,
    pending: &mut HashMap<u64, T>,
) -> Result<T, ProtocolError> {
    pending
        .remove(&response.id)
        .ok_or(ProtocolError::Unmatched { id: response.id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedWrite;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn newline_frame_has_single_delimiter() {
        let codec = MessageCodec::default();
        let request = Request::new(7, "echo", args(json!({"text": "a\nb"})));
        let frame = codec.encode_frame(&request).unwrap();

        assert!(frame.ends_with(b"\n"));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);

        let mut buf = BytesMut::from(&frame[..]);
        let mut codec = MessageCodec::default();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decode_request(&decoded).unwrap(), request);
        assert!(buf.is_empty());
    }

    #[test]
    fn length_prefixed_roundtrip() {
        let mut codec = MessageCodec::new(Framing::LengthPrefixed, DEFAULT_MAX_MESSAGE_SIZE);
        let response = Response::ok(3, args(json!({"status": "ok"})));

        let mut buf = BytesMut::new();
        codec.encode(&response, &mut buf).unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decode_response(&frame).unwrap(), response);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::from(&b"{\"id\":1,\"success\":tr"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ue}\r\n\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let response = decode_response(&frame).unwrap();
        assert!(response.success);
        // Blank line is skipped
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_rejects_oversized_message() {
        let codec = MessageCodec::new(Framing::Newline, 32);
        let request = Request::new(1, "echo", args(json!({"text": "x".repeat(64)})));
        assert!(matches!(
            codec.encode_frame(&request),
            Err(ProtocolError::MessageTooLarge { limit: 32, .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized_line() {
        let mut codec = MessageCodec::new(Framing::Newline, 8);
        let mut buf = BytesMut::from(&b"0123456789abcdef"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized_prefix() {
        let mut codec = MessageCodec::new(Framing::LengthPrefixed, 8);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MessageTooLarge { size: 1024, .. })
        ));
    }

    #[test]
    fn eof_mid_frame_is_closed() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::from(&b"{\"id\":1"[..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(ProtocolError::Closed)
        ));

        let mut empty = BytesMut::from(&b"\n"[..]);
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        assert!(matches!(
            decode_request(br#"{"id": 1}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            decode_response(br#"{"id": 1, "result": {}}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            decode_response(b"not json"),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn lenient_response_fields() {
        let response =
            decode_response(br#"{"id": 9, "success": true, "timestamp": 1700000000.5}"#).unwrap();
        assert_eq!(response.result, None);
        assert_eq!(response.error, None);
        assert_eq!(response.timestamp, "2023-11-14T22:13:20.500Z");

        let request = decode_request(br#"{"id": 2, "command": "ping"}"#).unwrap();
        assert!(request.args.is_empty());
        assert!(request.timestamp.is_empty());
    }

    #[test]
    fn response_serializes_nulls() {
        let value = serde_json::to_value(Response::err(4, "boom")).unwrap();
        assert_eq!(value["result"], Value::Null);
        assert_eq!(value["error"], "boom");
        assert_eq!(value["success"], false);
    }

    #[test]
    fn correlate_matches_and_removes() {
        let mut pending = HashMap::from([(1u64, "ping"), (2u64, "echo")]);
        let response = Response::ok(2, Map::new());
        assert_eq!(correlate(&response, &mut pending).unwrap(), "echo");
        assert!(matches!(
            correlate(&response, &mut pending),
            Err(ProtocolError::Unmatched { id: 2 })
        ));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn framing_from_str() {
        assert_eq!("newline".parse::<Framing>().unwrap(), Framing::Newline);
        assert_eq!(
            "length-prefixed".parse::<Framing>().unwrap(),
            Framing::LengthPrefixed
        );
        assert!("xml".parse::<Framing>().is_err());
    }

    #[tokio::test]
    async fn read_message_over_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWrite::new(client, MessageCodec::default());
        let mut reader = FramedRead::new(server, MessageCodec::default());

        writer.send(Response::ok(1, Map::new())).await.unwrap();
        writer.send(Response::err(2, "nope")).await.unwrap();

        let first: Response = read_message(&mut reader).await.unwrap();
        let second: Response = read_message(&mut reader).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.error.as_deref(), Some("nope"));

        let mut inner = writer.into_inner();
        inner.write_all(b"{\"id\":3").await.unwrap();
        drop(inner);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ProtocolError::Closed)
        ));
    }
}
