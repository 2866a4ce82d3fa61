//! Bridge wire frames
//!
//! Every frame is one JSON object on its own line:
//!
//! ```text
//! {"kind":"rpc-request","id":"…","method":"…","args":…}
//! {"kind":"rpc-response","id":"…","ok":true,"result":…}
//! {"kind":"rpc-response","id":"…","ok":false,"error":"…"}
//! {"kind":"event","type":"…","payload":…}
//! ```
//!
//! JSON string escaping guarantees no raw newline appears inside a frame,
//! so no length prefix is needed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::error::Category;
use thiserror::Error;

/// Largest accepted line, terminator excluded
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// A frame could not be encoded or decoded
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Line is not valid JSON
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Valid JSON, but not a frame (unknown kind, missing or mistyped field)
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Line exceeds the configured limit
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame could not be serialized
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        match e.classify() {
            Category::Data => Self::InvalidFrame(e.to_string()),
            Category::Syntax | Category::Eof | Category::Io => Self::Malformed(e.to_string()),
        }
    }
}

/// Request for the other side to run `method`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

/// Answer to a [`RequestFrame`] with the same `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct ResponseFrame {
    pub id: String,
    pub outcome: Result<Value, String>,
}

impl ResponseFrame {
    #[must_use]
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            outcome: Ok(result),
        }
    }

    #[must_use]
    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: Err(error.into()),
        }
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Serialize, Deserialize)]
struct RawResponse {
    id: String,
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TryFrom<RawResponse> for ResponseFrame {
    type Error = String;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let outcome = if raw.ok {
            Ok(raw.result.unwrap_or(Value::Null))
        } else {
            Err(raw
                .error
                .ok_or_else(|| "rpc-response with ok=false must carry an error".to_string())?)
        };
        Ok(Self {
            id: raw.id,
            outcome,
        })
    }
}

impl From<ResponseFrame> for RawResponse {
    fn from(frame: ResponseFrame) -> Self {
        match frame.outcome {
            Ok(result) => Self {
                id: frame.id,
                ok: true,
                result: Some(result),
                error: None,
            },
            Err(error) => Self {
                id: frame.id,
                ok: false,
                result: None,
                error: Some(error),
            },
        }
    }
}

/// Broadcast notification; not tied to any request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl EventFrame {
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Any frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Frame {
    RpcRequest(RequestFrame),
    RpcResponse(ResponseFrame),
    Event(EventFrame),
}

impl Frame {
    /// Wire name of the frame kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RpcRequest(_) => "rpc-request",
            Self::RpcResponse(_) => "rpc-response",
            Self::Event(_) => "event",
        }
    }
}

impl From<RequestFrame> for Frame {
    fn from(frame: RequestFrame) -> Self {
        Self::RpcRequest(frame)
    }
}

impl From<ResponseFrame> for Frame {
    fn from(frame: ResponseFrame) -> Self {
        Self::RpcResponse(frame)
    }
}

impl From<EventFrame> for Frame {
    fn from(frame: EventFrame) -> Self {
        Self::Event(frame)
    }
}

/// Serialize a frame as one newline-terminated line
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let mut line = serde_json::to_vec(frame).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one line (terminator already stripped)
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for invalid JSON and
/// [`ProtocolError::InvalidFrame`] for JSON that is not a frame
pub fn decode_frame(line: &[u8]) -> Result<Frame, ProtocolError> {
    Ok(serde_json::from_slice(line)?)
}

/// Incremental line splitter for a byte stream
///
/// Bytes after the last newline are held until more arrive; a partial
/// frame is never an error.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline
    scanned: usize,
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            scanned: 0,
            discarding: false,
        }
    }

    /// Feed a chunk and return every complete line it finished, in order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Frame, ProtocolError>> {
        let mut out = Vec::new();
        self.pending.extend_from_slice(chunk);

        while let Some(offset) = self.pending[self.scanned..].iter().position(|b| *b == b'\n') {
            let newline = self.scanned + offset;
            self.scanned = 0;
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            // Tail of a line already reported as oversized
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > self.max_frame_bytes {
                out.push(Err(ProtocolError::FrameTooLarge {
                    len: line.len(),
                    max: self.max_frame_bytes,
                }));
                continue;
            }
            out.push(decode_frame(&line));
        }

        if self.pending.len() > self.max_frame_bytes && !self.discarding {
            out.push(Err(ProtocolError::FrameTooLarge {
                len: self.pending.len(),
                max: self.max_frame_bytes,
            }));
            self.pending.clear();
            self.discarding = true;
        } else if self.discarding {
            self.pending.clear();
        }
        self.scanned = self.pending.len();

        out
    }

    /// Bytes buffered without a terminator yet
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn frames() -> Vec<Frame> {
        vec![
            RequestFrame {
                id: "r1".into(),
                method: "ping".into(),
                args: json!({}),
            }
            .into(),
            ResponseFrame::ok("r1", json!({"pong": true})).into(),
            ResponseFrame::err("r2", "boom").into(),
            EventFrame::new("tick", json!(1)).into(),
        ]
    }

    #[test]
    fn round_trips_every_kind() {
        for frame in frames() {
            let line = encode_frame(&frame).unwrap();
            assert_eq!(line.last(), Some(&b'\n'));
            assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
            let decoded = decode_frame(&line[..line.len() - 1]).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn wire_shapes() {
        let value: Value =
            serde_json::to_value(Frame::from(ResponseFrame::err("7", "nope"))).unwrap();
        assert_eq!(
            value,
            json!({"kind": "rpc-response", "id": "7", "ok": false, "error": "nope"})
        );

        let value: Value = serde_json::to_value(Frame::from(EventFrame::new("tick", json!(1)))).unwrap();
        assert_eq!(value, json!({"kind": "event", "type": "tick", "payload": 1}));
    }

    #[test]
    fn newline_in_payload_is_escaped() {
        let frame: Frame = EventFrame::new("msg", json!("line one\nline two")).into();
        let line = encode_frame(&frame).unwrap();
        let mut decoder = FrameDecoder::default();
        let out = decoder.push(&line);
        assert_eq!(out, vec![Ok(frame)]);
    }

    #[test]
    fn missing_fields_are_invalid() {
        let err = decode_frame(br#"{"kind":"rpc-request","id":"1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));

        let err = decode_frame(br#"{"kind":"rpc-response","id":"1","ok":false}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));

        let err = decode_frame(br#"{"kind":"shout","id":"1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));
    }

    #[test]
    fn ok_response_without_result_is_null() {
        let frame = decode_frame(br#"{"kind":"rpc-response","id":"1","ok":true}"#).unwrap();
        assert_eq!(frame, ResponseFrame::ok("1", Value::Null).into());
    }

    #[test]
    fn buffers_partial_lines() {
        let mut decoder = FrameDecoder::default();
        let line = encode_frame(&EventFrame::new("tick", json!(1)).into()).unwrap();
        let (head, tail) = line.split_at(10);

        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.buffered(), 10);
        let out = decoder.push(tail);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ok());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time() {
        let mut decoder = FrameDecoder::default();
        let mut stream = encode_frame(&EventFrame::new("slow", json!({"n": 1})).into()).unwrap();
        stream.extend(encode_frame(&EventFrame::new("slow", json!({"n": 2})).into()).unwrap());

        let mut out = Vec::new();
        for byte in &stream {
            out.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(
            out,
            vec![
                Ok(EventFrame::new("slow", json!({"n": 1})).into()),
                Ok(EventFrame::new("slow", json!({"n": 2})).into()),
            ]
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn malformed_line_does_not_poison_stream() {
        let mut decoder = FrameDecoder::default();
        let mut chunk = b"not json\r\n\n{\"kind\":\"event\"}\n".to_vec();
        chunk.extend(encode_frame(&EventFrame::new("after", Value::Null).into()).unwrap());

        let out = decoder.push(&chunk);
        assert_eq!(out.len(), 3);
        assert!(matches!(out[0], Err(ProtocolError::Malformed(_))));
        assert!(matches!(out[1], Err(ProtocolError::InvalidFrame(_))));
        assert_eq!(out[2], Ok(EventFrame::new("after", Value::Null).into()));
    }

    #[test]
    fn oversized_line_is_rejected_and_skipped() {
        let mut decoder = FrameDecoder::new(64);
        let big = format!("{{\"kind\":\"event\",\"type\":\"{}\"}}", "x".repeat(100));

        let out = decoder.push(big.as_bytes());
        assert!(matches!(out[..], [Err(ProtocolError::FrameTooLarge { max: 64, .. })]));

        // Rest of the oversized line is dropped, the next line decodes
        let mut rest = b"still the big line\n".to_vec();
        rest.extend(encode_frame(&EventFrame::new("ok", Value::Null).into()).unwrap());
        let out = decoder.push(&rest);
        assert_eq!(out, vec![Ok(EventFrame::new("ok", Value::Null).into())]);
    }
}
