//! Control channel framing and message types.
//!
//! Defines the wire format for the control socket: 4-byte big-endian length
//! prefix followed by a UTF-8 JSON object.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Only the segment descriptor travels here; payload bytes live in the
//! shared memory segment it names.

use crate::config::LocalCommConfig;
use crate::{LocalCommError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// The only operation a request may name.
pub const OP_PROCESS: &str = "process";

/// A message that can travel over the control channel.
pub trait ControlMessage: Sized {
    /// Encode into the JSON body of a frame.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Decode and validate a frame body.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Request sent by a caller: process the bytes held in `segment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub segment: String,
    pub size: u64,
}

/// Response sent by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The result is held in `segment`, `size` bytes long.
    Success { segment: String, size: u64 },
    /// The request failed; `message` is shown to the caller.
    Failure { message: String },
}

impl Response {
    /// Message used when a failed response carries no `err`.
    pub const UNKNOWN_ERROR: &'static str = "unknown error";

    /// Create a failure response.
    pub fn failure(message: impl Into<String>) -> Self {
        Response::Failure {
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequestWire {
    op: String,
    shm: String,
    size: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResponseWire {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    out_shm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    out_size: Option<u64>,
}

fn parse_body<'a, T: Deserialize<'a>>(bytes: &'a [u8], what: &str) -> Result<T> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| LocalCommError::malformed(format!("{} is not valid UTF-8", what)))?;
    serde_json::from_str(text).map_err(|e| LocalCommError::malformed(format!("{}: {}", what, e)))
}

impl ControlMessage for Request {
    fn encode(&self) -> Result<Vec<u8>> {
        let wire = RequestWire {
            op: OP_PROCESS.to_string(),
            shm: self.segment.clone(),
            size: self.size,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: RequestWire = parse_body(bytes, "request")?;
        if wire.op != OP_PROCESS {
            return Err(LocalCommError::malformed(format!(
                "unsupported op '{}'",
                wire.op
            )));
        }
        if wire.shm.is_empty() {
            return Err(LocalCommError::malformed("empty segment name"));
        }
        Ok(Request {
            segment: wire.shm,
            size: wire.size,
        })
    }
}

impl ControlMessage for Response {
    fn encode(&self) -> Result<Vec<u8>> {
        let wire = match self {
            Response::Success { segment, size } => ResponseWire {
                ok: true,
                err: None,
                out_shm: Some(segment.clone()),
                out_size: Some(*size),
            },
            Response::Failure { message } => ResponseWire {
                ok: false,
                err: Some(message.clone()),
                out_shm: None,
                out_size: None,
            },
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: ResponseWire = parse_body(bytes, "response")?;
        if !wire.ok {
            return Ok(Response::Failure {
                message: wire.err.unwrap_or_else(|| Self::UNKNOWN_ERROR.to_string()),
            });
        }
        match (wire.out_shm, wire.out_size) {
            (Some(segment), Some(size)) if !segment.is_empty() => {
                Ok(Response::Success { segment, size })
            }
            (Some(_), Some(_)) => Err(LocalCommError::malformed("empty out_shm")),
            (None, _) => Err(LocalCommError::malformed("successful response missing out_shm")),
            (_, None) => Err(LocalCommError::malformed("successful response missing out_size")),
        }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// A stream that ends anywhere before the frame is complete yields
/// [`LocalCommError::ConnectionClosed`].
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    read_exact_or_closed(reader, &mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > LocalCommConfig::MAX_CONTROL_MESSAGE_SIZE {
        return Err(LocalCommError::malformed(format!(
            "control message size {} exceeds maximum {}",
            len,
            LocalCommConfig::MAX_CONTROL_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload).await?;

    Ok(payload)
}

async fn read_exact_or_closed<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(LocalCommError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| LocalCommError::malformed("control message too large to frame"))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and send one message.
pub async fn send<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    M: ControlMessage,
{
    let body = message.encode()?;
    write_frame(writer, &body).await
}

/// Receive and decode one message.
pub async fn receive<R, M>(reader: &mut R) -> Result<M>
where
    R: AsyncReadExt + Unpin,
    M: ControlMessage,
{
    let body = read_frame(reader).await?;
    M::decode(&body)
}

/// Bound one control-channel operation by `timeout`, if set.
pub async fn with_timeout<T, F>(timeout: Option<Duration>, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| LocalCommError::Timeout(limit))?,
        None => operation.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_fields() {
        let req = Request {
            segment: "lcseg_abc".to_string(),
            size: 24,
        };
        let json: serde_json::Value = serde_json::from_slice(&req.encode().unwrap()).unwrap();

        assert_eq!(json["op"], "process");
        assert_eq!(json["shm"], "lcseg_abc");
        assert_eq!(json["size"], 24);
    }

    #[test]
    fn test_request_decode_rejects_wrong_op() {
        let err = Request::decode(br#"{"op":"delete","shm":"x","size":1}"#).unwrap_err();
        assert!(matches!(err, LocalCommError::MalformedMessage { .. }));
        assert!(err.to_string().contains("delete"));
    }

    #[test]
    fn test_request_decode_rejects_missing_and_invalid_fields() {
        assert!(Request::decode(br#"{"op":"process","size":1}"#).is_err());
        assert!(Request::decode(br#"{"op":"process","shm":"x"}"#).is_err());
        assert!(Request::decode(br#"{"op":"process","shm":"x","size":-1}"#).is_err());
        assert!(Request::decode(br#"{"op":"process","shm":"x","size":"12"}"#).is_err());
        assert!(Request::decode(br#"{"op":"process","shm":"","size":1}"#).is_err());
        assert!(Request::decode(b"not json").is_err());
        assert!(Request::decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_request_decode_rejects_unknown_fields() {
        let result = Request::decode(br#"{"op":"process","shm":"x","size":1,"extra":true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_response_success_wire_fields() {
        let resp = Response::Success {
            segment: "lcseg_out".to_string(),
            size: 5,
        };
        let json: serde_json::Value = serde_json::from_slice(&resp.encode().unwrap()).unwrap();

        assert_eq!(json["ok"], true);
        assert_eq!(json["out_shm"], "lcseg_out");
        assert_eq!(json["out_size"], 5);
        assert!(json.get("err").is_none());
    }

    #[test]
    fn test_response_failure_wire_fields() {
        let resp = Response::failure("bad request");
        let json: serde_json::Value = serde_json::from_slice(&resp.encode().unwrap()).unwrap();

        assert_eq!(json["ok"], false);
        assert_eq!(json["err"], "bad request");
        assert!(json.get("out_shm").is_none());
    }

    #[test]
    fn test_response_failure_without_err_defaults() {
        let resp = Response::decode(br#"{"ok":false}"#).unwrap();
        assert_eq!(resp, Response::failure("unknown error"));
    }

    #[test]
    fn test_response_success_requires_descriptor() {
        assert!(Response::decode(br#"{"ok":true,"out_size":3}"#).is_err());
        assert!(Response::decode(br#"{"ok":true,"out_shm":"x"}"#).is_err());
        assert!(Response::decode(br#"{"ok":"yes","out_shm":"x","out_size":3}"#).is_err());
        assert!(Response::decode(br#"{"out_shm":"x","out_size":3}"#).is_err());
    }

    #[tokio::test]
    async fn test_frame_is_big_endian_length_prefixed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello world").await.unwrap();

        assert_eq!(&buf[..4], &[0, 0, 0, 11]);
        assert_eq!(&buf[4..], b"hello world");

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back, b"hello world");
    }

    #[tokio::test]
    async fn test_send_receive_message() {
        let mut buf = Vec::new();
        let req = Request {
            segment: "lcseg_1".to_string(),
            size: 3_110_400,
        };
        send(&mut buf, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Request = receive(&mut cursor).await.unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_is_connection_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(LocalCommError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_frame_read_truncated_header_is_connection_closed() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0]);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(LocalCommError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_frame_read_truncated_body_is_connection_closed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"short");

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(LocalCommError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let pending = std::future::pending::<Result<()>>();
        let result = with_timeout(Some(Duration::from_millis(10)), pending).await;
        assert!(matches!(result, Err(LocalCommError::Timeout(_))));

        let ready = async { Ok(7) };
        assert_eq!(with_timeout(None, ready).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len = (LocalCommConfig::MAX_CONTROL_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(LocalCommError::MalformedMessage { .. })));
    }
}
