//! Wire format encoding and decoding.
//!
//! Both directions use the same framing:
//! ```text
//! ┌────────────────────┬──────────────────────────┐
//! │ Length             │ Payload                  │
//! │ 8 bytes, native u64│ UTF-8 JSON, Length bytes │
//! └────────────────────┴──────────────────────────┘
//! ```
//!
//! Requests carry `{id, methodName, args}`, responses
//! `{id, errcode, errstr?, result?}`. Client and worker always run on the
//! same host, so the length prefix uses the platform's native byte order.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IoprocError, Result};

/// Length prefix size in bytes (fixed, exactly 8).
pub const LENGTH_SIZE: usize = 8;

/// Error code of the synthetic response delivered to every request still
/// outstanding when a worker generation dies.
pub const ERR_WORKER_CRASH: i32 = 100001;

/// A request as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    /// Client-assigned request identifier, unique while outstanding.
    pub id: u64,
    /// Operation name, e.g. `"stat"`.
    #[serde(rename = "methodName")]
    pub method: String,
    /// Operation arguments.
    pub args: Value,
}

/// A response as it appears on the wire.
///
/// Produced by the worker, except for the synthetic crash response built by
/// [`Response::crashed`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    /// Identifier of the request this answers.
    pub id: u64,
    /// 0 on success, an OS-style error code otherwise.
    #[serde(default)]
    pub errcode: i32,
    /// Human-readable error message when `errcode != 0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errstr: Option<String>,
    /// Operation result when `errcode == 0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Response {
    /// The synthetic response delivered when the worker generation died
    /// before answering.
    pub fn crashed(id: u64) -> Self {
        Self {
            id,
            errcode: ERR_WORKER_CRASH,
            errstr: Some("worker process crashed unexpectedly".to_string()),
            result: None,
        }
    }
}

/// Encode a request into a complete length-prefixed frame.
///
/// Deterministic and side-effect free.
pub fn encode_request(id: u64, method: &str, args: &Value) -> Result<Bytes> {
    let request = Request {
        id,
        method: method.to_string(),
        args: args.clone(),
    };
    let payload =
        serde_json::to_vec(&request).map_err(|e| IoprocError::Protocol(e.to_string()))?;
    Ok(frame(&payload))
}

/// Encode a response into a complete length-prefixed frame.
pub fn encode_response(response: &Response) -> Result<Bytes> {
    let payload =
        serde_json::to_vec(response).map_err(|e| IoprocError::Protocol(e.to_string()))?;
    Ok(frame(&payload))
}

/// Decode a response payload (the bytes after the length prefix).
///
/// Failure here means the stream is corrupt and is treated as fatal by the
/// engine, never retried.
pub fn decode_response(payload: &[u8]) -> Result<Response> {
    serde_json::from_slice(payload)
        .map_err(|e| IoprocError::Protocol(format!("undecodable response: {e}")))
}

/// Decode a request payload; the worker-side counterpart of
/// [`encode_request`].
pub fn decode_request(payload: &[u8]) -> Result<Request> {
    serde_json::from_slice(payload)
        .map_err(|e| IoprocError::Protocol(format!("undecodable request: {e}")))
}

fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_SIZE + payload.len());
    buf.put_slice(&(payload.len() as u64).to_ne_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let frame = encode_request(7, "echo", &json!({"text": "hi", "sleep": 0})).unwrap();

        let len = u64::from_ne_bytes(frame[..LENGTH_SIZE].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - LENGTH_SIZE);

        let request: Request = serde_json::from_slice(&frame[LENGTH_SIZE..]).unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(request.method, "echo");
        assert_eq!(request.args["text"], "hi");
    }

    #[test]
    fn test_request_uses_method_name_key() {
        let frame = encode_request(1, "ping", &json!({})).unwrap();
        let raw: Value = serde_json::from_slice(&frame[LENGTH_SIZE..]).unwrap();
        assert!(raw.get("methodName").is_some());
        assert!(raw.get("method").is_none());
    }

    #[test]
    fn test_length_prefix_is_native_endian() {
        let frame = encode_request(1, "ping", &json!({})).unwrap();
        let mut expected = [0u8; LENGTH_SIZE];
        expected.copy_from_slice(&((frame.len() - LENGTH_SIZE) as u64).to_ne_bytes());
        assert_eq!(&frame[..LENGTH_SIZE], &expected);
    }

    #[test]
    fn test_response_roundtrip() {
        let original = Response {
            id: 42,
            errcode: 0,
            errstr: None,
            result: Some(json!("pong")),
        };
        let frame = encode_response(&original).unwrap();
        let decoded = decode_response(&frame[LENGTH_SIZE..]).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_response_defaults() {
        // Workers may omit errcode/errstr/result on success paths.
        let decoded = decode_response(br#"{"id": 3}"#).unwrap();
        assert_eq!(decoded.id, 3);
        assert_eq!(decoded.errcode, 0);
        assert!(decoded.errstr.is_none());
        assert!(decoded.result.is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode_response(b"not json at all");
        assert!(matches!(result, Err(IoprocError::Protocol(_))));
    }

    #[test]
    fn test_crashed_response() {
        let response = Response::crashed(9);
        assert_eq!(response.id, 9);
        assert_eq!(response.errcode, ERR_WORKER_CRASH);
        assert!(response.result.is_none());
    }
}
