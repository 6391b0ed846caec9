//! Cross-module protocol tests: framing codec, response assembly and the
//! outgoing drain working together, without a worker process.

use bytes::Bytes;
use serde_json::json;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

use ioproc::protocol::{
    decode_request, decode_response, encode_request, encode_response, Response, ResponseBuffer,
    LENGTH_SIZE,
};

/// A request frame survives reassembly and decoding on the worker side.
#[test]
fn test_request_through_response_buffer() {
    let args = json!({ "path": "/var/log/messages", "direct": false });
    let frame = encode_request(17, "readfile", &args).unwrap();

    let mut buffer = ResponseBuffer::new();
    let payloads = buffer.push(&frame).unwrap();
    assert_eq!(payloads.len(), 1);

    let request = decode_request(&payloads[0]).unwrap();
    assert_eq!(request.id, 17);
    assert_eq!(request.method, "readfile");
    assert_eq!(request.args, args);
}

/// Fragmented responses decode identically to whole ones.
#[test]
fn test_fragmented_response_stream() {
    let responses: Vec<Response> = (1u64..=5)
        .map(|id| Response {
            id,
            errcode: 0,
            errstr: None,
            result: Some(json!(format!("result-{id}"))),
        })
        .collect();

    let mut stream = Vec::new();
    for response in &responses {
        stream.extend_from_slice(&encode_response(response).unwrap());
    }

    // Feed in awkward 7-byte chunks that straddle every length prefix.
    let mut buffer = ResponseBuffer::new();
    let mut decoded = Vec::new();
    for chunk in stream.chunks(7) {
        for payload in buffer.push(chunk).unwrap() {
            decoded.push(decode_response(&payload).unwrap());
        }
    }

    assert_eq!(decoded, responses);
    assert!(buffer.is_empty());
}

/// A frame pushed through a tiny pipe one partial write at a time arrives
/// intact on the reading side.
#[tokio::test]
async fn test_partial_writes_reassemble() {
    use ioproc::protocol::Request;

    let frame = encode_request(99, "echo", &json!({ "text": "x".repeat(512) })).unwrap();
    let expected: Request = serde_json::from_slice(&frame[LENGTH_SIZE..]).unwrap();

    let (mut tx, mut rx) = duplex(16);

    let writer = tokio::spawn(async move {
        // Emulate the engine's drain loop with a 16-byte pipe.
        let mut pending = Bytes::from(frame);
        while !pending.is_empty() {
            let n = tx.write(&pending).await.unwrap();
            assert!(n > 0);
            pending = pending.slice(n..);
        }
    });

    let mut buffer = ResponseBuffer::new();
    let mut requests = Vec::new();
    let mut read_buf = [0u8; 16];
    while requests.is_empty() {
        let n = rx.read(&mut read_buf).await.unwrap();
        assert!(n > 0, "stream ended before a full frame");
        for payload in buffer.push(&read_buf[..n]).unwrap() {
            requests.push(decode_request(&payload).unwrap());
        }
    }
    writer.await.unwrap();

    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0], expected);
}

/// Error responses carry their code and message through the codec.
#[test]
fn test_error_response_roundtrip() {
    let original = Response {
        id: 3,
        errcode: libc::ENOENT,
        errstr: Some("No such file or directory".to_string()),
        result: None,
    };

    let frame = encode_response(&original).unwrap();
    let mut buffer = ResponseBuffer::new();
    let payloads = buffer.push(&frame).unwrap();
    let decoded = decode_response(&payloads[0]).unwrap();

    assert_eq!(decoded, original);
}
