//! Response buffer for accumulating partial reads.
//!
//! The engine reads whatever the response pipe has ready and pushes it here;
//! complete message payloads come out once their declared length is fully
//! buffered. Uses `bytes::BytesMut` so extracted payloads are zero-copy
//! slices of the read buffer. The 8-byte length prefix is buffered
//! incrementally just like the payload, so a header split across reads is
//! handled, not fatal.

use bytes::{Bytes, BytesMut};

use super::wire_format::LENGTH_SIZE;
use crate::error::{IoprocError, Result};

/// Default maximum payload size (1 GiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 1_073_741_824;

/// Parsing state.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for the complete 8-byte length prefix.
    AwaitingLength,
    /// Length parsed, waiting for that many payload bytes.
    AwaitingPayload { remaining: u64 },
}

/// Accumulates incoming bytes and yields complete response payloads.
///
/// State is scoped to one worker generation and discarded on restart.
pub struct ResponseBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u64,
}

impl ResponseBuffer {
    /// Create a response buffer with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a response buffer with a custom payload limit.
    pub fn with_max_payload(max_payload_size: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::AwaitingLength,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all now-complete payloads.
    ///
    /// Fragmented input is buffered internally for the next push, so feeding
    /// one byte at a time yields the same payloads as feeding everything at
    /// once.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a declared length exceeds the configured
    /// maximum; the engine treats this as fatal.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();
        while let Some(payload) = self.try_extract_one()? {
            payloads.push(payload);
        }
        Ok(payloads)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::AwaitingLength => {
                if self.buffer.len() < LENGTH_SIZE {
                    return Ok(None);
                }

                let mut raw = [0u8; LENGTH_SIZE];
                raw.copy_from_slice(&self.buffer[..LENGTH_SIZE]);
                let length = u64::from_ne_bytes(raw);

                if length > self.max_payload_size {
                    return Err(IoprocError::Protocol(format!(
                        "declared payload size {} exceeds maximum {}",
                        length, self.max_payload_size
                    )));
                }

                let _ = self.buffer.split_to(LENGTH_SIZE);
                self.state = State::AwaitingPayload { remaining: length };
                self.try_extract_one()
            }

            State::AwaitingPayload { remaining } => {
                let remaining = remaining as usize;
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining).freeze();
                self.state = State::AwaitingLength;
                Ok(Some(payload))
            }
        }
    }

    /// Number of buffered bytes not yet part of a complete payload.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}
