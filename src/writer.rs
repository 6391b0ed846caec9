//! Outgoing message drain for the request pipe.
//!
//! At most one request frame is in flight per worker generation; the engine
//! drives it across however many partial writes the pipe accepts, staying
//! free to service responses and diagnostics in between. A short write is
//! normal; a zero-length write means the peer is gone.

use bytes::{Buf, Bytes};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// One pre-serialized request frame being written to the worker.
///
/// Holds the unwritten suffix; dropped once fully drained. Scoped to one
/// worker generation.
#[derive(Debug)]
pub struct OutgoingMessage {
    pending: Bytes,
}

impl OutgoingMessage {
    /// Create from a complete serialized frame (length prefix included).
    pub fn new(frame: Bytes) -> Self {
        Self { pending: frame }
    }

    /// Bytes not yet accepted by the pipe.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Perform one write of as much pending data as the descriptor accepts,
    /// trimming the written prefix. Returns whether the message is fully
    /// sent.
    pub async fn advance<W>(&mut self, writer: &mut W) -> std::io::Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        if self.pending.is_empty() {
            return Ok(true);
        }

        let written = writer.write(&self.pending).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "request pipe accepted zero bytes",
            ));
        }

        self.pending.advance(written);
        Ok(self.pending.is_empty())
    }
}
