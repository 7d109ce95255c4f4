// ABOUTME: Outbound chunker/pacer — fragments application chunk lists into P3 frames under window and burst limits
// ABOUTME: Borrows the connection for release; never reorders within or across enqueue batches

use crate::connection::ConnectionState;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// One already-sized application payload fragment, ready to go out as a
/// single P3 data frame. The caller is responsible for having included
/// whatever stream-identifier bytes the token's letter case requires
/// (§4.4); the pacer treats `payload` as opaque.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub token: String,
    pub frame_type: u8,
    pub payload: bytes::Bytes,
}

impl Chunk {
    pub fn new(token: impl Into<String>, frame_type: u8, payload: impl Into<bytes::Bytes>) -> Self {
        Chunk {
            token: token.into(),
            frame_type,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacerError {
    #[error("connection is closed; chunk was dropped")]
    ConnectionClosed,
}

/// The outbound chunker. FIFO within and across enqueue batches submitted
/// on the same connection; releases at most `burst_cap` frames per tick and
/// never releases past the sliding window.
#[derive(Debug)]
pub struct Pacer {
    pending: VecDeque<Chunk>,
    burst_cap: usize,
    closed: bool,
}

impl Pacer {
    pub fn new(burst_cap: usize) -> Self {
        Pacer {
            pending: VecDeque::new(),
            burst_cap,
            closed: false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Enqueues a batch of chunks. Batches themselves are never interleaved
    /// or reordered relative to one another or their own contents.
    pub fn enqueue(&mut self, chunks: impl IntoIterator<Item = Chunk>) -> Result<(), PacerError> {
        if self.closed {
            return Err(PacerError::ConnectionClosed);
        }
        self.pending.extend(chunks);
        Ok(())
    }

    /// Releases up to `burst_cap` frames this tick, stopping early if the
    /// connection's sliding window fills up. Returns the raw wire bytes of
    /// every frame actually sent, in release order.
    pub fn release(&mut self, conn: &mut ConnectionState) -> Vec<Vec<u8>> {
        let mut released = Vec::new();
        if self.closed {
            return released;
        }
        while released.len() < self.burst_cap {
            if !conn.can_send() {
                break;
            }
            let Some(chunk) = self.pending.front() else {
                break;
            };
            let Some(raw) = conn.send_data(chunk.frame_type, &chunk.token, &chunk.payload) else {
                break;
            };
            self.pending.pop_front();
            debug!(token = %chunk.token, "pacer released chunk");
            released.push(raw);
        }
        released
    }

    /// Drops every remaining chunk and marks the pacer closed; further
    /// `enqueue` calls report failure instead of queueing.
    pub fn close(&mut self) {
        if !self.pending.is_empty() {
            warn!(dropped = self.pending.len(), "pacer closed with chunks still pending");
        }
        self.pending.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
