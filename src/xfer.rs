// ABOUTME: XFER sub-protocol — server-initiated file send: prelude, go-token wait, block streaming
// ABOUTME: Escape scheme keeps reserved block markers out of the payload stream (DL_ESC/DL_XOR)

use crate::fdo::{FdoCompiler, FdoError};
use crate::pacer::Chunk;
use bytes::Bytes;

/// Default per-transfer burst cap, independent of the pacer's general
/// burst cap (§4.7 step 4).
pub const DEFAULT_TRANSFER_BURST: usize = 8;

/// Default block size for the data phase, in bytes of pre-escape payload.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Generic token for opaque FDO content forwarded to the client (post-login
/// screen renders, this transfer's prelude, keyword-handler output) — the
/// core never parses it, only relays it (§1 non-goals).
pub const TOKEN_FDO_RENDER: &str = "Dd";
pub const TOKEN_XFER_BEGIN: &str = "tj";
pub const TOKEN_XFER_FOLLOWUP: &str = "tf";
pub const TOKEN_XFER_GO: &str = "xG";
pub const TOKEN_XFER_DATA: &str = "F9";
pub const TOKEN_XFER_DONE: &str = "fX";

const FRAME_TYPE_XFER: u8 = b'T';

/// Escape byte: any reserved marker byte appearing in the payload is
/// preceded by this and XOR'd with [`DL_XOR`].
pub const DL_ESC: u8 = 0x10;
/// XOR mask applied to an escaped byte's original value.
pub const DL_XOR: u8 = 0x20;

/// Block markers honored at the start of each data-phase frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMarker {
    Start,
    Data,
    End,
}

impl BlockMarker {
    pub fn byte(self) -> u8 {
        match self {
            BlockMarker::Start => b'b',
            BlockMarker::Data => b'd',
            BlockMarker::End => b'e',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    PreludeSent,
    AwaitingGo,
    Streaming,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum XferError {
    #[error("xG received but transfer was not awaiting it (state {0:?})")]
    NotAwaitingGo(TransferState),
    #[error("next_block called on a transfer that is not streaming (state {0:?})")]
    NotStreaming(TransferState),
    #[error("FDO prelude failed to compile")]
    PreludeCompilationFailed,
}

/// One server-to-client file transfer (§3, §4.7). `payload` is the whole
/// file body, held in memory; chunked reads off disk are out of scope here,
/// the core only ever deals in byte buffers handed to it by a handler.
#[derive(Debug)]
pub struct Transfer {
    transfer_id: u32,
    filename: String,
    payload: Bytes,
    cursor: usize,
    block_size: usize,
    state: TransferState,
    burst_budget: usize,
}

impl Transfer {
    /// Builds the prelude chunk list (compiled through `compiler`) plus the
    /// `tj`/`tf` tokens, and returns a transfer parked in `AwaitingGo`
    /// alongside the chunks to enqueue (§4.7 steps 1-2).
    pub fn initiate(
        transfer_id: u32,
        filename: impl Into<String>,
        payload: impl Into<Bytes>,
        compiler: &dyn FdoCompiler,
        block_size: usize,
    ) -> Result<(Transfer, Vec<Chunk>), XferError> {
        let filename = filename.into();
        let payload = payload.into();

        let prelude_source = format!("XFER_PRELUDE name={filename} size={}", payload.len());
        let prelude_bytes = compiler
            .compile(&prelude_source)
            .map_err(|_: FdoError| XferError::PreludeCompilationFailed)?;

        let mut chunks = vec![Chunk::new(TOKEN_FDO_RENDER, FRAME_TYPE_XFER, prelude_bytes)];
        chunks.push(Chunk::new(TOKEN_XFER_BEGIN, FRAME_TYPE_XFER, Bytes::new()));
        chunks.push(Chunk::new(TOKEN_XFER_FOLLOWUP, FRAME_TYPE_XFER, Bytes::new()));

        let transfer = Transfer {
            transfer_id,
            filename,
            payload,
            cursor: 0,
            block_size,
            state: TransferState::AwaitingGo,
            burst_budget: DEFAULT_TRANSFER_BURST,
        };
        Ok((transfer, chunks))
    }

    pub fn id(&self) -> u32 {
        self.transfer_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Handles the client's `xG` readiness token (§4.7 step 3).
    pub fn on_client_ready(&mut self) -> Result<(), XferError> {
        if self.state != TransferState::AwaitingGo {
            return Err(XferError::NotAwaitingGo(self.state));
        }
        self.state = TransferState::Streaming;
        Ok(())
    }

    /// Produces the next batch of data-phase chunks, honoring the
    /// per-transfer burst cap (§4.7 step 4). Each block is escaped and
    /// tagged with its marker; the final block emits the end marker and
    /// the transfer completion chunk, transitioning to `Done`.
    pub fn next_chunks(&mut self) -> Result<Vec<Chunk>, XferError> {
        if self.state != TransferState::Streaming {
            return Err(XferError::NotStreaming(self.state));
        }

        let mut chunks = Vec::new();
        for _ in 0..self.burst_budget {
            if self.cursor >= self.payload.len() {
                break;
            }
            let end = (self.cursor + self.block_size).min(self.payload.len());
            let is_first = self.cursor == 0;
            let is_last_block = end == self.payload.len();
            let marker = if is_first {
                BlockMarker::Start
            } else if is_last_block {
                BlockMarker::End
            } else {
                BlockMarker::Data
            };

            let mut escaped = Vec::with_capacity(end - self.cursor + 1);
            escaped.push(marker.byte());
            escape_block(&self.payload[self.cursor..end], &mut escaped);
            chunks.push(Chunk::new(TOKEN_XFER_DATA, FRAME_TYPE_XFER, escaped));

            self.cursor = end;
            if is_last_block {
                chunks.push(Chunk::new(TOKEN_XFER_DONE, FRAME_TYPE_XFER, Bytes::new()));
                self.state = TransferState::Done;
                break;
            }
        }
        Ok(chunks)
    }

    /// Transitions the transfer to `Failed` on mid-stream socket loss;
    /// no retry happens at this layer (§4.7 step 6).
    pub fn fail(&mut self) {
        self.state = TransferState::Failed;
    }
}

/// Escapes reserved block-marker bytes (`b`, `d`, `e`) plus the escape byte
/// itself so the decoder never confuses payload content with a marker:
/// each reserved byte is replaced by `DL_ESC` followed by `byte ^ DL_XOR`.
pub fn escape_block(input: &[u8], out: &mut Vec<u8>) {
    for &b in input {
        if is_reserved(b) {
            out.push(DL_ESC);
            out.push(b ^ DL_XOR);
        } else {
            out.push(b);
        }
    }
}

/// Inverse of [`escape_block`].
pub fn unescape_block(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter().copied();
    while let Some(b) = iter.next() {
        if b == DL_ESC {
            if let Some(escaped) = iter.next() {
                out.push(escaped ^ DL_XOR);
            }
        } else {
            out.push(b);
        }
    }
    out
}

fn is_reserved(b: u8) -> bool {
    matches!(b, b'b' | b'd' | b'e') || b == DL_ESC
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdo::NullFdoCompiler;

    #[test]
    fn initiate_emits_prelude_then_begin_then_followup() {
        let compiler = NullFdoCompiler;
        let (transfer, chunks) = Transfer::initiate(1, "tiny.txt", &b"tiny\n"[..], &compiler, DEFAULT_BLOCK_SIZE).unwrap();
        assert_eq!(transfer.state(), TransferState::AwaitingGo);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].token, TOKEN_XFER_BEGIN);
        assert_eq!(chunks[2].token, TOKEN_XFER_FOLLOWUP);
    }

    #[test]
    fn client_ready_transitions_to_streaming() {
        let compiler = NullFdoCompiler;
        let (mut transfer, _) = Transfer::initiate(1, "tiny.txt", &b"tiny\n"[..], &compiler, DEFAULT_BLOCK_SIZE).unwrap();
        transfer.on_client_ready().unwrap();
        assert_eq!(transfer.state(), TransferState::Streaming);
    }

    #[test]
    fn small_payload_streams_as_a_single_block_then_completes() {
        let compiler = NullFdoCompiler;
        let (mut transfer, _) = Transfer::initiate(1, "tiny.txt", &b"tiny\n"[..], &compiler, DEFAULT_BLOCK_SIZE).unwrap();
        transfer.on_client_ready().unwrap();

        let chunks = transfer.next_chunks().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].token, TOKEN_XFER_DATA);
        assert_eq!(chunks[0].payload[0], BlockMarker::Start.byte());
        assert_eq!(chunks[1].token, TOKEN_XFER_DONE);
        assert_eq!(transfer.state(), TransferState::Done);
    }

    #[test]
    fn large_payload_spans_multiple_blocks_within_the_burst_cap() {
        let compiler = NullFdoCompiler;
        let payload = vec![b'x'; DEFAULT_BLOCK_SIZE * 3 + 10];
        let (mut transfer, _) = Transfer::initiate(1, "big.bin", payload, &compiler, DEFAULT_BLOCK_SIZE).unwrap();
        transfer.on_client_ready().unwrap();

        let first = transfer.next_chunks().unwrap();
        // 4 data blocks total; burst cap is 8 so everything plus the
        // completion marker fits in a single call.
        assert_eq!(first.len(), 5);
        assert_eq!(transfer.state(), TransferState::Done);
    }

    #[test]
    fn next_chunks_before_go_is_rejected() {
        let compiler = NullFdoCompiler;
        let (mut transfer, _) = Transfer::initiate(1, "tiny.txt", &b"tiny\n"[..], &compiler, DEFAULT_BLOCK_SIZE).unwrap();
        assert_eq!(transfer.next_chunks(), Err(XferError::NotStreaming(TransferState::AwaitingGo)));
    }

    #[test]
    fn escape_and_unescape_round_trip_reserved_bytes() {
        let input = b"abdcde\x10end";
        let mut escaped = Vec::new();
        escape_block(input, &mut escaped);
        let restored = unescape_block(&escaped);
        assert_eq!(restored, input.to_vec());
    }

    #[test]
    fn escape_round_trips_arbitrary_bytes() {
        let input: Vec<u8> = (0u8..=255).collect();
        let mut escaped = Vec::new();
        escape_block(&input, &mut escaped);
        assert_eq!(unescape_block(&escaped), input);
    }

    #[test]
    fn socket_loss_mid_stream_marks_the_transfer_failed() {
        let compiler = NullFdoCompiler;
        let (mut transfer, _) = Transfer::initiate(1, "tiny.txt", &b"tiny\n"[..], &compiler, DEFAULT_BLOCK_SIZE).unwrap();
        transfer.on_client_ready().unwrap();
        transfer.fail();
        assert_eq!(transfer.state(), TransferState::Failed);
    }
}
