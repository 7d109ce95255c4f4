// ABOUTME: TCP frame I/O — buffers inbound bytes and hands whole frames to the caller
// ABOUTME: A `BufWriter<TcpStream>` plus a growable read buffer for reassembling frames off the wire

use crate::frame::{self, FrameError};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/// Errors surfaced by the transport. Framing errors that the protocol
/// itself tolerates (bad CRC, sequence gaps) never appear here — those are
/// decided by [`crate::connection::ConnectionState`] once a frame has
/// already been lifted off the wire. This enum is for the cases where the
/// byte stream itself cannot be trusted to contain frames anymore.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection mid-frame")]
    ClosedMidFrame,

    #[error("buffer does not start with the P3 magic byte; stream is desynchronized")]
    Desynchronized,
}

/// Owns the TCP socket and the read buffer for one connection. Frame
/// boundaries are found with [`frame::frame_len`], which looks only at the
/// declared length field (§4.1) — no CRC check happens here.
#[derive(Debug)]
pub struct Transport {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Transport {
    pub fn new(socket: TcpStream) -> Self {
        Transport {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Reads and returns the next complete frame's raw bytes, or `None` on
    /// a clean peer shutdown. Data left over after a frame boundary stays
    /// buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            if let Some(raw) = self.take_buffered_frame()? {
                return Ok(Some(raw));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(TransportError::ClosedMidFrame)
                };
            }
        }
    }

    fn take_buffered_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match frame::frame_len(&self.buffer) {
            Ok(Some(len)) => {
                let raw = self.buffer.split_to(len).to_vec();
                Ok(Some(raw))
            }
            Ok(None) => Ok(None),
            Err(FrameError::NotAFrame) => Err(TransportError::Desynchronized),
            Err(other) => unreachable!("frame_len only returns NotAFrame as an error variant: {other}"),
        }
    }

    /// Writes already-framed bytes (built by [`frame::build_data_frame`] or
    /// [`frame::build_control_frame`]) straight to the socket and flushes.
    pub async fn write_raw(&mut self, raw: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(raw).await?;
        self.stream.flush().await
    }
}
