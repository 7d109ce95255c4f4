// ABOUTME: P3 wire frame codec — parse/emit, CRC stamping, token extraction
// ABOUTME: Pure functions over byte buffers; no I/O, no state, nothing here talks to a socket

//! The P3 frame codec.
//!
//! ## Wire layout
//!
//! ```text
//! offset  0        magic byte (fixed)
//! offset  1..=2    CRC-16, big-endian
//! offset  3..=4    payload length, big-endian (length of the payload field only)
//! offset  5        TX sequence
//! offset  6        RX sequence
//! offset  7        frame type
//! offset  8..      payload (payload length bytes)
//! optional last byte: 0x0D trailer
//! ```
//!
//! `raw.len() == HEADER_LEN + payload_len` or `HEADER_LEN + payload_len + 1`
//! when a trailing `0x0D` is present. The header is 8 bytes, not 6, to keep
//! the CRC-16 and 16-bit length fields each their full two bytes (see
//! DESIGN.md for the reconciliation of this with an inconsistent shorthand
//! seen elsewhere in the protocol's documentation).

use crate::crc;

/// Fixed magic byte that opens every P3 frame on the wire.
pub const MAGIC: u8 = 0x5A;

/// Optional trailing byte tolerated on ingress, never emitted on egress.
pub const TRAILER: u8 = 0x0D;

/// Bytes in the fixed header: magic(1) + crc(2) + length(2) + tx(1) + rx(1) + type(1).
pub const HEADER_LEN: usize = 8;

/// Declared payload length of a short control frame (heartbeat/ack/nak/INIT).
pub const CONTROL_PAYLOAD_LEN: u16 = 3;

/// Synthetic token returned by [`extract_token`] for short control frames.
pub const CONTROL_TOKEN: &str = "9B";

/// Errors produced while parsing a raw buffer into a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("buffer does not start with the P3 magic byte")]
    NotAFrame,
    #[error("buffer is too short to contain a full frame header")]
    TooShort,
    #[error("declared payload length does not match the buffer length")]
    LengthMismatch,
    #[error("CRC in the frame header does not match the recomputed CRC")]
    BadCrc,
}

/// A parsed, immutable P3 frame. Once constructed it is read-only; it is
/// discarded after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    raw: Vec<u8>,
    tx: u8,
    rx: u8,
    frame_type: u8,
    payload_len: u16,
    crc_valid: bool,
}

impl Frame {
    /// Raw wire bytes of this frame, including any trailing `0x0D`.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The TX sequence byte carried in the header (status only for control frames).
    pub fn tx(&self) -> u8 {
        self.tx
    }

    /// The RX sequence byte carried in the header (implicit cumulative ack).
    pub fn rx(&self) -> u8 {
        self.rx
    }

    /// The frame type byte at offset 7.
    pub fn frame_type(&self) -> u8 {
        self.frame_type
    }

    /// Declared length of the payload field.
    pub fn payload_len(&self) -> u16 {
        self.payload_len
    }

    /// Whether the CRC in the header matched a fresh recomputation at parse time.
    pub fn crc_valid(&self) -> bool {
        self.crc_valid
    }

    /// True if this is a short control frame (payload length 3, no token).
    pub fn is_control(&self) -> bool {
        self.payload_len == CONTROL_PAYLOAD_LEN
    }

    /// The payload bytes (excludes header and any trailing `0x0D`).
    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_LEN..HEADER_LEN + self.payload_len as usize]
    }

    fn has_trailer(&self) -> bool {
        self.raw.len() == HEADER_LEN + self.payload_len as usize + 1
    }
}

/// Checks whether `buf` contains at least one complete frame and, if so,
/// returns the number of bytes that frame occupies (including any trailing
/// `0x0D`). Used by the inbound byte-stream boundary detector to decide how
/// much of the buffer to hand to [`parse`].
///
/// Boundaries are determined solely by the declared length field.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != MAGIC {
        return Err(FrameError::NotAFrame);
    }
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let payload_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let without_trailer = HEADER_LEN + payload_len;
    if buf.len() < without_trailer {
        return Ok(None);
    }
    // A trailing 0x0D is optional; if the byte right after the declared
    // frame body is 0x0D, treat it as consumed by this frame. Otherwise the
    // frame ends exactly at the declared length.
    if buf.len() > without_trailer && buf[without_trailer] == TRAILER {
        Ok(Some(without_trailer + 1))
    } else {
        Ok(Some(without_trailer))
    }
}

/// Parses a single complete frame from `raw`. `raw` must be exactly the
/// bytes of one frame (use [`frame_len`] to find that boundary in a stream).
pub fn parse(raw: &[u8]) -> Result<Frame, FrameError> {
    if raw.is_empty() {
        return Err(FrameError::TooShort);
    }
    if raw[0] != MAGIC {
        return Err(FrameError::NotAFrame);
    }
    if raw.len() < HEADER_LEN {
        return Err(FrameError::TooShort);
    }

    let wire_crc = u16::from_be_bytes([raw[1], raw[2]]);
    let payload_len = u16::from_be_bytes([raw[3], raw[4]]);
    let tx = raw[5];
    let rx = raw[6];
    let frame_type = raw[7];

    let has_trailer = raw.last() == Some(&TRAILER) && raw.len() == HEADER_LEN + payload_len as usize + 1;
    let declared_total = HEADER_LEN + payload_len as usize + usize::from(has_trailer);
    if raw.len() != declared_total {
        return Err(FrameError::LengthMismatch);
    }

    let crc_end = raw.len() - usize::from(has_trailer);
    let computed_crc = crc::checksum(&raw[3..crc_end]);
    let crc_valid = computed_crc == wire_crc;
    if !crc_valid {
        return Err(FrameError::BadCrc);
    }

    Ok(Frame {
        raw: raw.to_vec(),
        tx,
        rx,
        frame_type,
        payload_len,
        crc_valid,
    })
}

/// Recomputes and writes the CRC into a frame buffer still under
/// construction. Must be called after any mutation to the buffer and before
/// it is transmitted.
pub fn stamp_crc(buf: &mut [u8]) {
    let has_trailer = buf.last() == Some(&TRAILER);
    let crc_end = buf.len() - usize::from(has_trailer);
    let crc = crc::checksum(&buf[3..crc_end]);
    let bytes = crc.to_be_bytes();
    buf[1] = bytes[0];
    buf[2] = bytes[1];
}

/// Builds a raw data-frame buffer carrying `token` and `payload` at the
/// given TX/RX/type, with the CRC already stamped. Never emits a trailing
/// `0x0D` (trailer tolerance only applies to parsing inbound frames).
pub fn build_data_frame(tx: u8, rx: u8, frame_type: u8, token: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(token.len(), 2, "tokens are exactly two ASCII bytes");
    let payload_len = (token.len() + payload.len()) as u16;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload_len as usize);
    buf.push(MAGIC);
    buf.extend_from_slice(&[0, 0]); // CRC placeholder
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.push(tx);
    buf.push(rx);
    buf.push(frame_type);
    buf.extend_from_slice(token.as_bytes());
    buf.extend_from_slice(payload);
    stamp_crc(&mut buf);
    buf
}

/// Builds a short control frame (heartbeat/ack/nak/INIT-ack): payload length
/// 3, no token, three reserved/zero payload bytes.
pub fn build_control_frame(tx: u8, rx: u8, frame_type: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + CONTROL_PAYLOAD_LEN as usize);
    buf.push(MAGIC);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&CONTROL_PAYLOAD_LEN.to_be_bytes());
    buf.push(tx);
    buf.push(rx);
    buf.push(frame_type);
    buf.extend_from_slice(&[0, 0, 0]);
    stamp_crc(&mut buf);
    buf
}

/// Extracts the token naming the application operation, per the rules in
/// §4.1: the synthetic `"9B"` for a short control frame, or the two
/// printable ASCII bytes at the start of the payload, or `None`.
pub fn extract_token(frame: &Frame) -> Option<String> {
    if frame.is_control() {
        return Some(CONTROL_TOKEN.to_string());
    }
    let payload = frame.payload();
    if payload.len() < 2 {
        return None;
    }
    let candidate = &payload[0..2];
    if candidate.iter().all(|&b| b.is_ascii_graphic()) {
        Some(String::from_utf8_lossy(candidate).into_owned())
    } else {
        None
    }
}

/// The number of stream-identifier bytes prepended to a token's payload, a
/// function of the letter case of its two characters (§4.4).
///
/// | first | second | bytes |
/// |-------|--------|-------|
/// | upper | upper  | 2     |
/// | upper | lower  | 3     |
/// | lower | upper  | 0     |
/// | lower | lower  | 4     |
pub fn stream_id_byte_count(token: &str) -> usize {
    let mut chars = token.chars();
    let (Some(first), Some(second)) = (chars.next(), chars.next()) else {
        return 0;
    };
    match (first.is_ascii_uppercase(), second.is_ascii_uppercase()) {
        (true, true) => 2,
        (true, false) => 3,
        (false, true) => 0,
        (false, false) => 4,
    }
}
