// ABOUTME: The connection state machine — INIT/ESTABLISHED/CLOSING/CLOSED, TX/RX counters, unacked queue
// ABOUTME: Owns everything touched only on one connection's worker; never talks to the socket directly

use crate::frame::{self, Frame};
use crate::sequence::Sequence;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Frame-type bytes the state machine assigns to the control frames it
/// emits itself. These occupy the `type` field of a short control frame;
/// full data frames use whatever type the caller supplies alongside a token.
pub mod control_type {
    pub const INIT: u8 = b'I';
    pub const INIT_ACK: u8 = b'J';
    pub const HEARTBEAT: u8 = b'H';
    pub const ACK: u8 = b'A';
    pub const NAK: u8 = b'N';
}

/// Default maximum outstanding unacked data frames.
pub const DEFAULT_WINDOW: usize = 16;
/// Default retransmit interval.
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(7);
/// Default bound on retransmit attempts before giving up on a frame.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default interval of outbound silence before a heartbeat is due.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Default inbound silence before the connection is force-closed as idle.
pub const DEFAULT_IDLE_CAP: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Established,
    Closing,
    Closed,
}

/// One outbound data frame awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct UnackedEntry {
    pub tx: Sequence,
    pub raw: Vec<u8>,
    pub sent_at: Instant,
    pub retries: u32,
}

/// Outcome of feeding one inbound frame to [`ConnectionState::process_inbound`].
#[derive(Debug)]
pub enum InboundOutcome {
    /// CRC or length error: already dropped before reaching here by the caller.
    /// Frame accepted in order; dispatch its payload.
    Dispatch(Frame),
    /// A control frame was handled internally; optional reply to send.
    ControlHandled(Option<Vec<u8>>),
    /// Duplicate/retransmitted TX; re-ack, no dispatch.
    Duplicate(Vec<u8>),
    /// Out-of-order gap; NAK naming the expected sequence, no dispatch.
    Gap(Vec<u8>),
    /// Frame arrived while not in `Established` state; dropped.
    NotEstablished,
}

#[derive(Debug)]
pub enum RetransmitOutcome {
    /// Frames to resend (already-built raw bytes, sequence preserved).
    Resend(Vec<Vec<u8>>),
    /// No unacked entry was due for retransmission.
    Nothing,
    /// An entry exhausted its retry budget; the connection must close.
    Exhausted,
}

/// The per-connection protocol state machine. Exclusively owns its unacked
/// queue, counters, and (by composition, from the caller) the session
/// context. Touched only on this connection's single worker (§5).
#[derive(Debug)]
pub struct ConnectionState {
    state: ConnState,
    next_tx: Sequence,
    expected_rx: Sequence,
    last_acked_tx: Option<Sequence>,
    unacked: VecDeque<UnackedEntry>,
    window: usize,
    last_activity: Instant,
    peer_rx: Sequence,
    retransmit_interval: Duration,
    max_retries: u32,
    heartbeat_interval: Duration,
    idle_cap: Duration,
    last_outbound: Instant,
}

impl ConnectionState {
    pub fn new() -> Self {
        let now = Instant::now();
        // Placeholder sequence values until the INIT handshake resets them;
        // MIN is always in range so this never panics.
        let placeholder = Sequence::new(crate::sequence::MIN).expect("MIN is in range");
        ConnectionState {
            state: ConnState::Init,
            next_tx: placeholder,
            expected_rx: placeholder,
            last_acked_tx: None,
            unacked: VecDeque::new(),
            window: DEFAULT_WINDOW,
            last_activity: now,
            peer_rx: placeholder,
            retransmit_interval: DEFAULT_RETRANSMIT_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            idle_cap: DEFAULT_IDLE_CAP,
            last_outbound: now,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn next_tx(&self) -> Sequence {
        self.next_tx
    }

    pub fn expected_rx(&self) -> Sequence {
        self.expected_rx
    }

    /// Whether a new data frame can be assigned a TX right now (invariant 4: `|unacked| <= window`).
    ///
    /// Allowed in `Established` and also in `Closing`: a teardown token
    /// (logout ack, force-off reason) is enqueued and then the connection
    /// is marked `Closing` in the same dispatch, and §4.3 requires that
    /// queue to still drain rather than be silently stranded.
    pub fn can_send(&self) -> bool {
        matches!(self.state, ConnState::Established | ConnState::Closing) && self.unacked.len() < self.window
    }

    /// Handles a well-formed INIT frame: records peer parameters (the TX it
    /// announces becomes our `expected_rx`), resets counters, transitions to
    /// `Established`, and returns the INIT-ack bytes to send.
    pub fn handle_init(&mut self, peer_tx: Sequence, peer_rx: Sequence) -> Vec<u8> {
        self.next_tx = peer_rx;
        self.expected_rx = peer_tx.next();
        self.peer_rx = peer_rx;
        self.last_acked_tx = None;
        self.unacked.clear();
        self.state = ConnState::Established;
        self.touch_activity();
        self.build_control(control_type::INIT_ACK)
    }

    /// Inbound processing entrypoint for a frame that has already passed
    /// the frame codec (CRC/length already validated by the caller).
    pub fn process_inbound(&mut self, frame: &Frame) -> InboundOutcome {
        if self.state != ConnState::Established {
            return InboundOutcome::NotEstablished;
        }

        self.touch_activity();

        // Step 1: RX is always an implicit cumulative ack, control or not.
        if let Ok(rx) = Sequence::new(frame.rx()) {
            self.apply_ack(rx);
        }

        // Step 2: control frames never consume a TX slot.
        if frame.is_control() {
            return InboundOutcome::ControlHandled(self.handle_control(frame));
        }

        // Step 3: data frame carrying a token.
        let Ok(tx) = Sequence::new(frame.tx()) else {
            return InboundOutcome::NotEstablished;
        };

        if tx == self.expected_rx {
            self.expected_rx = self.expected_rx.next();
            InboundOutcome::Dispatch(frame.clone())
        } else if tx.is_older_than(self.expected_rx) {
            let ack = self.build_control(control_type::ACK);
            InboundOutcome::Duplicate(ack)
        } else {
            let nak = self.build_nak();
            InboundOutcome::Gap(nak)
        }
    }

    fn handle_control(&mut self, frame: &Frame) -> Option<Vec<u8>> {
        match frame.frame_type() {
            control_type::HEARTBEAT => Some(self.build_control(control_type::HEARTBEAT)),
            control_type::ACK => None, // ack already applied via RX above
            control_type::NAK => {
                let from = Sequence::new(frame.rx()).ok()?;
                let resent = self.resend_from(from);
                // Caller (pacer/connection loop) is expected to call
                // `handle_nak` for the full batch; this path only triggers
                // for a bare nak frame fed through `process_inbound`.
                if resent.is_empty() {
                    None
                } else {
                    resent.into_iter().next()
                }
            }
            _ => None,
        }
    }

    /// Requests retransmission of the in-order prefix of `unacked` starting
    /// at `from` (inclusive). Returns the raw frames to resend, in order.
    pub fn handle_nak(&mut self, from: Sequence) -> Vec<Vec<u8>> {
        self.resend_from(from)
    }

    fn resend_from(&mut self, from: Sequence) -> Vec<Vec<u8>> {
        self.unacked
            .iter_mut()
            .filter(|e| e.tx == from || from.is_older_than(e.tx))
            .map(|e| {
                e.retries += 1;
                e.sent_at = Instant::now();
                e.raw.clone()
            })
            .collect()
    }

    /// Applies an implicit or explicit cumulative ack: every unacked entry
    /// with `tx <= rx` (wrap-aware) is removed and its retransmit timer stopped.
    fn apply_ack(&mut self, rx: Sequence) {
        while let Some(front) = self.unacked.front() {
            if front.tx.is_at_or_before(rx) {
                let entry = self.unacked.pop_front().unwrap();
                self.last_acked_tx = Some(entry.tx);
            } else {
                break;
            }
        }
        self.peer_rx = rx;
    }

    /// Assigns the next TX, stamps the CRC, and appends to `unacked`.
    /// Returns `None` if the window is full (pacer must wait) or the
    /// connection is not established.
    pub fn send_data(&mut self, frame_type: u8, token: &str, payload: &[u8]) -> Option<Vec<u8>> {
        if !self.can_send() {
            return None;
        }
        let tx = self.next_tx;
        let raw = frame::build_data_frame(tx.get(), self.expected_rx.get(), frame_type, token, payload);
        self.unacked.push_back(UnackedEntry {
            tx,
            raw: raw.clone(),
            sent_at: Instant::now(),
            retries: 0,
        });
        self.next_tx = self.next_tx.next();
        self.last_outbound = Instant::now();
        Some(raw)
    }

    /// Builds and marks-sent a control frame; never consumes a TX number.
    pub fn build_control(&mut self, frame_type: u8) -> Vec<u8> {
        self.last_outbound = Instant::now();
        frame::build_control_frame(self.next_tx.get(), self.expected_rx.get(), frame_type)
    }

    fn build_nak(&mut self) -> Vec<u8> {
        // NAK carries the expected sequence in the RX field so the peer
        // knows what to resend from.
        self.build_control(control_type::NAK)
    }

    fn touch_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Checks unacked entries against the retransmit interval. The oldest
    /// due entry (and everything after it, in order) is resent; if that
    /// entry has already exhausted its retry budget the connection must
    /// transition to `Closing`.
    pub fn check_retransmit(&mut self, now: Instant) -> RetransmitOutcome {
        let Some(front) = self.unacked.front() else {
            return RetransmitOutcome::Nothing;
        };
        if now.duration_since(front.sent_at) < self.retransmit_interval {
            return RetransmitOutcome::Nothing;
        }
        if front.retries >= self.max_retries {
            self.state = ConnState::Closing;
            return RetransmitOutcome::Exhausted;
        }
        let from = front.tx;
        let resent = self.resend_from(from);
        RetransmitOutcome::Resend(resent)
    }

    /// Whether a heartbeat is due (no outbound traffic for `heartbeat_interval`).
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        self.state == ConnState::Established
            && now.duration_since(self.last_outbound) >= self.heartbeat_interval
    }

    /// Whether the connection has been silent long enough to force-close as idle.
    pub fn idle_exceeded(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) >= self.idle_cap
    }

    pub fn begin_closing(&mut self) {
        if self.state != ConnState::Closed {
            self.state = ConnState::Closing;
        }
    }

    pub fn close(&mut self) {
        self.state = ConnState::Closed;
        self.unacked.clear();
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(v: u8) -> Sequence {
        Sequence::new(v).unwrap()
    }

    #[test]
    fn init_handshake_resets_counters_and_transitions() {
        let mut conn = ConnectionState::new();
        let ack = conn.handle_init(seq(0x10), seq(0x10));
        assert_eq!(conn.state(), ConnState::Established);
        assert_eq!(conn.next_tx(), seq(0x10));
        assert_eq!(conn.expected_rx(), seq(0x11));
        assert!(!ack.is_empty());
    }

    #[test]
    fn send_data_assigns_sequential_tx_and_respects_window() {
        let mut conn = ConnectionState::new();
        conn.handle_init(seq(0x10), seq(0x10));
        for i in 0..DEFAULT_WINDOW {
            let raw = conn.send_data(b'D', "Kk", b"x").unwrap();
            let parsed = frame::parse(&raw).unwrap();
            assert_eq!(parsed.tx() as usize, 0x10 + i);
        }
        assert_eq!(conn.unacked_len(), DEFAULT_WINDOW);
        assert!(conn.send_data(b'D', "Kk", b"x").is_none());
    }

    #[test]
    fn control_frames_never_consume_tx() {
        let mut conn = ConnectionState::new();
        conn.handle_init(seq(0x10), seq(0x10));
        let before = conn.next_tx();
        conn.build_control(control_type::HEARTBEAT);
        assert_eq!(conn.next_tx(), before);
    }

    #[test]
    fn duplicate_tx_produces_no_dispatch_and_one_ack() {
        let mut conn = ConnectionState::new();
        conn.handle_init(seq(0x20), seq(0x10));
        let first_tx = conn.expected_rx();
        let raw = frame::build_data_frame(first_tx.get(), 0x10, b'D', "Kk", b"hi");
        let frame = frame::parse(&raw).unwrap();
        assert!(matches!(conn.process_inbound(&frame), InboundOutcome::Dispatch(_)));
        // Resend the exact same TX: must be treated as a duplicate.
        match conn.process_inbound(&frame) {
            InboundOutcome::Duplicate(_) => {}
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[test]
    fn gap_produces_nak_and_no_dispatch() {
        let mut conn = ConnectionState::new();
        conn.handle_init(seq(0x20), seq(0x10));
        let too_far = conn.expected_rx().next().next();
        let raw = frame::build_data_frame(too_far.get(), 0x10, b'D', "Kk", b"hi");
        let frame = frame::parse(&raw).unwrap();
        match conn.process_inbound(&frame) {
            InboundOutcome::Gap(_) => {}
            other => panic!("expected gap, got {other:?}"),
        }
    }

    #[test]
    fn implicit_ack_drains_unacked_up_to_rx() {
        let mut conn = ConnectionState::new();
        conn.handle_init(seq(0x10), seq(0x10));
        conn.send_data(b'D', "Kk", b"a").unwrap();
        conn.send_data(b'D', "Kk", b"b").unwrap();
        conn.send_data(b'D', "Kk", b"c").unwrap();
        assert_eq!(conn.unacked_len(), 3);

        let raw = frame::build_data_frame(0x30, 0x12, b'D', "Kk", b"ack-carrier");
        let inbound = frame::parse(&raw).unwrap();
        conn.process_inbound(&inbound);
        assert_eq!(conn.unacked_len(), 0);
    }

    #[test]
    fn send_data_wraps_tx_from_0x7f_back_to_0x10() {
        let mut conn = ConnectionState::new();
        // Park next_tx at the top of the ring by handing handle_init a
        // peer rx of 0x7F (next_tx := peer_rx).
        conn.handle_init(seq(0x10), seq(0x7F));
        assert_eq!(conn.next_tx(), seq(0x7F));

        let raw = conn.send_data(b'D', "Kk", b"x").unwrap();
        let parsed = frame::parse(&raw).unwrap();
        assert_eq!(parsed.tx(), 0x7F);
        assert_eq!(conn.next_tx(), seq(0x10));

        let raw = conn.send_data(b'D', "Kk", b"y").unwrap();
        let parsed = frame::parse(&raw).unwrap();
        assert_eq!(parsed.tx(), 0x10);
        assert_eq!(conn.unacked_len(), 2);
    }

    #[test]
    fn idle_and_heartbeat_thresholds_are_respected_immediately_after_activity() {
        let mut conn = ConnectionState::new();
        conn.handle_init(seq(0x10), seq(0x10));
        let now = Instant::now();
        assert!(!conn.heartbeat_due(now));
        assert!(!conn.idle_exceeded(now));
    }
}
