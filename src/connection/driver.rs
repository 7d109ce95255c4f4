// ABOUTME: Per-connection event loop — wires transport, state machine, pacer, and dispatcher together
// ABOUTME: Everything here runs on one task; no intra-connection parallelism (§5)

use crate::connection::state::RetransmitOutcome;
use crate::connection::transport::{Transport, TransportError};
use crate::connection::{ConnState, ConnectionState, InboundOutcome};
use crate::dispatcher::{DispatchOutcome, TokenDispatcher};
use crate::frame::{self, FrameError};
use crate::pacer::Pacer;
use crate::sequence::Sequence;
use crate::session::SessionContext;
use crate::xfer::TransferState;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// How often the driver wakes up on its own (independent of inbound
/// traffic) to check retransmit/heartbeat/idle timers and release pending
/// pacer chunks.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Drives one connection end to end: reads frames off the transport, feeds
/// them through the state machine and dispatcher, and periodically ticks
/// the pacer and the connection's timers. Owns everything touched only by
/// this connection (§5) — the transport, the state machine, the session,
/// and the pacer.
pub struct ConnectionDriver {
    transport: Transport,
    conn: ConnectionState,
    session: SessionContext,
    pacer: Pacer,
    dispatcher: TokenDispatcher,
    packet_delay: Duration,
}

impl ConnectionDriver {
    pub fn new(transport: Transport, session_id: u64, burst_cap: usize, dispatcher: TokenDispatcher) -> Self {
        Self::with_packet_delay(transport, session_id, burst_cap, dispatcher, Duration::ZERO)
    }

    /// Like [`ConnectionDriver::new`], but with `packet.delay.ms` (§6)
    /// applied before every outbound frame — an artificial per-frame delay
    /// for throttled interop testing. Zero (the default) sends as fast as
    /// the window and burst cap allow.
    pub fn with_packet_delay(
        transport: Transport,
        session_id: u64,
        burst_cap: usize,
        dispatcher: TokenDispatcher,
        packet_delay: Duration,
    ) -> Self {
        ConnectionDriver {
            transport,
            conn: ConnectionState::new(),
            session: SessionContext::new(session_id),
            pacer: Pacer::new(burst_cap),
            dispatcher,
            packet_delay,
        }
    }

    /// Runs the connection until it closes, either because the peer hung
    /// up, a fatal timer fired, or a teardown token was honored.
    pub async fn run(mut self) {
        let mut ticker = interval(TICK_INTERVAL);
        loop {
            if self.conn.state() == ConnState::Closed {
                break;
            }
            tokio::select! {
                frame_result = self.transport.read_frame() => {
                    match frame_result {
                        Ok(Some(raw)) => {
                            if !self.handle_raw_frame(&raw).await {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!("peer closed the connection");
                            break;
                        }
                        Err(TransportError::ClosedMidFrame) | Err(TransportError::Desynchronized) => {
                            warn!("transport error; closing connection");
                            break;
                        }
                        Err(TransportError::Io(err)) => {
                            warn!(error = %err, "I/O error reading frame");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !self.on_tick().await {
                        break;
                    }
                }
            }
        }
        self.session.teardown();
        self.pacer.close();
        self.conn.close();
    }

    /// Parses and processes one raw frame. Returns `false` if the
    /// connection should close.
    async fn handle_raw_frame(&mut self, raw: &[u8]) -> bool {
        let frame = match frame::parse(raw) {
            Ok(frame) => frame,
            Err(FrameError::BadCrc) => {
                // §4.3 step 1: drop silently, rely on sender timeout. No
                // NAK for a CRC error.
                debug!("dropped frame with bad CRC");
                return true;
            }
            Err(err) => {
                debug!(error = %err, "dropped unparseable frame");
                return true;
            }
        };

        if self.conn.state() == ConnState::Init {
            return self.handle_init_frame(&frame).await;
        }

        match self.conn.process_inbound(&frame) {
            InboundOutcome::Dispatch(frame) => {
                let outcome = self.dispatcher.dispatch(&frame, &mut self.session, &mut self.conn, &mut self.pacer);
                self.act_on_dispatch(outcome);
            }
            InboundOutcome::ControlHandled(Some(reply)) => {
                if self.transport.write_raw(&reply).await.is_err() {
                    return false;
                }
            }
            InboundOutcome::ControlHandled(None) => {}
            InboundOutcome::Duplicate(ack) => {
                if self.transport.write_raw(&ack).await.is_err() {
                    return false;
                }
            }
            InboundOutcome::Gap(nak) => {
                if self.transport.write_raw(&nak).await.is_err() {
                    return false;
                }
            }
            InboundOutcome::NotEstablished => {
                debug!("dropped frame received outside Established state");
            }
        }

        self.flush_pacer().await
    }

    async fn handle_init_frame(&mut self, frame: &crate::frame::Frame) -> bool {
        let Ok(peer_tx) = Sequence::new(frame.tx()) else {
            warn!("INIT frame carried an out-of-range TX; dropping");
            return true;
        };
        let Ok(peer_rx) = Sequence::new(frame.rx()) else {
            warn!("INIT frame carried an out-of-range RX; dropping");
            return true;
        };
        let ack = self.conn.handle_init(peer_tx, peer_rx);
        info!("connection established via INIT handshake");
        self.transport.write_raw(&ack).await.is_ok()
    }

    fn act_on_dispatch(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::LoggedOut | DispatchOutcome::CleanDisconnect => {
                info!("connection entering Closing after teardown token");
            }
            DispatchOutcome::ForcedOff { reason } | DispatchOutcome::AuthFailed { reason } => {
                info!(reason, "connection forced off");
            }
            DispatchOutcome::AuthSucceeded { display_name } => {
                info!(display_name, "session authenticated");
            }
            DispatchOutcome::XferReady { transfer_id } => {
                debug!(transfer_id, "transfer advanced to streaming");
                self.pump_transfer(transfer_id);
            }
            DispatchOutcome::Keyword(_) | DispatchOutcome::Delegated | DispatchOutcome::Discarded => {}
        }
    }

    /// Draws one burst's worth of data-phase chunks out of `transfer_id` (if
    /// it's currently `Streaming`) and enqueues them. A transfer whose
    /// payload outlives a single burst is left `Streaming` and is drained
    /// further on subsequent calls (from `on_tick`) until it reaches `Done`,
    /// at which point the registry releases it (§4.7 steps 4-5).
    fn pump_transfer(&mut self, transfer_id: u32) {
        let Some(transfer) = self.session.transfer_mut(transfer_id) else {
            return;
        };
        if transfer.state() != TransferState::Streaming {
            return;
        }
        let Ok(chunks) = transfer.next_chunks() else {
            return;
        };
        let done = transfer.state() == TransferState::Done;
        let _ = self.pacer.enqueue(chunks);
        if done {
            self.session.remove_transfer(transfer_id);
        }
    }

    /// Pumps every transfer still `Streaming`, one burst each, so a payload
    /// spanning more than one burst keeps moving tick over tick instead of
    /// stalling after the first call from `act_on_dispatch` (§4.7 step 4).
    fn pump_streaming_transfers(&mut self) {
        let ids: Vec<u32> = self.session.transfer_ids().collect();
        for id in ids {
            self.pump_transfer(id);
        }
    }

    /// Releases whatever the pacer will allow this tick and writes it out.
    /// Returns `false` if a write failed and the connection should close.
    async fn flush_pacer(&mut self) -> bool {
        let released = self.pacer.release(&mut self.conn);
        for (i, raw) in released.into_iter().enumerate() {
            if i > 0 && !self.packet_delay.is_zero() {
                tokio::time::sleep(self.packet_delay).await;
            }
            if self.transport.write_raw(&raw).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Periodic housekeeping: retransmits, heartbeats, idle disconnect, and
    /// giving the pacer another chance to drain (§4.3 timers).
    async fn on_tick(&mut self) -> bool {
        if self.conn.state() != ConnState::Established {
            if self.conn.state() == ConnState::Closing {
                // Best-effort drain, then close once nothing is left to send
                // (§4.3 CLOSING state).
                let flushed_ok = self.flush_pacer().await;
                return flushed_ok && self.pacer.pending_len() > 0;
            }
            return true;
        }

        let now = std::time::Instant::now();
        match self.conn.check_retransmit(now) {
            RetransmitOutcome::Resend(frames) => {
                for raw in frames {
                    if self.transport.write_raw(&raw).await.is_err() {
                        return false;
                    }
                }
            }
            RetransmitOutcome::Exhausted => {
                warn!("retransmit attempts exhausted; closing connection");
                return false;
            }
            RetransmitOutcome::Nothing => {}
        }

        if self.conn.heartbeat_due(now) {
            let hb = self.conn.build_control(crate::connection::state::control_type::HEARTBEAT);
            if self.transport.write_raw(&hb).await.is_err() {
                return false;
            }
        }

        if self.conn.idle_exceeded(now) {
            warn!("connection idle too long; forcing close");
            return false;
        }

        self.pump_streaming_transfers();
        self.flush_pacer().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::TokenHandlerRegistry;
    use crate::keyword::KeywordRegistry;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    fn test_dispatcher() -> TokenDispatcher {
        TokenDispatcher::new(
            Arc::new(KeywordRegistry::new()),
            Arc::new(crate::auth::StaticCredentialChecker::new()),
            Arc::new(TokenHandlerRegistry::new()),
            false,
        )
    }

    #[tokio::test]
    async fn packet_delay_spaces_out_a_burst_of_outbound_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let delay = Duration::from_millis(20);
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let transport = Transport::new(socket);
            let mut driver = ConnectionDriver::with_packet_delay(transport, 1, 10, test_dispatcher(), delay);
            driver.conn.handle_init(Sequence::new(0x10).unwrap(), Sequence::new(0x10).unwrap());
            driver
                .pacer
                .enqueue((0..3).map(|_| crate::pacer::Chunk::new("Kk", b'D', &b"x"[..])))
                .unwrap();
            let start = std::time::Instant::now();
            driver.flush_pacer().await;
            start.elapsed()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 256];
        // Drain whatever the server sends; we only care about its own timing.
        let _ = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await;

        let elapsed = server.await.unwrap();
        // Three frames with delay applied between (not before) each: >= 2 * delay.
        assert!(elapsed >= delay * 2, "expected at least {:?} between 3 frames, got {:?}", delay * 2, elapsed);
    }

    #[tokio::test]
    async fn zero_packet_delay_does_not_add_artificial_spacing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let transport = Transport::new(socket);
            let mut driver = ConnectionDriver::new(transport, 1, 10, test_dispatcher());
            driver.conn.handle_init(Sequence::new(0x10).unwrap(), Sequence::new(0x10).unwrap());
            driver
                .pacer
                .enqueue((0..3).map(|_| crate::pacer::Chunk::new("Kk", b'D', &b"x"[..])))
                .unwrap();
            let start = std::time::Instant::now();
            driver.flush_pacer().await;
            start.elapsed()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 256];
        let _ = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await;

        let elapsed = server.await.unwrap();
        assert!(elapsed < Duration::from_millis(20), "expected no artificial delay, got {elapsed:?}");
    }

    #[tokio::test]
    async fn streaming_transfer_spanning_multiple_bursts_completes_across_ticks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let transport = Transport::new(socket);
            let mut driver = ConnectionDriver::new(transport, 1, 10, test_dispatcher());
            driver.conn.handle_init(Sequence::new(0x10).unwrap(), Sequence::new(0x10).unwrap());

            // 20 blocks at the default 512-byte block size; the burst cap
            // of 8 means a single `pump_transfer` call cannot finish it.
            let compiler = crate::fdo::NullFdoCompiler;
            let payload = vec![b'x'; crate::xfer::DEFAULT_BLOCK_SIZE * 20];
            let (mut transfer, _prelude) = crate::xfer::Transfer::initiate(
                1,
                "big.bin",
                payload,
                &compiler,
                crate::xfer::DEFAULT_BLOCK_SIZE,
            )
            .unwrap();
            transfer.on_client_ready().unwrap();
            let id = driver.session.register_transfer(transfer);

            driver.pump_transfer(id);
            assert!(
                driver.session.transfer_mut(id).is_some(),
                "one burst of 8 blocks should not finish a 20-block transfer"
            );

            // Two more pumps (as `on_tick` would issue) drain the rest.
            driver.pump_transfer(id);
            driver.pump_transfer(id);

            assert!(
                driver.session.transfer_mut(id).is_none(),
                "transfer should be released from the registry once it reaches Done"
            );
            driver.pacer.pending_len()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 8192];
        let _ = tokio::time::timeout(Duration::from_millis(200), client.read(&mut buf)).await;

        // 20 data chunks plus one completion chunk, none of it released yet.
        let pending = server.await.unwrap();
        assert_eq!(pending, 21);
    }
}
