// ABOUTME: Connection state machine and transport-level frame I/O
// ABOUTME: `state` owns the protocol states/counters; `transport` owns the socket; `driver` runs the loop

pub mod driver;
pub mod state;
pub mod transport;

pub use driver::ConnectionDriver;
pub use state::{ConnState, ConnectionState, InboundOutcome, RetransmitOutcome, UnackedEntry};
pub use transport::Transport;
