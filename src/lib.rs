// ABOUTME: Dialtone — a P3 wire-protocol server: framing, sequencing, and flow control
// ABOUTME: Built leaves-first per the component list below; see DESIGN.md for the grounding ledger

//! Dialtone speaks a legacy client/server wire protocol ("P3") over raw
//! TCP. It recovers reliable ordered delivery on top of TCP with a
//! CRC-protected, sequence-numbered frame format, dispatches decoded
//! application tokens to handlers, and paces outbound FDO/XFER artifacts
//! under the protocol's sliding window.
//!
//! Modules are organized leaves-first, matching the system overview:
//!
//! 1. [`frame`] — the wire codec (parse/emit/CRC/token extraction), pure.
//! 2. [`crc`] — the CRC-16 engine the codec uses.
//! 3. [`sequence`] — wrap-aware TX/RX arithmetic.
//! 4. [`connection`] — the state machine, transport I/O, and the
//!    per-connection event loop that drives both.
//! 5. [`pacer`] — the outbound chunker/pacer.
//! 6. [`session`] — per-connection mutable session context.
//! 7. [`auth`] — the credential-checker seam and login handshake.
//! 8. [`xfer`] — the file-transfer sub-protocol.
//! 9. [`keyword`] — the keyword command processor.
//! 10. [`dispatcher`] — routes tokens to the above.
//! 11. [`fdo`] — the external form-compiler seam (opaque to the core).
//! 12. [`config`] — process-wide configuration loading.
//! 13. [`listener`] — the TCP accept loop that wires it all together.

pub mod auth;
pub mod config;
pub mod connection;
pub mod crc;
pub mod dispatcher;
pub mod error;
pub mod fdo;
pub mod frame;
pub mod keyword;
pub mod listener;
pub mod pacer;
pub mod sequence;
pub mod session;
pub mod xfer;

pub use error::{Error, Result};
