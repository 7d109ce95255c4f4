// ABOUTME: Token dispatcher — routes an accepted data frame's token to a core handler or delegate
// ABOUTME: Owns the reassembly hookup for `Kk` and the registry of delegated (non-core) tokens

use crate::auth::{handle_login, issue_guest, CredentialChecker, LoginOutcome};
use crate::connection::ConnectionState;
use crate::frame::{self, Frame};
use crate::keyword::{KeywordOutcome, KeywordRegistry};
use crate::pacer::{Chunk, Pacer};
use crate::session::{GuestCredentials, ReassemblyKey, SessionContext};
use crate::xfer::TOKEN_XFER_GO;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Logout: client-initiated clean teardown.
pub const TOKEN_LO: &str = "LO";
/// Clean disconnect instruction (source name: `TOKEN_DSTAR`).
pub const TOKEN_DSTAR: &str = "D*";
/// Force-off with message (source name: `TOKEN_XS`).
pub const TOKEN_XS: &str = "XS";
/// Login handshake: username/password (and optional provider hints).
pub const TOKEN_LOGIN: &str = "Lo";
/// Multi-frame keyword command.
pub const TOKEN_KEYWORD: &str = "Kk";

const FRAME_TYPE_AUTH: u8 = b'A';
const FRAME_TYPE_TEARDOWN: u8 = b'Q';

/// Implemented by handlers for tokens that are neither core-owned nor the
/// keyword path — the generic extension seam named in §4.5 ("look up an
/// installed handler for that token").
pub trait TokenHandler: Send + Sync {
    fn handle(&self, frame: &Frame, session: &mut SessionContext, conn: &mut ConnectionState, pacer: &mut Pacer);
}

/// Process-wide, read-mostly table of delegated token handlers (§5).
#[derive(Default)]
pub struct TokenHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TokenHandler>>>,
}

impl TokenHandlerRegistry {
    pub fn new() -> Self {
        TokenHandlerRegistry {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, token: impl Into<String>, handler: Arc<dyn TokenHandler>) {
        let token = token.into();
        let mut handlers = self.handlers.write().expect("token handler registry lock poisoned");
        if handlers.insert(token.clone(), handler).is_some() {
            warn!(token = %token, "token handler registration replaced an existing handler");
        }
    }

    fn lookup(&self, token: &str) -> Option<Arc<dyn TokenHandler>> {
        self.handlers.read().expect("token handler registry lock poisoned").get(token).cloned()
    }
}

/// Outcome of dispatching one accepted frame, for the connection loop to
/// act on (close the socket, etc).
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Client logged out cleanly (`LO`); connection should enter `Closing`.
    LoggedOut,
    /// Clean-disconnect instruction (`D*`); connection should enter `Closing`.
    CleanDisconnect,
    /// Force-off with a message (`XS`, or a failed login); connection should
    /// enter `Closing` after the message frame is flushed.
    ForcedOff { reason: String },
    /// Login succeeded.
    AuthSucceeded { display_name: String },
    /// Login failed; caller should force-off.
    AuthFailed { reason: String },
    /// `xG` advanced a transfer from `AwaitingGo` to `Streaming`.
    XferReady { transfer_id: u32 },
    /// Keyword command dispatched (or ignored/not-found) without error.
    Keyword(KeywordOutcome),
    /// Delegated to an installed token handler.
    Delegated,
    /// No token, or no handler for it; dropped.
    Discarded,
}

/// Wires together the process-wide, read-mostly services a dispatch needs:
/// the keyword registry, the credential checker, and the delegated-token
/// handler table (§4.5, §4.6).
pub struct TokenDispatcher {
    keywords: Arc<KeywordRegistry>,
    credentials: Arc<dyn CredentialChecker>,
    delegated: Arc<TokenHandlerRegistry>,
    allow_guests: bool,
}

impl TokenDispatcher {
    pub fn new(
        keywords: Arc<KeywordRegistry>,
        credentials: Arc<dyn CredentialChecker>,
        delegated: Arc<TokenHandlerRegistry>,
        allow_guests: bool,
    ) -> Self {
        TokenDispatcher {
            keywords,
            credentials,
            delegated,
            allow_guests,
        }
    }

    /// Dispatches one already-accepted data frame (§4.5).
    pub fn dispatch(
        &self,
        frame: &Frame,
        session: &mut SessionContext,
        conn: &mut ConnectionState,
        pacer: &mut Pacer,
    ) -> DispatchOutcome {
        let Some(token) = frame::extract_token(frame) else {
            debug!("data frame carried no extractable token; discarding");
            return DispatchOutcome::Discarded;
        };

        match token.as_str() {
            TOKEN_LO => self.handle_logout(conn, pacer),
            TOKEN_DSTAR => self.handle_clean_disconnect(conn, pacer),
            TOKEN_XS => self.handle_forced_off(frame, conn, pacer),
            TOKEN_LOGIN => self.handle_login_token(frame, session, conn, pacer),
            TOKEN_XFER_GO => self.handle_xfer_go(session),
            TOKEN_KEYWORD => self.handle_keyword_token(frame, session, conn, pacer),
            _ => {
                if let Some(handler) = self.delegated.lookup(&token) {
                    handler.handle(frame, session, conn, pacer);
                    DispatchOutcome::Delegated
                } else {
                    debug!(token, "no handler registered for token");
                    DispatchOutcome::Discarded
                }
            }
        }
    }

    fn handle_logout(&self, conn: &mut ConnectionState, pacer: &mut Pacer) -> DispatchOutcome {
        // The goodbye is ordinary outbound traffic (an empty-payload `LO`
        // data frame), so it goes through the pacer like everything else
        // rather than being built and sent directly here.
        let _ = pacer.enqueue([Chunk::new(TOKEN_LO, FRAME_TYPE_TEARDOWN, &b""[..])]);
        conn.begin_closing();
        DispatchOutcome::LoggedOut
    }

    fn handle_clean_disconnect(&self, conn: &mut ConnectionState, _pacer: &mut Pacer) -> DispatchOutcome {
        conn.begin_closing();
        DispatchOutcome::CleanDisconnect
    }

    fn handle_forced_off(&self, frame: &Frame, conn: &mut ConnectionState, _pacer: &mut Pacer) -> DispatchOutcome {
        let reason = String::from_utf8_lossy(&frame.payload()[2..]).into_owned();
        conn.begin_closing();
        DispatchOutcome::ForcedOff { reason }
    }

    /// Login payload layout (after the `Lo` token): a NUL-separated
    /// `username\0password`. No upstream documentation pins this down to
    /// the bit; this is the simplest framing consistent with the §4.6
    /// validation steps (length checks, then case-insensitive username
    /// lookup, case-sensitive password compare).
    fn handle_login_token(
        &self,
        frame: &Frame,
        session: &mut SessionContext,
        conn: &mut ConnectionState,
        pacer: &mut Pacer,
    ) -> DispatchOutcome {
        let body = &frame.payload()[2..];
        let mut parts = body.splitn(2, |&b| b == 0);
        let username = parts.next().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
        let password = parts.next().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();

        match handle_login(self.credentials.as_ref(), &username, &password) {
            LoginOutcome::Success { display_name } => {
                session.mark_authenticated(display_name.clone());
                // The real post-login screen render is an FDO stream built
                // outside the core (§1 non-goals); here we just enqueue a
                // plain acknowledgement through the pacer like any other
                // outbound chunk.
                let _ = pacer.enqueue([Chunk::new(TOKEN_LOGIN, FRAME_TYPE_AUTH, &b"OK"[..])]);
                DispatchOutcome::AuthSucceeded { display_name }
            }
            LoginOutcome::Failure { reason } => {
                if self.allow_guests {
                    let mut rng = rand::thread_rng();
                    let (screenname, password) = issue_guest(&mut rng, conn.next_tx().get() as u32, 14);
                    session.mark_guest(GuestCredentials { screenname: screenname.clone(), password });
                    let _ = pacer.enqueue([Chunk::new(TOKEN_LOGIN, FRAME_TYPE_AUTH, &b"OK"[..])]);
                    return DispatchOutcome::AuthSucceeded { display_name: screenname };
                }
                // §4.6 step 4 / §7: authentication failure sends an
                // explicit force-off frame carrying the reason before the
                // socket closes, rather than closing silently.
                let _ = pacer.enqueue([Chunk::new(TOKEN_XS, FRAME_TYPE_TEARDOWN, reason.clone().into_bytes())]);
                conn.begin_closing();
                DispatchOutcome::AuthFailed { reason }
            }
        }
    }

    fn handle_xfer_go(&self, session: &mut SessionContext) -> DispatchOutcome {
        // The client doesn't echo a transfer ID on `xG` in this protocol
        // generation; route to the oldest transfer still awaiting it.
        let ids: Vec<u32> = session.transfer_ids().collect();
        for id in ids {
            if let Some(transfer) = session.transfer_mut(id) {
                if transfer.on_client_ready().is_ok() {
                    return DispatchOutcome::XferReady { transfer_id: id };
                }
            }
        }
        DispatchOutcome::Discarded
    }

    fn handle_keyword_token(
        &self,
        frame: &Frame,
        session: &mut SessionContext,
        conn: &mut ConnectionState,
        pacer: &mut Pacer,
    ) -> DispatchOutcome {
        let payload = frame.payload();
        let stream_bytes = frame::stream_id_byte_count(TOKEN_KEYWORD);
        if payload.len() < 2 + stream_bytes + 1 {
            warn!("Kk payload too short to carry stream id and continuation flag");
            return DispatchOutcome::Discarded;
        }
        let body = &payload[2..];
        let stream_id = read_stream_id(&body[..stream_bytes]);
        let is_final = body[stream_bytes] != 0;
        let text = &body[stream_bytes + 1..];

        let key = ReassemblyKey {
            token: TOKEN_KEYWORD.to_string(),
            stream_id,
        };
        if session.append_reassembly(key.clone(), text).is_err() {
            warn!(stream_id, "Kk reassembly buffer exceeded its bound; dropping");
            return DispatchOutcome::Discarded;
        }
        if !is_final {
            return DispatchOutcome::Discarded;
        }

        let Some(assembled) = session.take_reassembly(&key) else {
            return DispatchOutcome::Discarded;
        };
        let command = String::from_utf8_lossy(&assembled).into_owned();
        let outcome = self.keywords.dispatch(&command, session, conn, pacer);
        DispatchOutcome::Keyword(outcome)
    }
}

fn read_stream_id(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf[..bytes.len()].copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}
