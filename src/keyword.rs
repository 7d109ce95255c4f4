// ABOUTME: Keyword command processor — registry of text-command handlers reached via the `Kk` token
// ABOUTME: Process-wide, read-mostly (§5); lookup is exact-match then prefix-before-space

use crate::connection::ConnectionState;
use crate::pacer::Pacer;
use crate::session::SessionContext;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Implemented by every keyword command. Mirrors the source interface in
/// §6: `keyword`, `description`, `handle(keyword, session, connection,
/// pacer)`. `handle` may fail with any error type the implementor prefers
/// (design note, §9) — the dispatcher is the boundary that converts that
/// into a result and never lets it reach the connection.
pub trait KeywordHandler: Send + Sync {
    /// The canonical, already-normalized keyword this handler answers to.
    fn keyword(&self) -> &str;

    fn description(&self) -> &str;

    /// Invoked with the raw command string the client sent (after
    /// trimming), the mutable session, a handle to the connection for
    /// sending, and the pacer to enqueue outbound chunks through.
    fn handle(
        &self,
        keyword: &str,
        session: &mut SessionContext,
        conn: &mut ConnectionState,
        pacer: &mut Pacer,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Outcome of dispatching one assembled keyword command.
#[derive(Debug, PartialEq, Eq)]
pub enum KeywordOutcome {
    /// Command was empty after trimming; ignored per §4.8 step 1.
    Empty,
    /// No handler matched; logged and ignored.
    NotFound,
    /// Handler ran to completion without error.
    Handled,
    /// Handler returned an error or panicked; caught, logged, connection untouched.
    HandlerFailed,
}

/// Process-wide registry of keyword handlers. Registration mutates rarely
/// (startup, or admin-time); lookups must be cheap and concurrent-safe,
/// hence the `RwLock` (§5 — no external concurrent-map dependency is
/// warranted at this scale).
#[derive(Default)]
pub struct KeywordRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn KeywordHandler>>>,
}

impl KeywordRegistry {
    pub fn new() -> Self {
        KeywordRegistry {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `handler` under its normalized keyword. A duplicate
    /// registration replaces the prior handler and logs a warning (§3).
    pub fn register(&self, handler: Arc<dyn KeywordHandler>) {
        let key = normalize(handler.keyword());
        let mut handlers = self.handlers.write().expect("keyword registry lock poisoned");
        if handlers.insert(key.clone(), handler).is_some() {
            warn!(keyword = %key, "keyword handler registration replaced an existing handler");
        }
    }

    /// Exact match on the normalized full command; if that misses and the
    /// command contains a space, fall back to the prefix before the first
    /// space (§3).
    pub fn lookup(&self, command: &str) -> Option<Arc<dyn KeywordHandler>> {
        let normalized = normalize(command);
        let handlers = self.handlers.read().expect("keyword registry lock poisoned");
        if let Some(handler) = handlers.get(&normalized) {
            return Some(Arc::clone(handler));
        }
        let prefix = normalized.split(' ').next()?;
        if prefix.len() == normalized.len() {
            return None;
        }
        handlers.get(prefix).map(Arc::clone)
    }

    /// Dispatches an assembled command string. Invariant: no handler error
    /// or panic is allowed to propagate past this call (§4.8 step 4).
    pub fn dispatch(
        &self,
        raw_command: &str,
        session: &mut SessionContext,
        conn: &mut ConnectionState,
        pacer: &mut Pacer,
    ) -> KeywordOutcome {
        let trimmed = raw_command.trim();
        if trimmed.is_empty() {
            return KeywordOutcome::Empty;
        }

        let Some(handler) = self.lookup(trimmed) else {
            debug!(command = trimmed, "no keyword handler registered");
            return KeywordOutcome::NotFound;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(trimmed, session, conn, pacer)));
        match result {
            Ok(Ok(())) => KeywordOutcome::Handled,
            Ok(Err(err)) => {
                warn!(command = trimmed, error = %err, "keyword handler returned an error");
                KeywordOutcome::HandlerFailed
            }
            Err(_) => {
                warn!(command = trimmed, "keyword handler panicked");
                KeywordOutcome::HandlerFailed
            }
        }
    }
}

/// Lowercases and trims a keyword or command string (§3).
pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Returns the first `<...>`-delimited parameter in `s`, or `None` if there
/// is no complete bracketed substring. Bracketed only — no bare-space
/// fallback (§4.8).
pub fn extract_parameter(s: &str) -> Option<&str> {
    extract_all_parameters(s).into_iter().next()
}

/// Returns every `<...>`-delimited parameter in `s`, in order.
pub fn extract_all_parameters(s: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find('<') {
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find('>') else {
            break;
        };
        params.push(&after_open[..close]);
        rest = &after_open[close + 1..];
    }
    params
}
