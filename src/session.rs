// ABOUTME: Per-connection mutable session context — identity, auth state, reassembly, transfers
// ABOUTME: Owned exclusively by the connection worker that handles this session (§5)

use crate::xfer::Transfer;
use std::collections::HashMap;

/// Upper bound on a single reassembly buffer, to keep a misbehaving or
/// malicious peer from growing a multi-frame payload without bound (§4.5).
pub const MAX_REASSEMBLY_BYTES: usize = 256 * 1024;

/// Identifies one in-flight multi-frame reassembly: the token that opened
/// it plus the stream identifier carried alongside that token (§4.4, §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub token: String,
    pub stream_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("reassembly buffer exceeded {MAX_REASSEMBLY_BYTES} bytes")]
    TooLarge,
}

/// Credentials generated for an ephemeral guest session. Live only as long
/// as the session (§4.6); cleared on teardown.
#[derive(Debug, Clone)]
pub struct GuestCredentials {
    pub screenname: String,
    pub password: String,
}

/// Per-connection session state: identity, auth, reassembly buffers, and
/// the registry of transfers attached to this connection (§3).
#[derive(Debug)]
pub struct SessionContext {
    session_id: u64,
    display_name: Option<String>,
    authenticated: bool,
    ephemeral_guest: bool,
    guest_credentials: Option<GuestCredentials>,
    reassembly: HashMap<ReassemblyKey, Vec<u8>>,
    transfers: HashMap<u32, Transfer>,
    next_transfer_id: u32,
}

impl SessionContext {
    pub fn new(session_id: u64) -> Self {
        SessionContext {
            session_id,
            display_name: None,
            authenticated: false,
            ephemeral_guest: false,
            guest_credentials: None,
            reassembly: HashMap::new(),
            transfers: HashMap::new(),
            next_transfer_id: 1,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_ephemeral_guest(&self) -> bool {
        self.ephemeral_guest
    }

    /// Marks the session authenticated under a real, checked identity.
    pub fn mark_authenticated(&mut self, display_name: impl Into<String>) {
        self.display_name = Some(display_name.into());
        self.authenticated = true;
        self.ephemeral_guest = false;
    }

    /// Marks the session authenticated as an ephemeral guest, stashing the
    /// generated credentials transiently (§4.6).
    pub fn mark_guest(&mut self, credentials: GuestCredentials) {
        self.display_name = Some(credentials.screenname.clone());
        self.authenticated = true;
        self.ephemeral_guest = true;
        self.guest_credentials = Some(credentials);
    }

    pub fn guest_credentials(&self) -> Option<&GuestCredentials> {
        self.guest_credentials.as_ref()
    }

    /// Appends `bytes` to the reassembly buffer identified by `key`,
    /// creating it if absent. Returns an error (without losing already
    /// buffered data — the caller should drop the whole buffer on error)
    /// if the accumulated size would exceed [`MAX_REASSEMBLY_BYTES`].
    pub fn append_reassembly(&mut self, key: ReassemblyKey, bytes: &[u8]) -> Result<(), ReassemblyError> {
        let buf = self.reassembly.entry(key.clone()).or_default();
        if buf.len() + bytes.len() > MAX_REASSEMBLY_BYTES {
            self.reassembly.remove(&key);
            return Err(ReassemblyError::TooLarge);
        }
        buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Removes and returns a completed reassembly buffer (called once the
    /// token-specific end-of-stream marker arrives).
    pub fn take_reassembly(&mut self, key: &ReassemblyKey) -> Option<Vec<u8>> {
        self.reassembly.remove(key)
    }

    /// Registers a new transfer and returns the ID it was assigned.
    pub fn register_transfer(&mut self, transfer: Transfer) -> u32 {
        let id = self.next_transfer_id;
        self.next_transfer_id = self.next_transfer_id.wrapping_add(1).max(1);
        self.transfers.insert(id, transfer);
        id
    }

    pub fn transfer_mut(&mut self, id: u32) -> Option<&mut Transfer> {
        self.transfers.get_mut(&id)
    }

    /// Transfers in flight, oldest-registered first — used to route a
    /// client's `xG`/completion tokens when the client doesn't echo the ID.
    pub fn transfer_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.transfers.keys().copied()
    }

    pub fn remove_transfer(&mut self, id: u32) -> Option<Transfer> {
        self.transfers.remove(&id)
    }

    /// Releases everything transient: reassembly buffers, transfers, and
    /// (per §4.6) any guest password. Called on teardown.
    pub fn teardown(&mut self) {
        self.reassembly.clear();
        self.transfers.clear();
        self.guest_credentials = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_sets_display_name_and_flag() {
        let mut session = SessionContext::new(1);
        assert!(!session.is_authenticated());
        session.mark_authenticated("alice");
        assert!(session.is_authenticated());
        assert!(!session.is_ephemeral_guest());
        assert_eq!(session.display_name(), Some("alice"));
    }

    #[test]
    fn guest_marks_ephemeral_and_stores_credentials() {
        let mut session = SessionContext::new(1);
        session.mark_guest(GuestCredentials {
            screenname: "~Guest123".to_string(),
            password: "abc123XYZ!".to_string(),
        });
        assert!(session.is_authenticated());
        assert!(session.is_ephemeral_guest());
        assert_eq!(session.guest_credentials().unwrap().screenname, "~Guest123");
    }

    #[test]
    fn reassembly_accumulates_and_is_taken_once() {
        let mut session = SessionContext::new(1);
        let key = ReassemblyKey {
            token: "Kk".to_string(),
            stream_id: 7,
        };
        session.append_reassembly(key.clone(), b"hello, ").unwrap();
        session.append_reassembly(key.clone(), b"world").unwrap();
        assert_eq!(session.take_reassembly(&key), Some(b"hello, world".to_vec()));
        assert_eq!(session.take_reassembly(&key), None);
    }

    #[test]
    fn reassembly_rejects_oversized_accumulation() {
        let mut session = SessionContext::new(1);
        let key = ReassemblyKey {
            token: "Kk".to_string(),
            stream_id: 0,
        };
        let chunk = vec![0u8; MAX_REASSEMBLY_BYTES];
        session.append_reassembly(key.clone(), &chunk).unwrap();
        assert_eq!(
            session.append_reassembly(key.clone(), b"x"),
            Err(ReassemblyError::TooLarge)
        );
        assert_eq!(session.take_reassembly(&key), None);
    }

    #[test]
    fn teardown_clears_transient_state() {
        let mut session = SessionContext::new(1);
        session.mark_guest(GuestCredentials {
            screenname: "~Guest".to_string(),
            password: "secret".to_string(),
        });
        session
            .append_reassembly(ReassemblyKey { token: "Kk".into(), stream_id: 0 }, b"x")
            .unwrap();
        session.teardown();
        assert!(session.guest_credentials().is_none());
    }
}
