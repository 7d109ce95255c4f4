// ABOUTME: Credential-checker seam plus the login handshake and ephemeral-guest issuance
// ABOUTME: `generate_guest_password` is deliberately public per the design note on the reflection-only helper

use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use std::collections::HashMap;
use tracing::warn;

const GUEST_PREFIX: char = '~';
const GUEST_PASSWORD_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%";

/// The seam an external credential store plugs into (§6). `authenticate`
/// is the only required method; `has_user`/`user_count` are optional
/// diagnostics with a default that admits nothing is known.
pub trait CredentialChecker: Send + Sync {
    /// Case-insensitive on `username`, case-sensitive on `password` (§6).
    fn authenticate(&self, username: &str, password: &str) -> bool;

    fn has_user(&self, _username: &str) -> bool {
        false
    }

    fn user_count(&self) -> usize {
        0
    }
}

/// Parses and checks against a static, in-memory credential list loaded
/// from configuration (`auth.users`, §6): `user1:pass1,user2:pass2`,
/// commas delimit entries, the first colon in each entry splits user from
/// password, whitespace is trimmed, malformed entries are skipped and
/// logged.
#[derive(Debug, Default)]
pub struct StaticCredentialChecker {
    // Keyed by lowercased username; password comparison stays case-sensitive.
    users: HashMap<String, String>,
}

impl StaticCredentialChecker {
    pub fn new() -> Self {
        StaticCredentialChecker { users: HashMap::new() }
    }

    /// Parses the `auth.users` configuration format. Malformed entries
    /// (no colon, or an empty username) are skipped with a warning rather
    /// than failing the whole load.
    pub fn parse(spec: &str) -> Self {
        let mut users = HashMap::new();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let Some((user, pass)) = entry.split_once(':') else {
                warn!(entry, "skipping malformed auth.users entry (no colon)");
                continue;
            };
            let user = user.trim();
            let pass = pass.trim();
            if user.is_empty() {
                warn!(entry, "skipping malformed auth.users entry (empty username)");
                continue;
            }
            users.insert(user.to_lowercase(), pass.to_string());
        }
        StaticCredentialChecker { users }
    }
}

impl CredentialChecker for StaticCredentialChecker {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users.get(&username.to_lowercase()).is_some_and(|p| p == password)
    }

    fn has_user(&self, username: &str) -> bool {
        self.users.contains_key(&username.to_lowercase())
    }

    fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("username must be 1..16 characters")]
    InvalidUsername,
    #[error("password must be 1..8 characters")]
    InvalidPassword,
}

/// Result of handing a login attempt to [`handle_login`].
#[derive(Debug, PartialEq, Eq)]
pub enum LoginOutcome {
    Success { display_name: String },
    Failure { reason: String },
}

/// Validates lengths and checks credentials for a login attempt (§4.6
/// steps 1-2). Does not mutate a session; the caller applies the outcome.
pub fn handle_login(checker: &dyn CredentialChecker, username: &str, password: &str) -> LoginOutcome {
    if let Err(err) = validate_lengths(username, password) {
        return LoginOutcome::Failure { reason: err.to_string() };
    }
    if checker.authenticate(username, password) {
        LoginOutcome::Success {
            display_name: username.to_string(),
        }
    } else {
        LoginOutcome::Failure {
            reason: "invalid username or password".to_string(),
        }
    }
}

fn validate_lengths(username: &str, password: &str) -> Result<(), AuthError> {
    if username.is_empty() || username.chars().count() > 16 {
        return Err(AuthError::InvalidUsername);
    }
    if password.is_empty() || password.chars().count() > 8 {
        return Err(AuthError::InvalidPassword);
    }
    Ok(())
}

/// Generates a random guest password of `len` characters (12-16 per §4.6),
/// drawn from upper/lower alphanumerics plus a small punctuation set.
/// Public (not a private, reflection-reached helper) per the design note
/// calling out that this belongs on a testable surface.
pub fn generate_guest_password(rng: &mut impl Rng, len: usize) -> String {
    let dist = Uniform::from(0..GUEST_PASSWORD_CHARS.len());
    (0..len).map(|_| GUEST_PASSWORD_CHARS[dist.sample(rng)] as char).collect()
}

/// Issues an ephemeral guest identity: a screenname prefixed with the
/// reserved `~` marker plus a numeric suffix derived from `seed`, and a
/// freshly generated password of `password_len` characters.
pub fn issue_guest(rng: &mut impl Rng, seed: u32, password_len: usize) -> (String, String) {
    let screenname = format!("{GUEST_PREFIX}Guest{seed}");
    let password = generate_guest_password(rng, password_len);
    (screenname, password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn parse_reads_well_formed_entries() {
        let checker = StaticCredentialChecker::parse("alice:secret1,bob:hunter2");
        assert!(checker.authenticate("alice", "secret1"));
        assert!(checker.authenticate("Alice", "secret1"));
        assert!(!checker.authenticate("alice", "WRONG"));
        assert_eq!(checker.user_count(), 2);
    }

    #[test]
    fn parse_skips_malformed_entries() {
        let checker = StaticCredentialChecker::parse("alice:secret1, nocolonentry , :emptyuser, bob:hunter2");
        assert_eq!(checker.user_count(), 2);
        assert!(checker.has_user("alice"));
        assert!(checker.has_user("bob"));
    }

    #[test]
    fn username_is_case_insensitive_password_is_case_sensitive() {
        let checker = StaticCredentialChecker::parse("Alice:Secret");
        assert!(checker.authenticate("ALICE", "Secret"));
        assert!(!checker.authenticate("alice", "secret"));
    }

    #[test]
    fn login_rejects_usernames_and_passwords_outside_length_bounds() {
        let checker = StaticCredentialChecker::parse("a:pw");
        assert!(matches!(
            handle_login(&checker, "", "pw"),
            LoginOutcome::Failure { .. }
        ));
        assert!(matches!(
            handle_login(&checker, "this-username-is-seventeen", "pw"),
            LoginOutcome::Failure { .. }
        ));
        assert!(matches!(
            handle_login(&checker, "a", "nine-chars"),
            LoginOutcome::Failure { .. }
        ));
    }

    #[test]
    fn login_succeeds_for_a_known_user() {
        let checker = StaticCredentialChecker::parse("alice:secret1");
        assert_eq!(
            handle_login(&checker, "alice", "secret1"),
            LoginOutcome::Success {
                display_name: "alice".to_string()
            }
        );
    }

    #[test]
    fn login_fails_for_an_unknown_user_without_revealing_which_check_failed() {
        let checker = StaticCredentialChecker::parse("alice:secret1");
        match handle_login(&checker, "mallory", "whatever") {
            LoginOutcome::Failure { reason } => assert_eq!(reason, "invalid username or password"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn guest_password_has_the_requested_length_and_charset() {
        let mut rng = StdRng::seed_from_u64(42);
        let password = generate_guest_password(&mut rng, 14);
        assert_eq!(password.len(), 14);
        assert!(password.bytes().all(|b| GUEST_PASSWORD_CHARS.contains(&b)));
    }

    #[test]
    fn issue_guest_prefixes_the_reserved_marker() {
        let mut rng = StdRng::seed_from_u64(7);
        let (screenname, password) = issue_guest(&mut rng, 1234, 12);
        assert!(screenname.starts_with('~'));
        assert_eq!(password.len(), 12);
    }
}
