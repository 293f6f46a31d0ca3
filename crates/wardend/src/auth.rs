//! Authentication guard with per-identity brute-force lockout.
//!
//! Every entry point except the handshake itself passes through
//! [`AuthGuard::authorize`] before any work happens. Failed attempts are
//! tracked per caller identity (network address); too many failures lock
//! the identity out for a window, during which the credential is not even
//! inspected.

use rand::RngCore;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(15 * 60);
pub const TOKEN_MIN_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication token")]
    MissingToken,
    #[error("invalid authentication token")]
    InvalidToken,
    #[error("too many failed attempts, try again later")]
    LockedOut,
}

#[derive(Debug)]
struct AttemptRecord {
    count: u32,
    locked_until: Option<Instant>,
    last_attempt: Instant,
}

/// Credential check and lockout state. One instance per daemon, injected
/// into the dispatcher; tests construct isolated instances.
pub struct AuthGuard {
    token: String,
    generated: bool,
    max_attempts: u32,
    lockout: Duration,
    attempts: RwLock<HashMap<String, AttemptRecord>>,
}

impl AuthGuard {
    /// Build a guard from an operator-supplied token, or generate one when
    /// none is configured. A configured token shorter than
    /// [`TOKEN_MIN_LENGTH`] is a startup error, not a silent downgrade.
    pub fn new(configured: Option<String>) -> anyhow::Result<Self> {
        let (token, generated) = match configured {
            Some(token) if !token.is_empty() => {
                if token.len() < TOKEN_MIN_LENGTH {
                    anyhow::bail!(
                        "auth token must be at least {TOKEN_MIN_LENGTH} characters (got {})",
                        token.len()
                    );
                }
                (token, false)
            }
            _ => (generate_token(), true),
        };

        Ok(Self::with_policy(token, generated, MAX_FAILED_ATTEMPTS, LOCKOUT_DURATION))
    }

    /// Constructor with explicit lockout policy, for tests.
    pub fn with_policy(token: String, generated: bool, max_attempts: u32, lockout: Duration) -> Self {
        Self {
            token,
            generated,
            max_attempts,
            lockout,
            attempts: RwLock::new(HashMap::new()),
        }
    }

    /// The active token. Only meant for operator retrieval of a generated
    /// credential; never log this on the request path.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_generated(&self) -> bool {
        self.generated
    }

    /// Check a presented credential for `identity`.
    ///
    /// A locked identity is rejected before the credential is inspected.
    /// On mismatch the failure counter advances and may impose a lockout;
    /// on success the identity's record is removed entirely.
    pub fn authorize(&self, identity: &str, presented: Option<&str>) -> Result<(), AuthError> {
        if self.is_locked(identity) {
            return Err(AuthError::LockedOut);
        }

        let presented = match presented {
            Some(t) if !t.is_empty() => t,
            _ => {
                self.record_failure(identity);
                return Err(AuthError::MissingToken);
            }
        };
        let presented = presented.strip_prefix("Bearer ").unwrap_or(presented);

        if !constant_time_eq(presented.as_bytes(), self.token.as_bytes()) {
            if self.record_failure(identity) {
                return Err(AuthError::LockedOut);
            }
            return Err(AuthError::InvalidToken);
        }

        self.reset(identity);
        Ok(())
    }

    fn is_locked(&self, identity: &str) -> bool {
        let attempts = self.attempts.read().unwrap_or_else(|e| e.into_inner());
        match attempts.get(identity).and_then(|r| r.locked_until) {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Returns true when this failure imposed a lockout.
    fn record_failure(&self, identity: &str) -> bool {
        let mut attempts = self.attempts.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let record = attempts.entry(identity.to_string()).or_insert(AttemptRecord {
            count: 0,
            locked_until: None,
            last_attempt: now,
        });

        record.count += 1;
        record.last_attempt = now;

        if record.count >= self.max_attempts {
            record.locked_until = Some(now + self.lockout);
            return true;
        }
        false
    }

    fn reset(&self, identity: &str) {
        let mut attempts = self.attempts.write().unwrap_or_else(|e| e.into_inner());
        attempts.remove(identity);
    }

    /// Drop records that are no longer locked and have been quiet for a
    /// full lockout window. Called periodically by the server.
    pub fn sweep(&self) {
        let mut attempts = self.attempts.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let window = self.lockout;
        attempts.retain(|_, record| {
            if let Some(until) = record.locked_until {
                if now < until {
                    return true;
                }
            }
            now.duration_since(record.last_attempt) < window
        });
    }

    #[cfg(test)]
    fn tracked_identities(&self) -> usize {
        self.attempts.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Generate a 32-byte random token, hex-encoded (64 characters).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fixed-time byte comparison: runtime does not depend on where the first
/// mismatching byte occurs. Length difference is folded into the result
/// rather than short-circuiting.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    let max = a.len().max(b.len());
    for i in 0..max {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    fn guard() -> AuthGuard {
        AuthGuard::with_policy(TOKEN.into(), false, MAX_FAILED_ATTEMPTS, LOCKOUT_DURATION)
    }

    #[test]
    fn correct_token_succeeds() {
        let g = guard();
        assert!(g.authorize("10.0.0.1:4000", Some(TOKEN)).is_ok());
    }

    #[test]
    fn bearer_prefix_is_accepted() {
        let g = guard();
        let token = format!("Bearer {TOKEN}");
        assert!(g.authorize("10.0.0.1:4000", Some(&token)).is_ok());
    }

    #[test]
    fn missing_token_counts_as_failure() {
        let g = guard();
        assert_eq!(g.authorize("10.0.0.1:4000", None).unwrap_err(), AuthError::MissingToken);
        assert_eq!(g.tracked_identities(), 1);
    }

    #[test]
    fn lockout_after_max_failures_even_with_correct_token() {
        let g = guard();
        let ip = "10.0.0.2:9999";

        for i in 0..MAX_FAILED_ATTEMPTS {
            let err = g.authorize(ip, Some("wrong-token-wrong-token-wrong-00")).unwrap_err();
            if i + 1 < MAX_FAILED_ATTEMPTS {
                assert_eq!(err, AuthError::InvalidToken);
            } else {
                // the attempt that reaches the maximum imposes the lockout
                assert_eq!(err, AuthError::LockedOut);
            }
        }

        // correct credential is rejected without inspection while locked
        assert_eq!(g.authorize(ip, Some(TOKEN)).unwrap_err(), AuthError::LockedOut);
    }

    #[test]
    fn lockout_expires_and_success_resets() {
        let g = AuthGuard::with_policy(TOKEN.into(), false, 2, Duration::from_millis(30));
        let ip = "10.0.0.3:1";

        let _ = g.authorize(ip, Some("bad-token-bad-token-bad-token-00"));
        let _ = g.authorize(ip, Some("bad-token-bad-token-bad-token-00"));
        assert_eq!(g.authorize(ip, Some(TOKEN)).unwrap_err(), AuthError::LockedOut);

        std::thread::sleep(Duration::from_millis(40));
        assert!(g.authorize(ip, Some(TOKEN)).is_ok());
        // full reset: the record is gone, not decremented
        assert_eq!(g.tracked_identities(), 0);
    }

    #[test]
    fn identities_are_tracked_independently() {
        let g = AuthGuard::with_policy(TOKEN.into(), false, 2, Duration::from_secs(60));

        let _ = g.authorize("10.0.0.4:1", Some("bad-token-bad-token-bad-token-00"));
        let _ = g.authorize("10.0.0.4:1", Some("bad-token-bad-token-bad-token-00"));
        assert_eq!(g.authorize("10.0.0.4:1", Some(TOKEN)).unwrap_err(), AuthError::LockedOut);

        assert!(g.authorize("10.0.0.5:1", Some(TOKEN)).is_ok());
    }

    #[test]
    fn sweep_drops_stale_unlocked_records() {
        let g = AuthGuard::with_policy(TOKEN.into(), false, 5, Duration::from_millis(20));
        let _ = g.authorize("10.0.0.6:1", Some("bad-token-bad-token-bad-token-00"));
        assert_eq!(g.tracked_identities(), 1);

        std::thread::sleep(Duration::from_millis(30));
        g.sweep();
        assert_eq!(g.tracked_identities(), 0);
    }

    #[test]
    fn short_configured_token_is_rejected() {
        assert!(AuthGuard::new(Some("short".into())).is_err());
    }

    #[test]
    fn generated_token_meets_length_policy() {
        let g = AuthGuard::new(None).unwrap();
        assert!(g.is_generated());
        assert!(g.token().len() >= TOKEN_MIN_LENGTH);
        assert!(g.token().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn constant_time_eq_semantics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
        // mismatch position does not change the outcome path
        assert!(!constant_time_eq(b"xbcdefgh", b"abcdefgh"));
        assert!(!constant_time_eq(b"abcdefgx", b"abcdefgh"));
    }
}
