//! Time-limited TURN credentials.
//!
//! Uses the shared-secret scheme understood by common TURN servers: the
//! username is `{expiry_unix}:{session_id}` and the password is
//! `base64(HMAC-SHA1(secret, username))`. The TURN server recomputes the
//! HMAC and rejects usernames whose expiry has passed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use common::secret::{ExposeSecret, SecretString};
use common::types::SessionId;
use ring::hmac;
use std::time::Duration;

/// Generated TURN credentials for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub credential: String,
    /// Unix seconds after which the TURN server rejects the credentials.
    pub expires_at: i64,
}

/// Sign `username` with the static auth secret.
#[must_use]
pub fn sign(secret: &SecretString, username: &str) -> String {
    let key = hmac::Key::new(
        hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        secret.expose_secret().as_bytes(),
    );
    STANDARD.encode(hmac::sign(&key, username.as_bytes()).as_ref())
}

/// Generate credentials valid for `ttl` from `now_unix`.
#[must_use]
pub fn generate(
    secret: &SecretString,
    session_id: &SessionId,
    ttl: Duration,
    now_unix: i64,
) -> TurnCredentials {
    let expires_at = now_unix.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
    let username = format!("{expires_at}:{session_id}");
    let credential = sign(secret, &username);
    TurnCredentials {
        username,
        credential,
        expires_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_matches_hmac_sha1_reference() {
        // RFC 2202 test case 2
        let secret = SecretString::from("Jefe");
        assert_eq!(
            sign(&secret, "what do ya want for nothing?"),
            "7/zfauXrL6LSdBbV8YTfnCWafHk="
        );
    }

    #[test]
    fn test_generate_username_carries_expiry_and_session() {
        let secret = SecretString::from("turn-secret");
        let creds = generate(
            &secret,
            &SessionId::from("sess-1"),
            Duration::from_secs(86_400),
            1_700_000_000,
        );

        assert_eq!(creds.expires_at, 1_700_086_400);
        assert_eq!(creds.username, "1700086400:sess-1");
        assert_eq!(creds.credential, "h7oCETmR7MwZUOilNpNvPoDyM1U=");
    }

    #[test]
    fn test_rotation_changes_credentials() {
        let secret = SecretString::from("turn-secret");
        let session = SessionId::from("sess-1");
        let ttl = Duration::from_secs(60);

        let first = generate(&secret, &session, ttl, 1_000);
        let second = generate(&secret, &session, ttl, 1_060);
        assert_ne!(first.username, second.username);
        assert_ne!(first.credential, second.credential);
    }
}
