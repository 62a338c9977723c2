//! Share-link store (C11): short codes that resolve to a canonical message.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::Connection;

use crate::db::DbError;

const CODE_DIGITS: u32 = 5;
const TTL_HOURS: i64 = 24;
const MAX_COLLISION_RETRIES: u32 = 20;
const RATE_LIMIT_PER_MINUTE: u32 = 30;
const MISS_LIMIT: u32 = 12;
const SWEEP_BATCH: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct ShareCodeRow {
    pub code: String,
    pub message_id: String,
    pub created_at: String,
    pub expires_at: String,
}

pub fn generate_code(rng: &mut impl Rng) -> String {
    let max = 10u32.pow(CODE_DIGITS);
    format!("{:0width$}", rng.gen_range(0..max), width = CODE_DIGITS as usize)
}

/// Allocate (or return the existing unexpired) code for `message_id`.
pub fn allocate_share_code(
    conn: &Connection,
    message_id: &str,
    now: DateTime<Utc>,
) -> Result<ShareCodeRow, DbError> {
    if let Some(existing) = find_by_message(conn, message_id)? {
        if parse_rfc3339(&existing.expires_at) > now {
            return Ok(existing);
        }
    }

    let mut rng = rand::thread_rng();
    let created_at = now.to_rfc3339();
    let expires_at = (now + Duration::hours(TTL_HOURS)).to_rfc3339();

    for _ in 0..MAX_COLLISION_RETRIES {
        let code = generate_code(&mut rng);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO route_share (share_code, message_id, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![code, message_id, created_at, expires_at],
        )?;
        if inserted == 1 {
            return Ok(ShareCodeRow {
                code,
                message_id: message_id.to_owned(),
                created_at,
                expires_at,
            });
        }
    }
    Err(DbError::IntegrityCheckFailed(
        "exhausted share code collision retries".to_owned(),
    ))
}

fn find_by_message(conn: &Connection, message_id: &str) -> Result<Option<ShareCodeRow>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT share_code, message_id, created_at, expires_at FROM route_share \
         WHERE message_id = ?1 ORDER BY created_at DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map([message_id], map_row)?;
    Ok(rows.next().transpose()?)
}

/// `None` if the code doesn't exist; `Some(Err(expired))` is modelled by the
/// caller checking `expires_at` against `now` — this function always
/// returns the row if present so callers can decide 410 vs deletion.
pub fn resolve_code(conn: &Connection, code: &str) -> Result<Option<ShareCodeRow>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT share_code, message_id, created_at, expires_at FROM route_share WHERE share_code = ?1",
    )?;
    let mut rows = stmt.query_map([code], map_row)?;
    Ok(rows.next().transpose()?)
}

pub fn delete_code(conn: &Connection, code: &str) -> Result<(), DbError> {
    conn.execute("DELETE FROM route_share WHERE share_code = ?1", [code])?;
    Ok(())
}

/// Best-effort sweep of expired rows, capped at 1000 per call (§4.11).
pub fn sweep_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize, DbError> {
    let now_str = now.to_rfc3339();
    let deleted = conn.execute(
        "DELETE FROM route_share WHERE share_code IN ( \
            SELECT share_code FROM route_share WHERE expires_at < ?1 LIMIT ?2)",
        rusqlite::params![now_str, SWEEP_BATCH as i64],
    )?;
    Ok(deleted)
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShareCodeRow> {
    Ok(ShareCodeRow {
        code: row.get(0)?,
        message_id: row.get(1)?,
        created_at: row.get(2)?,
        expires_at: row.get(3)?,
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Simple fixed-window per-IP rate limiter for `GET /api/share/:code`
/// (30/min) with a separate miss counter that trips 429 at 12 misses.
#[derive(Default)]
pub struct ShareRateLimiter {
    windows: std::sync::Mutex<std::collections::HashMap<String, (DateTime<Utc>, u32, u32)>>,
}

impl ShareRateLimiter {
    /// Returns `Ok(())` if the request may proceed, `Err(true)` if the
    /// request-rate limit tripped, `Err(false)` if the miss limit tripped.
    pub fn check(&self, ip: &str, now: DateTime<Utc>, is_miss: bool) -> Result<(), bool> {
        let mut windows = self.windows.lock().expect("rate limiter poisoned");
        let entry = windows.entry(ip.to_owned()).or_insert((now, 0, 0));
        if now.signed_duration_since(entry.0) > Duration::minutes(1) {
            *entry = (now, 0, 0);
        }
        entry.1 += 1;
        if is_miss {
            entry.2 += 1;
        }
        if entry.1 > RATE_LIMIT_PER_MINUTE {
            return Err(true);
        }
        if entry.2 >= MISS_LIMIT {
            return Err(false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn allocate_then_resolve_round_trips() {
        let db = Db::open_in_memory(false).unwrap();
        let now = Utc::now();
        let code = allocate_share_code(db.conn(), "MSG123", now).unwrap();
        let resolved = resolve_code(db.conn(), &code.code).unwrap().unwrap();
        assert_eq!(resolved.message_id, "MSG123");
    }

    #[test]
    fn allocate_returns_same_code_when_unexpired() {
        let db = Db::open_in_memory(false).unwrap();
        let now = Utc::now();
        let first = allocate_share_code(db.conn(), "MSG123", now).unwrap();
        let second = allocate_share_code(db.conn(), "MSG123", now + Duration::seconds(5)).unwrap();
        assert_eq!(first.code, second.code);
    }

    #[test]
    fn expired_code_is_detectable_by_caller() {
        let db = Db::open_in_memory(false).unwrap();
        let now = Utc::now();
        let code = allocate_share_code(db.conn(), "MSG123", now).unwrap();
        let later = now + Duration::hours(25);
        let row = resolve_code(db.conn(), &code.code).unwrap().unwrap();
        assert!(parse_rfc3339(&row.expires_at) < later);
    }

    #[test]
    fn sweep_removes_expired_rows_only() {
        let db = Db::open_in_memory(false).unwrap();
        let now = Utc::now();
        db.conn()
            .execute(
                "INSERT INTO route_share (share_code, message_id, created_at, expires_at) \
                 VALUES ('00001', 'OLD', ?1, ?2)",
                rusqlite::params![now.to_rfc3339(), (now - Duration::hours(1)).to_rfc3339()],
            )
            .unwrap();
        allocate_share_code(db.conn(), "FRESH", now).unwrap();
        let deleted = sweep_expired(db.conn(), now).unwrap();
        assert_eq!(deleted, 1);
        assert!(resolve_code(db.conn(), "00001").unwrap().is_none());
    }

    #[test]
    fn rate_limiter_trips_after_30_requests_per_minute() {
        let limiter = ShareRateLimiter::default();
        let now = Utc::now();
        for _ in 0..30 {
            assert!(limiter.check("1.2.3.4", now, false).is_ok());
        }
        assert_eq!(limiter.check("1.2.3.4", now, false), Err(true));
    }

    #[test]
    fn miss_limit_trips_independently_of_rate_limit() {
        let limiter = ShareRateLimiter::default();
        let now = Utc::now();
        for _ in 0..11 {
            let _ = limiter.check("5.6.7.8", now, true);
        }
        assert_eq!(limiter.check("5.6.7.8", now, true), Err(false));
    }
}
