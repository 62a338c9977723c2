//! The SQLite handle shared across the storage façade and the rank engines.
//!
//! Mirrors the schema in §6 of the interface contract. A single connection
//! is held behind `Arc<Mutex<..>>` in [`crate::state::AppState`]; reads and
//! writes both go through it, dispatched onto a blocking thread from async
//! handlers via `tokio::task::spawn_blocking`.

use std::path::Path;
use std::time::Instant;

use rusqlite::Connection;
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

pub type DbResult<T> = Result<T, DbError>;

pub struct Db {
    conn: Connection,
    debug_sql: bool,
}

impl Db {
    pub fn open(path: &Path, debug_sql: bool) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        let db = Self { conn, debug_sql };
        db.apply_pragmas()?;
        db.apply_schema()?;
        Ok(db)
    }

    pub fn open_in_memory(debug_sql: bool) -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn, debug_sql };
        db.apply_pragmas()?;
        db.apply_schema()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn integrity_check(&self) -> DbResult<()> {
        let r: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if r != "ok" {
            return Err(DbError::IntegrityCheckFailed(r));
        }
        Ok(())
    }

    /// Run `sql` through `prepare`, timing it when `DEBUG_SQL` is set. This
    /// replaces the upstream pattern of monkey-patching `Statement::prepare`
    /// to log elapsed time; here it's an explicit wrapper the caller opts
    /// into.
    pub fn prepare_logged<'a>(
        &'a self,
        sql: &str,
    ) -> rusqlite::Result<rusqlite::Statement<'a>> {
        if !self.debug_sql {
            return self.conn.prepare(sql);
        }
        let started = Instant::now();
        let stmt = self.conn.prepare(sql)?;
        tracing::debug!(elapsed_us = started.elapsed().as_micros(), sql, "prepared statement");
        Ok(stmt)
    }

    fn apply_pragmas(&self) -> DbResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=NORMAL; \
             PRAGMA temp_store=MEMORY; \
             PRAGMA cache_size=-65536; \
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn apply_schema(&self) -> DbResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_and_applies_schema() {
        let db = Db::open_in_memory(false).unwrap();
        db.integrity_check().unwrap();
        let count: i64 = db
            .conn()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='devices'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn repeater_rank_cache_enforces_singleton_row() {
        let db = Db::open_in_memory(false).unwrap();
        db.conn()
            .execute(
                "INSERT INTO repeater_rank_cache (id, updated_at, payload) VALUES (1, 'now', '{}')",
                [],
            )
            .unwrap();
        let err = db
            .conn()
            .execute(
                "INSERT INTO repeater_rank_cache (id, updated_at, payload) VALUES (2, 'now', '{}')",
                [],
            )
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::SqliteFailure(..)));
    }
}
