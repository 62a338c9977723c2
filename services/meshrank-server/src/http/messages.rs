//! Message/channel read endpoints (C3/C4): the dashboard snapshot, paged
//! message history, and the channel catalog/directory.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use meshrank_protocol::{Channel, MessageView};
use serde::{Deserialize, Serialize};

use crate::channel_cache::ChannelCacheSnapshot;
use crate::error::{AppError, AppResult};
use crate::http::util;
use crate::state::AppState;
use crate::storage::messages as storage_messages;

const DEFAULT_MESSAGES_LIMIT: u32 = 200;
const MAX_MESSAGES_LIMIT: u32 = 2000;

/// `GET /api/dashboard`: the current channel-message snapshot (C4), already
/// built and capped per channel. This is the initial paint; live updates
/// arrive over `/api/message-stream`.
pub async fn dashboard(State(state): State<Arc<AppState>>) -> Json<ChannelCacheSnapshot> {
    Json((*state.channel_cache.snapshot()).clone())
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    channel: Option<String>,
    limit: Option<u32>,
    before: Option<String>,
}

/// `GET /api/messages`: full history read straight from SQLite (not the
/// bounded channel cache), joined through the assembler (C3).
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListMessagesQuery>,
) -> AppResult<Json<Vec<MessageView>>> {
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGES_LIMIT).min(MAX_MESSAGES_LIMIT);
    let storage = state.storage.clone();
    let hits = state.observer_hits.snapshot();
    let devices = storage.read_devices()?;

    let views = tokio::task::spawn_blocking(move || -> Result<Vec<MessageView>, crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let rows = storage_messages::read_messages(
            db.conn(),
            query.channel.as_deref(),
            limit,
            query.before.as_deref(),
        )?;
        let hashes: Vec<String> = rows.iter().map(|r| r.message_hash.clone()).collect();
        let agg = storage_messages::read_message_observer_agg(db.conn(), &hashes)?;
        Ok(rows
            .iter()
            .map(|row| crate::assembler::assemble(row, agg.get(&row.message_hash), &hits, &devices))
            .collect())
    })
    .await
    .map_err(|e| AppError::Internal(format!("list_messages task panicked: {e}")))??;

    Ok(Json(views))
}

#[derive(Debug, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub emoji: Option<String>,
    pub group: Option<String>,
}

/// `GET /api/channel-directory`: the public list of discoverable channels
/// (`allow_popular = 1`), with no auth and no channel codes included.
pub async fn channel_directory(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<DirectoryEntry>>> {
    let storage = state.storage.clone();
    let entries = tokio::task::spawn_blocking(move || -> Result<Vec<DirectoryEntry>, crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let mut stmt = db.conn().prepare(
            "SELECT name, emoji, grp FROM channels_catalog WHERE allow_popular = 1 ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DirectoryEntry {
                name: row.get(0)?,
                emoji: row.get(1)?,
                group: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    })
    .await
    .map_err(|e| AppError::Internal(format!("channel_directory task panicked: {e}")))??;
    Ok(Json(entries))
}

/// `GET /api/channels`: the calling user's own channel list (name + PSK
/// code), requires a live session since the code is effectively a secret.
pub async fn list_channels(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<Channel>>> {
    let storage = state.storage.clone();
    let channels = tokio::task::spawn_blocking(move || -> AppResult<Vec<Channel>> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let claims = util::current_session(db.conn(), &headers)?;
        let mut stmt = db.conn().prepare(
            "SELECT c.name, c.emoji, c.grp, c.code, c.allow_popular, c.created_at \
             FROM channels_catalog c \
             JOIN user_channels uc ON uc.channel_name = c.name \
             WHERE uc.user_id = ?1 ORDER BY c.name",
        )?;
        let rows = stmt.query_map([claims.user_id], |row| {
            Ok(Channel {
                name: row.get(0)?,
                emoji: row.get(1)?,
                group: row.get(2)?,
                code: row.get(3)?,
                allow_popular: row.get::<_, i64>(4)? != 0,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, rusqlite::Error>>()?)
    })
    .await
    .map_err(|e| AppError::Internal(format!("list_channels task panicked: {e}")))??;
    Ok(Json(channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Db;
    use crate::storage::Storage;

    fn test_state() -> Arc<AppState> {
        let config = Config::from_env_with(|_| None).unwrap();
        let db = Db::open_in_memory(false).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(db, dir.path());
        Arc::new(AppState::new(config, storage, dir.path().join("observer.ndjson")))
    }

    #[tokio::test]
    async fn dashboard_returns_empty_snapshot_before_warmup() {
        let state = test_state();
        let Json(snapshot) = dashboard(State(state)).await;
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn channel_directory_is_empty_by_default() {
        let state = test_state();
        let Json(entries) = channel_directory(State(state)).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn list_channels_requires_a_session() {
        let state = test_state();
        let err = list_channels(State(state), HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }
}
