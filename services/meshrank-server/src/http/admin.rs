//! Admin/owner mutation endpoints (C9): hide/flag/relocate nodes, manage the
//! channel catalog, and join/leave channels by code. Every handler runs its
//! SQL on a blocking thread and invalidates the device/observer caches on
//! success so the next read reflects the change immediately.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::http::util;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AddChannelSecretRequest {
    name: String,
    code: String,
    emoji: Option<String>,
    group: Option<String>,
}

/// `POST /api/channels`: join a channel by its PSK code (any signed-in user).
/// Inserts the catalog row if it doesn't exist yet, then links it to the caller.
pub async fn add_channel_secret(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<AddChannelSecretRequest>,
) -> AppResult<Json<Value>> {
    let storage = state.storage.clone();
    tokio::task::spawn_blocking(move || -> AppResult<()> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let claims = util::current_session(db.conn(), &headers)?;
        let now = Utc::now().to_rfc3339();
        db.conn().execute(
            "INSERT INTO channels_catalog (name, emoji, grp, code, allow_popular, created_at) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5) \
             ON CONFLICT(name) DO UPDATE SET code = excluded.code",
            rusqlite::params![body.name, body.emoji, body.group, body.code, now],
        )?;
        db.conn().execute(
            "INSERT OR IGNORE INTO user_channels (user_id, channel_name) VALUES (?1, ?2)",
            rusqlite::params![claims.user_id, body.name],
        )?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Internal(format!("add_channel_secret task panicked: {e}")))??;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct RemoveChannelSecretRequest {
    name: String,
}

/// `DELETE /api/channels`: leave a channel (removes the caller's membership
/// row only; the catalog entry and its code survive for other members).
pub async fn remove_channel_secret(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<RemoveChannelSecretRequest>,
) -> AppResult<Json<Value>> {
    let storage = state.storage.clone();
    tokio::task::spawn_blocking(move || -> AppResult<()> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let claims = util::current_session(db.conn(), &headers)?;
        db.conn().execute(
            "DELETE FROM user_channels WHERE user_id = ?1 AND channel_name = ?2",
            rusqlite::params![claims.user_id, body.name],
        )?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Internal(format!("remove_channel_secret task panicked: {e}")))??;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct RepeaterHideRequest {
    pub_key: String,
    hidden: bool,
}

/// `POST /api/repeater-hide`: admin-only, toggles `hidden_on_map`.
pub async fn repeater_hide(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<RepeaterHideRequest>,
) -> AppResult<Json<Value>> {
    admin_mutate(&state, headers, move |conn| {
        conn.execute(
            "UPDATE devices SET hidden_on_map = ?1 WHERE pub = ?2",
            rusqlite::params![body.hidden as i64, body.pub_key],
        )?;
        Ok(())
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct RepeaterFlagRequest {
    pub_key: String,
    gps_flagged: bool,
}

/// `POST /api/repeater-flag`: admin-only, toggles `gps_flagged` (excludes the
/// repeater's GPS from neighbour inference without hiding it from the map).
pub async fn repeater_flag(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<RepeaterFlagRequest>,
) -> AppResult<Json<Value>> {
    admin_mutate(&state, headers, move |conn| {
        conn.execute(
            "UPDATE devices SET gps_flagged = ?1 WHERE pub = ?2",
            rusqlite::params![body.gps_flagged as i64, body.pub_key],
        )?;
        Ok(())
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct RepeaterLocationRequest {
    pub_key: String,
    lat: f64,
    lon: f64,
}

/// `POST /api/repeater-location`: admin-only manual GPS override; marks the
/// fix `gps_estimated` since it didn't come from the device's own advert.
pub async fn repeater_location(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<RepeaterLocationRequest>,
) -> AppResult<Json<Value>> {
    admin_mutate(&state, headers, move |conn| {
        conn.execute(
            "UPDATE devices SET gps_lat = ?1, gps_lon = ?2, gps_estimated = 1 WHERE pub = ?3",
            rusqlite::params![body.lat, body.lon, body.pub_key],
        )?;
        Ok(())
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct ObserverLocationRequest {
    observer_id: String,
    lat: f64,
    lon: f64,
}

/// `POST /api/observer-location`: admin-only, pins an observer's "home" used
/// as a geoscore inference anchor.
pub async fn observer_location(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<ObserverLocationRequest>,
) -> AppResult<Json<Value>> {
    admin_mutate(&state, headers, move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO geoscore_observer_homes (observer_id, gps_lat, gps_lon, source, updated_at) \
             VALUES (?1, ?2, ?3, 'admin', ?4) \
             ON CONFLICT(observer_id) DO UPDATE SET \
                gps_lat = excluded.gps_lat, gps_lon = excluded.gps_lon, \
                source = 'admin', updated_at = excluded.updated_at",
            rusqlite::params![body.observer_id, body.lat, body.lon, now],
        )?;
        Ok(())
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct ChannelNameRequest {
    name: String,
}

/// `POST /api/channels/block`: admin-only, hides a channel from directories
/// and the dashboard without deleting its history.
pub async fn block_channel(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<ChannelNameRequest>,
) -> AppResult<Json<Value>> {
    admin_mutate(&state, headers, move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR REPLACE INTO channel_blocks (channel_name, blocked_at) VALUES (?1, ?2)",
            rusqlite::params![body.name, now],
        )?;
        Ok(())
    })
    .await
}

/// `POST /api/channels/unblock`: admin-only, reverses [`block_channel`].
pub async fn unblock_channel(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<ChannelNameRequest>,
) -> AppResult<Json<Value>> {
    admin_mutate(&state, headers, move |conn| {
        conn.execute("DELETE FROM channel_blocks WHERE channel_name = ?1", [&body.name])?;
        Ok(())
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    name: String,
    code: String,
    emoji: Option<String>,
    group: Option<String>,
    #[serde(default)]
    allow_popular: bool,
}

/// `POST /api/channels/create`: admin-only, adds a brand-new catalog entry.
pub async fn create_channel(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<CreateChannelRequest>,
) -> AppResult<Json<Value>> {
    admin_mutate(&state, headers, move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO channels_catalog (name, emoji, grp, code, allow_popular, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![body.name, body.emoji, body.group, body.code, body.allow_popular as i64, now],
        )?;
        Ok(())
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct UpdateChannelRequest {
    name: String,
    emoji: Option<String>,
    group: Option<String>,
    #[serde(default)]
    allow_popular: bool,
}

/// `POST /api/channels/update`: admin-only, edits display metadata in place.
pub async fn update_channel(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<UpdateChannelRequest>,
) -> AppResult<Json<Value>> {
    admin_mutate(&state, headers, move |conn| {
        conn.execute(
            "UPDATE channels_catalog SET emoji = ?1, grp = ?2, allow_popular = ?3 WHERE name = ?4",
            rusqlite::params![body.emoji, body.group, body.allow_popular as i64, body.name],
        )?;
        Ok(())
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct MoveChannelRequest {
    old_name: String,
    new_name: String,
}

/// `POST /api/channels/move`: admin-only, renames a channel and carries its
/// memberships and block status along with it. Message history keeps the old
/// `channel_name`; renaming it in place would sever the link an observer's
/// archived NDJSON line still has to the channel it was posted in.
pub async fn move_channel(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<MoveChannelRequest>,
) -> AppResult<Json<Value>> {
    admin_mutate(&state, headers, move |conn| {
        conn.execute(
            "UPDATE channels_catalog SET name = ?1 WHERE name = ?2",
            rusqlite::params![body.new_name, body.old_name],
        )?;
        conn.execute(
            "UPDATE user_channels SET channel_name = ?1 WHERE channel_name = ?2",
            rusqlite::params![body.new_name, body.old_name],
        )?;
        conn.execute(
            "UPDATE channel_blocks SET channel_name = ?1 WHERE channel_name = ?2",
            rusqlite::params![body.new_name, body.old_name],
        )?;
        Ok(())
    })
    .await
}

/// Shared admin-gate-then-mutate-then-invalidate-caches plumbing so each
/// handler above only has to supply its SQL.
async fn admin_mutate(
    state: &Arc<AppState>,
    headers: axum::http::HeaderMap,
    mutate: impl FnOnce(&rusqlite::Connection) -> AppResult<()> + Send + 'static,
) -> AppResult<Json<Value>> {
    let storage = state.storage.clone();
    tokio::task::spawn_blocking(move || -> AppResult<()> {
        let db = storage.db.lock().expect("db mutex poisoned");
        util::require_admin(db.conn(), &headers)?;
        mutate(db.conn())
    })
    .await
    .map_err(|e| AppError::Internal(format!("admin mutation task panicked: {e}")))??;
    state.storage.invalidate_device_observer_caches();
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Db;
    use crate::storage::Storage;
    use axum::http::HeaderMap;

    fn test_state() -> Arc<AppState> {
        let config = Config::from_env_with(|_| None).unwrap();
        let db = Db::open_in_memory(false).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(db, dir.path());
        Arc::new(AppState::new(config, storage, dir.path().join("observer.ndjson")))
    }

    #[tokio::test]
    async fn repeater_hide_requires_admin() {
        let state = test_state();
        let err = repeater_hide(
            State(state),
            HeaderMap::new(),
            Json(RepeaterHideRequest {
                pub_key: "AB00".into(),
                hidden: true,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[tokio::test]
    async fn add_channel_secret_requires_a_session() {
        let state = test_state();
        let err = add_channel_secret(
            State(state),
            HeaderMap::new(),
            Json(AddChannelSecretRequest {
                name: "general".into(),
                code: "secret".into(),
                emoji: None,
                group: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }
}
