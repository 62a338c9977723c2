//! Share-link endpoints (C11): mint a short code for a message, resolve one
//! back, both backed by [`crate::share`].

use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use meshrank_protocol::{ShareCode, ShareResolution};
use std::net::SocketAddr;

use crate::error::{AppError, AppResult};
use crate::http::util;
use crate::share;
use crate::state::AppState;

fn client_ip(headers: &HeaderMap, connect_info: Option<&SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned())
        .or_else(|| connect_info.map(|a| a.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_owned())
}

/// `POST /api/routes/:id/share`: mint (or reuse) a share code for a message.
/// Requires a session; anyone signed in may share a route they can already see.
pub async fn create_share(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<ShareCode>> {
    let storage = state.storage.clone();
    let row = tokio::task::spawn_blocking(move || -> AppResult<crate::share::ShareCodeRow> {
        let db = storage.db.lock().expect("db mutex poisoned");
        util::current_session(db.conn(), &headers)?;
        Ok(share::allocate_share_code(db.conn(), &message_id, Utc::now())?)
    })
    .await
    .map_err(|e| AppError::Internal(format!("create_share task panicked: {e}")))??;

    Ok(Json(ShareCode {
        code: row.code,
        message_hash: row.message_id,
        created_at: row.created_at,
        expires_at: row.expires_at,
    }))
}

/// `GET /api/share/:code`: resolve a share code to the canonical message
/// and its filtered route/observers (§4.11). Rate-limited per IP; expired
/// codes are deleted on read and reported as 410.
pub async fn resolve_share(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> AppResult<Json<ShareResolution>> {
    let ip = client_ip(&headers, connect_info.as_ref().map(|c| &c.0));
    let now = Utc::now();

    let storage = state.storage.clone();
    let row = tokio::task::spawn_blocking(move || -> AppResult<Option<crate::share::ShareCodeRow>> {
        let db = storage.db.lock().expect("db mutex poisoned");
        Ok(share::resolve_code(db.conn(), &code)?)
    })
    .await
    .map_err(|e| AppError::Internal(format!("resolve_share task panicked: {e}")))??;

    let is_miss = row.is_none();
    if state.share_rate_limiter.check(&ip, now, is_miss).is_err() {
        return Err(AppError::RateLimited);
    }

    let row = row.ok_or_else(|| AppError::NotFound("share code not found".to_owned()))?;

    let expires_at = chrono::DateTime::parse_from_rfc3339(&row.expires_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now);
    if expires_at <= now {
        let code = row.code.clone();
        let storage = state.storage.clone();
        tokio::task::spawn_blocking(move || {
            let db = storage.db.lock().expect("db mutex poisoned");
            let _ = share::delete_code(db.conn(), &code);
        })
        .await
        .map_err(|e| AppError::Internal(format!("share cleanup task panicked: {e}")))?;
        return Err(AppError::Gone("share code expired".to_owned()));
    }

    let storage = state.storage.clone();
    let hits = state.observer_hits.snapshot();
    let devices = storage.read_devices()?;
    let message_hash = row.message_id.clone();
    let view = tokio::task::spawn_blocking(move || -> AppResult<Option<meshrank_protocol::MessageView>> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let Some(message_row) = crate::storage::messages::find_message(db.conn(), &message_hash)? else {
            return Ok(None);
        };
        let agg = crate::storage::messages::read_message_observer_agg(
            db.conn(),
            std::slice::from_ref(&message_hash),
        )?;
        Ok(Some(crate::assembler::assemble(
            &message_row,
            agg.get(&message_hash),
            &hits,
            &devices,
        )))
    })
    .await
    .map_err(|e| AppError::Internal(format!("resolve_share task panicked: {e}")))??;

    let message = view.ok_or_else(|| AppError::NotFound("message not found".to_owned()))?;

    Ok(Json(ShareResolution {
        code: row.code,
        created_at: row.created_at,
        expires_at: row.expires_at,
        message,
    }))
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
    async fn resolve_share_returns_404_for_unknown_code() {
        let state = test_state();
        let err = resolve_share(State(state), Path("99999".into()), HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn resolve_share_includes_the_canonical_message() {
        let state = test_state();
        let code = {
            let db = state.storage.db.lock().unwrap();
            db.conn()
                .execute(
                    "INSERT INTO messages (message_hash, frame_hash, channel_name, sender, body, ts, \
                     path_length, repeats) VALUES ('M1', 'F1', '#general', 'node1', 'hi', \
                     '2026-01-01T00:00:00Z', 0, 0)",
                    [],
                )
                .unwrap();
            share::allocate_share_code(db.conn(), "M1", Utc::now()).unwrap().code
        };

        let Json(resolution) = resolve_share(State(state), Path(code), HeaderMap::new(), None)
            .await
            .unwrap();
        assert_eq!(resolution.message.message_hash, "M1");
        assert_eq!(resolution.message.channel_name, "#general");
    }

    #[tokio::test]
    async fn create_share_requires_a_session() {
        let state = test_state();
        let err = create_share(State(state), Path("MSG1".into()), HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }
}
