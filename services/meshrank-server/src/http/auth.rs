//! Account/session endpoints (C9). Email/password is the only fully wired
//! login path; Google OAuth is out of scope (see the module spec's
//! non-goals) and its routes return a stub response rather than 404 so a
//! front-end can detect "not configured" instead of "not found".

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth;
use crate::error::{AppError, AppResult};
use crate::http::util;
use crate::state::AppState;

const SESSION_TTL_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct Credentials {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    token: String,
    is_admin: bool,
}

fn issue_session(conn: &rusqlite::Connection, user_id: i64) -> AppResult<String> {
    let token = auth::generate_session_token();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            auth::hash_token(&token),
            user_id,
            now.to_rfc3339(),
            (now + Duration::days(SESSION_TTL_DAYS)).to_rfc3339(),
        ],
    )?;
    Ok(token)
}

/// `POST /api/auth/login`.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Credentials>,
) -> AppResult<Json<SessionResponse>> {
    let storage = state.storage.clone();
    let resp = tokio::task::spawn_blocking(move || -> AppResult<SessionResponse> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let row: Option<(i64, String, bool)> = db
            .conn()
            .query_row(
                "SELECT id, password_hash, is_admin FROM users WHERE email = ?1",
                [&body.email],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)),
            )
            .ok();
        let (user_id, password_hash, is_admin) =
            row.ok_or(AppError::Unauthorized).and_then(|r| {
                if auth::verify_password(&body.password, &r.1) {
                    Ok(r)
                } else {
                    Err(AppError::Unauthorized)
                }
            })?;
        let token = issue_session(db.conn(), user_id)?;
        let _ = password_hash;
        Ok(SessionResponse { token, is_admin })
    })
    .await
    .map_err(|e| AppError::Internal(format!("login task panicked: {e}")))??;
    Ok(Json(resp))
}

/// `POST /api/auth/register`: creates the account and signs it in immediately.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Credentials>,
) -> AppResult<Json<SessionResponse>> {
    if body.password.len() < 8 {
        return Err(AppError::BadRequest("password must be at least 8 characters".to_owned()));
    }
    let storage = state.storage.clone();
    let resp = tokio::task::spawn_blocking(move || -> AppResult<SessionResponse> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let password_hash = auth::hash_password(&body.password);
        let now = Utc::now().to_rfc3339();
        let inserted = db.conn().execute(
            "INSERT OR IGNORE INTO users (email, password_hash, is_admin, created_at) VALUES (?1, ?2, 0, ?3)",
            rusqlite::params![body.email, password_hash, now],
        )?;
        if inserted == 0 {
            return Err(AppError::BadRequest("email already registered".to_owned()));
        }
        let user_id = db.conn().last_insert_rowid();
        let token = issue_session(db.conn(), user_id)?;
        Ok(SessionResponse { token, is_admin: false })
    })
    .await
    .map_err(|e| AppError::Internal(format!("register task panicked: {e}")))??;
    Ok(Json(resp))
}

/// `POST /api/auth/logout`: revokes the bearer session, if any.
pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::extract_bearer)
        .map(str::to_owned);
    let Some(raw) = raw else {
        return Ok(Json(json!({ "ok": true })));
    };
    let storage = state.storage.clone();
    tokio::task::spawn_blocking(move || -> AppResult<()> {
        let db = storage.db.lock().expect("db mutex poisoned");
        db.conn()
            .execute("DELETE FROM sessions WHERE token = ?1", [auth::hash_token(&raw)])?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Internal(format!("logout task panicked: {e}")))??;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    user_id: i64,
    email: String,
    is_admin: bool,
}

/// `GET /api/auth/me`.
pub async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> AppResult<Json<MeResponse>> {
    let storage = state.storage.clone();
    let resp = tokio::task::spawn_blocking(move || -> AppResult<MeResponse> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let claims = util::current_session(db.conn(), &headers)?;
        let email: String = db.conn().query_row(
            "SELECT email FROM users WHERE id = ?1",
            [claims.user_id],
            |row| row.get(0),
        )?;
        Ok(MeResponse {
            user_id: claims.user_id,
            email,
            is_admin: claims.is_admin,
        })
    })
    .await
    .map_err(|e| AppError::Internal(format!("me task panicked: {e}")))??;
    Ok(Json(resp))
}

/// `POST /api/auth/google-id-token`, `GET /api/auth/oauth/google[/callback]`:
/// Google sign-in is not wired up in this deployment; report that plainly
/// instead of a bare 404 so the front-end can hide the button.
pub async fn google_id_token(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    oauth_stub(&state)
}

pub async fn oauth_google(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    oauth_stub(&state)
}

pub async fn oauth_google_callback(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    oauth_stub(&state)
}

fn oauth_stub(state: &Arc<AppState>) -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "ok": false,
            "configured": state.config.google_client_id.is_some(),
            "message": "google sign-in is not available on this deployment",
        })),
    )
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
    async fn register_then_login_round_trips() {
        let state = test_state();
        let reg = register(
            State(state.clone()),
            Json(Credentials {
                email: "a@b.com".into(),
                password: "longenough1".into(),
            }),
        )
        .await
        .unwrap();
        assert!(!reg.is_admin);

        let login_resp = login(
            State(state),
            Json(Credentials {
                email: "a@b.com".into(),
                password: "longenough1".into(),
            }),
        )
        .await
        .unwrap();
        assert_ne!(login_resp.token, reg.token);
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let state = test_state();
        register(
            State(state.clone()),
            Json(Credentials {
                email: "a@b.com".into(),
                password: "longenough1".into(),
            }),
        )
        .await
        .unwrap();
        let err = login(
            State(state),
            Json(Credentials {
                email: "a@b.com".into(),
                password: "wrongpassword".into(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[tokio::test]
    async fn register_rejects_short_passwords() {
        let state = test_state();
        let err = register(
            State(state),
            Json(Credentials {
                email: "a@b.com".into(),
                password: "short".into(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn register_rejects_duplicate_email() {
        let state = test_state();
        register(
            State(state.clone()),
            Json(Credentials {
                email: "a@b.com".into(),
                password: "longenough1".into(),
            }),
        )
        .await
        .unwrap();
        let err = register(
            State(state),
            Json(Credentials {
                email: "a@b.com".into(),
                password: "longenough2".into(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn me_requires_a_session() {
        let state = test_state();
        let err = me(State(state), HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }
}
