//! Small helpers shared by the handler modules: pulling a session out of the
//! `Authorization` header and gating on the admin bit.

use axum::http::HeaderMap;
use rusqlite::Connection;

use crate::auth::{self, SessionClaims};
use crate::error::{AppError, AppResult};

pub(crate) fn current_session(conn: &Connection, headers: &HeaderMap) -> AppResult<SessionClaims> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::extract_bearer)
        .ok_or(AppError::Unauthorized)?;
    auth::validate_session(conn, raw)?.ok_or(AppError::Unauthorized)
}

pub(crate) fn require_admin(conn: &Connection, headers: &HeaderMap) -> AppResult<SessionClaims> {
    let claims = current_session(conn, headers)?;
    if !claims.is_admin {
        return Err(AppError::Forbidden);
    }
    Ok(claims)
}
