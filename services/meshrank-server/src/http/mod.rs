//! HTTP router (C10): a flat path-and-method dispatcher. Every response
//! sets `Cache-Control: no-store`; non-SSE endpoints get a request-scoped
//! timeout (30s, 120s for `/api/dashboard`).

pub mod admin;
pub mod auth;
pub mod messages;
pub mod rank;
pub mod share;
mod util;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::sse;
use crate::state::AppState;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DASHBOARD_TIMEOUT: Duration = Duration::from_secs(120);

pub fn build_router(state: Arc<AppState>) -> Router {
    let static_dir = state.config.static_dir.clone();

    let sse_routes = Router::new()
        .route("/api/message-stream", get(sse::message_stream))
        .route("/api/bot-stream", get(sse::bot_stream));

    let dashboard_routes = Router::new()
        .route("/api/dashboard", get(messages::dashboard))
        .layer(TimeoutLayer::new(DASHBOARD_TIMEOUT));

    let timed_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/messages", get(messages::list_messages))
        .route("/api/channels", get(messages::list_channels).post(admin::add_channel_secret).delete(admin::remove_channel_secret))
        .route("/api/channel-directory", get(messages::channel_directory))
        .route("/api/repeater-rank", get(rank::repeater_rank))
        .route("/api/repeater-rank-summary", get(rank::repeater_rank_summary))
        .route("/api/repeater-rank-excluded", get(rank::repeater_rank_excluded))
        .route("/api/repeater-rank-history", get(rank::repeater_rank_history))
        .route("/api/observer-rank", get(rank::observer_rank))
        .route("/api/node-rank", get(rank::node_rank))
        .route("/api/meshscore", get(rank::meshscore))
        .route("/api/mesh-live", get(rank::mesh_live))
        .route("/api/rf-latest", get(rank::rf_latest))
        .route("/api/routes/{id}/share", post(share::create_share))
        .route("/api/share/{code}", get(share::resolve_share))
        .route("/api/repeater-hide", post(admin::repeater_hide))
        .route("/api/repeater-flag", post(admin::repeater_flag))
        .route("/api/repeater-location", post(admin::repeater_location))
        .route("/api/observer-location", post(admin::observer_location))
        .route("/api/channels/block", post(admin::block_channel))
        .route("/api/channels/unblock", post(admin::unblock_channel))
        .route("/api/channels/create", post(admin::create_channel))
        .route("/api/channels/update", post(admin::update_channel))
        .route("/api/channels/move", post(admin::move_channel))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/google-id-token", post(auth::google_id_token))
        .route("/api/auth/oauth/google", get(auth::oauth_google))
        .route("/api/auth/oauth/google/callback", get(auth::oauth_google_callback))
        .route("/api/auth/me", get(auth::me))
        .route("/api/geoscore/status", get(rank::geoscore_status))
        .route("/api/geoscore/diagnostics", get(rank::geoscore_diagnostics))
        .route("/api/geoscore/observers", get(rank::geoscore_observers))
        .layer(TimeoutLayer::new(DEFAULT_TIMEOUT));

    let static_routes = Router::new()
        .route("/", get(shell))
        .route("/s/{code}", get(shell))
        .route("/msg/{id}", get(shell))
        .fallback_service(
            ServeDir::new(&static_dir).fallback(ServeFile::new(static_dir.join("index.html"))),
        );

    Router::new()
        .merge(sse_routes)
        .merge(dashboard_routes)
        .merge(timed_routes)
        .merge(static_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(SetResponseHeaderLayer::overriding(
                    axum::http::header::CACHE_CONTROL,
                    HeaderValue::from_static("no-store"),
                )),
        )
        .with_state(state)
}

async fn shell() -> Response {
    // The HTML shell is part of the bundled front-end, out of scope here;
    // `/`, `/s/:code`, and `/msg/:id` all resolve to the same static entry
    // point and let the client-side router take over.
    (
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        "<!doctype html><title>meshrank</title><div id=\"app\"></div>",
    )
        .into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    uptime_secs: u64,
    ingested_total: i64,
    repeater_rank_updated_at: Option<String>,
}

async fn health(axum::extract::State(state): axum::extract::State<Arc<AppState>>) -> impl IntoResponse {
    let repeater_rank_updated_at = state
        .repeater_rank
        .read()
        .expect("repeater rank lock poisoned")
        .as_ref()
        .map(|c| c.updated_at.clone());
    Json(HealthResponse {
        ok: true,
        uptime_secs: state.boot_time.elapsed().as_secs(),
        ingested_total: state.ingested_total.load(std::sync::atomic::Ordering::Relaxed),
        repeater_rank_updated_at,
    })
}

pub async fn handler_timeout() -> impl IntoResponse {
    (StatusCode::GATEWAY_TIMEOUT, "request timed out")
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
    async fn health_reports_ok() {
        let state = test_state();
        let resp = health(axum::extract::State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn router_builds_without_panicking() {
        let state = test_state();
        let _router = build_router(state);
    }
}
