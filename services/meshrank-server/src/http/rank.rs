//! Rank/score read endpoints (C5-C8): cached repeater/observer rank,
//! meshscore, and the geoscore diagnostics surface.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use meshrank_geo::Gps;
use meshrank_protocol::{ExcludedRepeater, MeshScoreSeries, ObserverRankItem, RankCache, RankItem};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

fn snapshot<T>(slot: &std::sync::RwLock<Option<Arc<T>>>) -> Option<Arc<T>> {
    slot.read().expect("rank cache lock poisoned").clone()
}

/// An empty, well-typed cache used before the first refresh has landed
/// (§4.10): callers poll the same shape whether or not the cache is warm.
fn empty_rank_cache() -> RankCache {
    RankCache {
        updated_at: String::new(),
        count: 0,
        items: Vec::new(),
        excluded: Vec::new(),
    }
}

fn paginate<T: Clone>(items: &[T], skip: Option<usize>, limit: Option<usize>) -> Vec<T> {
    let skip = skip.unwrap_or(0);
    let page = items.iter().skip(skip);
    match limit {
        Some(limit) => page.take(limit).cloned().collect(),
        None => page.cloned().collect(),
    }
}

/// Schedules a force recompute without making the request wait on it.
fn trigger_background_refresh(state: &Arc<AppState>, kind: &'static str) {
    let state = state.clone();
    tokio::spawn(async move {
        match kind {
            "repeater" => crate::jobs::refresh_repeater_rank(&state).await,
            "observer" => crate::jobs::refresh_observer_rank(&state).await,
            _ => {}
        }
    });
}

#[derive(Debug, Deserialize, Default)]
pub struct RepeaterRankQuery {
    #[serde(default, rename = "_limit")]
    limit: Option<usize>,
    #[serde(default, rename = "_skip")]
    skip: Option<usize>,
    #[serde(default)]
    refresh: Option<u8>,
}

/// `GET /api/repeater-rank`: the full current repeater ranking (C5).
/// Never 404s: before the first refresh completes this returns an empty,
/// well-typed cache rather than holding the request open.
pub async fn repeater_rank(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RepeaterRankQuery>,
) -> AppResult<Json<RankCache>> {
    if query.refresh == Some(1) {
        trigger_background_refresh(&state, "repeater");
    }
    let cache = snapshot(&state.repeater_rank).map(|c| (*c).clone()).unwrap_or_else(empty_rank_cache);
    let items = paginate(&cache.items, query.skip, query.limit);
    Ok(Json(RankCache {
        updated_at: cache.updated_at,
        count: cache.count,
        items,
        excluded: cache.excluded,
    }))
}

#[derive(Debug, Serialize)]
pub struct RepeaterRankSummary {
    pub updated_at: String,
    pub count: usize,
}

/// `GET /api/repeater-rank-summary`: updated_at/count only, for cheap polling.
pub async fn repeater_rank_summary(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<RepeaterRankSummary>> {
    let cache = snapshot(&state.repeater_rank).map(|c| (*c).clone()).unwrap_or_else(empty_rank_cache);
    Ok(Json(RepeaterRankSummary {
        updated_at: cache.updated_at,
        count: cache.count,
    }))
}

/// `GET /api/repeater-rank-excluded`: repeaters dropped from the ranking
/// (phantoms, admin-excluded) along with the reason.
pub async fn repeater_rank_excluded(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<ExcludedRepeater>>> {
    let cache = snapshot(&state.repeater_rank).map(|c| (*c).clone()).unwrap_or_else(empty_rank_cache);
    Ok(Json(cache.excluded))
}

#[derive(Debug, Serialize)]
pub struct RankHistoryPoint {
    pub recorded_at: String,
    pub total: u32,
    pub active: u32,
    pub total24h: u32,
}

/// `GET /api/repeater-rank-history`: the last 200 recorded rank snapshots,
/// written whenever the cache refreshes (`repeater_rank_history` table).
pub async fn repeater_rank_history(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<RankHistoryPoint>>> {
    let storage = state.storage.clone();
    let points = tokio::task::spawn_blocking(move || -> Result<Vec<RankHistoryPoint>, crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let mut stmt = db.conn().prepare(
            "SELECT recorded_at, total, active, total24h FROM repeater_rank_history \
             ORDER BY recorded_at DESC LIMIT 200",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RankHistoryPoint {
                recorded_at: row.get(0)?,
                total: row.get(1)?,
                active: row.get(2)?,
                total24h: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    })
    .await
    .map_err(|e| AppError::Internal(format!("repeater_rank_history task panicked: {e}")))??;
    Ok(Json(points))
}

#[derive(Debug, Deserialize, Default)]
pub struct ObserverRankQuery {
    #[serde(default, rename = "_limit")]
    limit: Option<usize>,
    #[serde(default)]
    refresh: Option<u8>,
    /// Accepted for API compatibility; never honored; §4.10 forbids holding
    /// a request open while a cache warms up, so a caller that asks to wait
    /// still gets the current (possibly empty) snapshot immediately.
    #[serde(default)]
    #[allow(dead_code)]
    wait: Option<u8>,
}

/// `GET /api/observer-rank`: the full current observer ranking (C6). Never
/// 404s: before the first refresh completes this returns an empty list.
pub async fn observer_rank(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ObserverRankQuery>,
) -> AppResult<Json<Vec<ObserverRankItem>>> {
    if query.refresh == Some(1) {
        trigger_background_refresh(&state, "observer");
    }
    let items = snapshot(&state.observer_rank).map(|i| (*i).clone()).unwrap_or_default();
    Ok(Json(paginate(&items, None, query.limit)))
}

#[derive(Debug, Deserialize)]
pub struct NodeRankQuery {
    #[serde(rename = "pub")]
    pub_key: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum NodeRankResponse {
    Repeater(RankItem),
    Observer(ObserverRankItem),
}

/// `GET /api/node-rank?pub=...`: look a single node up across whichever
/// ranking it belongs to, repeater or observer.
pub async fn node_rank(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeRankQuery>,
) -> AppResult<Json<NodeRankResponse>> {
    if let Some(cache) = snapshot(&state.repeater_rank) {
        if let Some(item) = cache.items.iter().find(|i| i.pub_key == query.pub_key) {
            return Ok(Json(NodeRankResponse::Repeater(item.clone())));
        }
    }
    if let Some(items) = snapshot(&state.observer_rank) {
        if let Some(item) = items.iter().find(|i| i.observer_id == query.pub_key) {
            return Ok(Json(NodeRankResponse::Observer(item.clone())));
        }
    }
    Err(AppError::NotFound(format!("no rank entry for {}", query.pub_key)))
}

/// `GET /api/meshscore`: the rolling daily meshscore series (C7). Never
/// 404s: before the first refresh completes this returns a zeroed series.
pub async fn meshscore(State(state): State<Arc<AppState>>) -> AppResult<Json<MeshScoreSeries>> {
    let series = snapshot(&state.meshscore).map(|s| (*s).clone()).unwrap_or_else(|| MeshScoreSeries {
        current: 0.0,
        updated_at: String::new(),
        days: Vec::new(),
    });
    Ok(Json(series))
}

#[derive(Debug, Serialize)]
pub struct MeshLive {
    pub ingested_total: i64,
    pub repeaters_ranked: usize,
    pub observers_ranked: usize,
    pub uptime_secs: u64,
}

/// `GET /api/mesh-live`: a cheap liveness tile for the dashboard header.
pub async fn mesh_live(State(state): State<Arc<AppState>>) -> Json<MeshLive> {
    Json(MeshLive {
        ingested_total: state.ingested_total.load(std::sync::atomic::Ordering::Relaxed),
        repeaters_ranked: snapshot(&state.repeater_rank).map(|c| c.count).unwrap_or(0),
        observers_ranked: snapshot(&state.observer_rank).map(|i| i.len()).unwrap_or(0),
        uptime_secs: state.boot_time.elapsed().as_secs(),
    })
}

/// `GET /api/rf-latest`: the most recent messages across all channels, for
/// the raw-activity ticker.
pub async fn rf_latest(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<meshrank_protocol::MessageView>>> {
    const RF_LATEST_LIMIT: u32 = 50;
    let storage = state.storage.clone();
    let hits = state.observer_hits.snapshot();
    let devices = storage.read_devices()?;
    let views = tokio::task::spawn_blocking(move || -> Result<Vec<meshrank_protocol::MessageView>, crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let rows = crate::storage::messages::read_messages(db.conn(), None, RF_LATEST_LIMIT, None)?;
        let hashes: Vec<String> = rows.iter().map(|r| r.message_hash.clone()).collect();
        let agg = crate::storage::messages::read_message_observer_agg(db.conn(), &hashes)?;
        Ok(rows
            .iter()
            .map(|row| crate::assembler::assemble(row, agg.get(&row.message_hash), &hits, &devices))
            .collect())
    })
    .await
    .map_err(|e| AppError::Internal(format!("rf_latest task panicked: {e}")))??;
    Ok(Json(views))
}

#[derive(Debug, Serialize)]
pub struct GeoscoreStatus {
    pub enabled: bool,
    pub batch_size: usize,
    pub candidate_radius_km: f64,
    pub routes_resolved: u32,
    pub routes_unresolved: u32,
}

/// `GET /api/geoscore/status`: config plus resolved/unresolved route counts.
pub async fn geoscore_status(State(state): State<Arc<AppState>>) -> AppResult<Json<GeoscoreStatus>> {
    let storage = state.storage.clone();
    let (resolved, unresolved) = tokio::task::spawn_blocking(move || -> Result<(u32, u32), crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let resolved: u32 = db.conn().query_row(
            "SELECT count(*) FROM geoscore_routes WHERE unresolved = 0",
            [],
            |row| row.get(0),
        )?;
        let unresolved: u32 = db.conn().query_row(
            "SELECT count(*) FROM geoscore_routes WHERE unresolved = 1",
            [],
            |row| row.get(0),
        )?;
        Ok((resolved, unresolved))
    })
    .await
    .map_err(|e| AppError::Internal(format!("geoscore_status task panicked: {e}")))??;

    Ok(Json(GeoscoreStatus {
        enabled: state.config.geoscore.enabled,
        batch_size: state.config.geoscore.batch_size,
        candidate_radius_km: state.config.geoscore.candidate_radius_km,
        routes_resolved: resolved,
        routes_unresolved: unresolved,
    }))
}

#[derive(Debug, Serialize)]
pub struct GeoscoreRoute {
    pub msg_key: String,
    pub route_confidence: f64,
    pub unresolved: bool,
    pub max_teleport_km: Option<f64>,
    pub updated_at: String,
}

/// `GET /api/geoscore/diagnostics`: the last 100 inferred routes, newest first.
pub async fn geoscore_diagnostics(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<GeoscoreRoute>>> {
    let storage = state.storage.clone();
    let routes = tokio::task::spawn_blocking(move || -> Result<Vec<GeoscoreRoute>, crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let mut stmt = db.conn().prepare(
            "SELECT msg_key, route_confidence, unresolved, max_teleport_km, updated_at \
             FROM geoscore_routes ORDER BY updated_at DESC LIMIT 100",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(GeoscoreRoute {
                msg_key: row.get(0)?,
                route_confidence: row.get(1)?,
                unresolved: row.get::<_, i64>(2)? != 0,
                max_teleport_km: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    })
    .await
    .map_err(|e| AppError::Internal(format!("geoscore_diagnostics task panicked: {e}")))??;
    Ok(Json(routes))
}

#[derive(Debug, Serialize)]
pub struct GeoscoreObserverHome {
    pub observer_id: String,
    pub gps: Option<Gps>,
    pub source: String,
    pub updated_at: String,
}

/// `GET /api/geoscore/observers`: resolved observer "home" coordinates used
/// as anchors during route inference.
pub async fn geoscore_observers(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<GeoscoreObserverHome>>> {
    let storage = state.storage.clone();
    let homes = tokio::task::spawn_blocking(move || -> Result<Vec<GeoscoreObserverHome>, crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let mut stmt = db.conn().prepare(
            "SELECT observer_id, gps_lat, gps_lon, source, updated_at FROM geoscore_observer_homes \
             ORDER BY observer_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let lat: Option<f64> = row.get(1)?;
            let lon: Option<f64> = row.get(2)?;
            Ok(GeoscoreObserverHome {
                observer_id: row.get(0)?,
                gps: lat.zip(lon).map(|(lat, lon)| Gps { lat, lon }),
                source: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    })
    .await
    .map_err(|e| AppError::Internal(format!("geoscore_observers task panicked: {e}")))??;
    Ok(Json(homes))
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
    async fn repeater_rank_returns_empty_body_before_first_refresh() {
        let state = test_state();
        let Json(cache) = repeater_rank(State(state), Query(RepeaterRankQuery::default())).await.unwrap();
        assert_eq!(cache.count, 0);
        assert!(cache.items.is_empty());
    }

    #[tokio::test]
    async fn mesh_live_reports_zero_before_warmup() {
        let state = test_state();
        let Json(live) = mesh_live(State(state)).await;
        assert_eq!(live.ingested_total, 0);
        assert_eq!(live.repeaters_ranked, 0);
    }

    #[tokio::test]
    async fn geoscore_status_reports_config_and_zero_routes() {
        let state = test_state();
        let Json(status) = geoscore_status(State(state)).await.unwrap();
        assert_eq!(status.routes_resolved, 0);
        assert_eq!(status.routes_unresolved, 0);
    }
}
