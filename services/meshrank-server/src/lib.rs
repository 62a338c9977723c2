pub mod advert_stats;
pub mod assembler;
pub mod auth;
pub mod channel_cache;
pub mod config;
pub mod db;
pub mod error;
pub mod geoscore;
pub mod http;
pub mod jobs;
pub mod ndjson;
pub mod observer_hits;
pub mod rank;
pub mod scheduler;
pub mod share;
pub mod sse;
pub mod state;
pub mod storage;

use std::sync::Arc;

use axum::Router;

use config::Config;
use db::Db;
use scheduler::Scheduler;
use state::AppState;
use storage::Storage;

/// Open storage, build process state, and spawn the scheduler, returning the
/// router `main` hands to `axum::serve` plus the scheduler's periodic-loop
/// handles so `main` can abort them on graceful shutdown. Split out of
/// `main` so integration tests can build the same router without going
/// through env parsing.
pub fn build(config: Config) -> (Arc<AppState>, Router, Vec<tokio::task::JoinHandle<()>>) {
    let db = Db::open(&config.db_path, config.debug_sql).expect("failed to open database");

    // Stale in-flight markers from an unclean shutdown would otherwise wedge
    // the next visibility sweep; clear them before anything reads the table.
    db.conn()
        .execute("UPDATE current_repeaters SET visible = 0 WHERE is_live = 1", [])
        .expect("failed to reset stale repeater liveness");

    let observer_hits_path = config.data_dir.join("observer.ndjson");
    let storage = Storage::new(db, &config.data_dir);
    let state = Arc::new(AppState::new(config, storage, observer_hits_path));

    let task_handles = Arc::new(Scheduler::default()).spawn(state.clone());

    let router = http::build_router(state.clone());
    (state, router, task_handles)
}
