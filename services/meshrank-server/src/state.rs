use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use meshrank_protocol::{MeshScoreSeries, ObserverRankItem, RankCache, SseEvent};
use tokio::sync::broadcast;

use crate::advert_stats::AdvertStatsIndex;
use crate::channel_cache::ChannelCache;
use crate::config::Config;
use crate::geoscore::InferenceQueue;
use crate::observer_hits::ObserverHitsIndex;
use crate::share::ShareRateLimiter;
use crate::storage::Storage;

const SSE_CHANNEL_CAPACITY: usize = 256;

/// Process-wide state, handed to every handler behind `Arc`. Each cache is
/// owned by the component that refreshes it; other components only ever
/// read a published snapshot.
pub struct AppState {
    pub config: Config,
    pub storage: Arc<Storage>,
    pub observer_hits: Arc<ObserverHitsIndex>,
    pub advert_stats: Arc<AdvertStatsIndex>,
    pub channel_cache: Arc<ChannelCache>,
    pub repeater_rank: RwLock<Option<Arc<RankCache>>>,
    pub observer_rank: RwLock<Option<Arc<Vec<ObserverRankItem>>>>,
    pub meshscore: RwLock<Option<Arc<MeshScoreSeries>>>,
    pub dashboard_tx: broadcast::Sender<SseEvent>,
    pub bot_tx: broadcast::Sender<SseEvent>,
    pub logger: Arc<meshrank_ui_log::UiLogger<SseEvent>>,
    pub boot_time: std::time::Instant,
    /// `true` once the 15-minute cache-warmup window (§4.8) has elapsed;
    /// scheduled refreshes before this are ignored.
    pub warmup_elapsed: AtomicBool,
    pub ingested_total: AtomicI64,
    pub share_rate_limiter: ShareRateLimiter,
    pub geoscore_queue: InferenceQueue,
    /// Last `message_observers` rowid folded into a broadcast `packet` event
    /// (§4.9); advanced by the dedicated 1s poller, independent of the
    /// `messages`-row cursor the channel cache tracks.
    pub message_observer_last_rowid: AtomicI64,
}

impl AppState {
    pub fn new(config: Config, storage: Storage, observer_hits_path: std::path::PathBuf) -> Self {
        let (dashboard_tx, _) = broadcast::channel(SSE_CHANNEL_CAPACITY);
        let (bot_tx, _) = broadcast::channel(SSE_CHANNEL_CAPACITY);
        let logger_tx = dashboard_tx.clone();
        let logger = meshrank_ui_log::UiLogger::with_buffer(
            logger_tx,
            |line| SseEvent::LogEntry { line },
            200,
        );
        let data_dir = observer_hits_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .to_path_buf();
        Self {
            config,
            storage: Arc::new(storage),
            advert_stats: Arc::new(AdvertStatsIndex::new(&data_dir)),
            observer_hits: Arc::new(ObserverHitsIndex::new(observer_hits_path)),
            channel_cache: Arc::new(ChannelCache::new(data_dir.join("decoded.ndjson"))),
            repeater_rank: RwLock::new(None),
            observer_rank: RwLock::new(None),
            meshscore: RwLock::new(None),
            dashboard_tx,
            bot_tx,
            logger: Arc::new(logger),
            boot_time: std::time::Instant::now(),
            warmup_elapsed: AtomicBool::new(false),
            ingested_total: AtomicI64::new(0),
            share_rate_limiter: ShareRateLimiter::default(),
            geoscore_queue: InferenceQueue::default(),
            message_observer_last_rowid: AtomicI64::new(0),
        }
    }

    pub fn publish_repeater_rank(&self, cache: RankCache) {
        *self.repeater_rank.write().expect("repeater rank lock poisoned") = Some(Arc::new(cache));
    }

    pub fn publish_observer_rank(&self, items: Vec<ObserverRankItem>) {
        *self.observer_rank.write().expect("observer rank lock poisoned") = Some(Arc::new(items));
    }

    pub fn publish_meshscore(&self, series: MeshScoreSeries) {
        *self.meshscore.write().expect("meshscore lock poisoned") = Some(Arc::new(series));
    }

    pub fn is_warmed_up(&self) -> bool {
        self.warmup_elapsed.load(Ordering::Acquire)
    }

    pub fn broadcast_dashboard(&self, event: SseEvent) {
        // Best-effort fan-out (§4.9): no subscribers is not an error.
        let _ = self.dashboard_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn test_state() -> AppState {
        let config = Config::from_env_with(|_| None).unwrap();
        let db = Db::open_in_memory(false).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(db, dir.path());
        AppState::new(config, storage, dir.path().join("observer.ndjson"))
    }

    #[test]
    fn starts_with_no_published_ranks() {
        let state = test_state();
        assert!(state.repeater_rank.read().unwrap().is_none());
    }

    #[test]
    fn publish_repeater_rank_makes_it_readable() {
        let state = test_state();
        state.publish_repeater_rank(RankCache {
            updated_at: "now".into(),
            count: 0,
            items: vec![],
            excluded: vec![],
        });
        assert!(state.repeater_rank.read().unwrap().is_some());
    }

    #[test]
    fn broadcast_with_no_subscribers_does_not_panic() {
        let state = test_state();
        state.broadcast_dashboard(SseEvent::Ping);
    }
}
