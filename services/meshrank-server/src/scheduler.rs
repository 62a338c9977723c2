//! Rank/score scheduler (C8): periodic refresh loops, deferred warmup, and
//! stampede guards. Spawned once at boot; every refresh is cheap to call
//! repeatedly because an in-flight guard collapses concurrent callers onto
//! the same result.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::state::AppState;

const CACHE_WARMUP_WINDOW: Duration = Duration::from_secs(15 * 60);
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const SCORE_UPDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const VISIBILITY_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const LIVE_MESSAGES_POLL_INTERVAL: Duration = Duration::from_millis(250);
const GEOSCORE_INFERENCE_INTERVAL: Duration = Duration::from_secs(2);
const MESSAGE_OBSERVER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const COUNTERS_BROADCAST_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_BROADCAST_INTERVAL: Duration = Duration::from_secs(12);

/// Stampede guard: a second caller arriving while a refresh is in flight
/// awaits the same future rather than starting a duplicate rebuild.
#[derive(Default)]
pub struct InFlightGuard {
    lock: Mutex<()>,
}

impl InFlightGuard {
    /// Runs `f` if no refresh is currently in flight; otherwise waits for
    /// the in-flight one to finish and returns without running `f` again,
    /// unless `force` is set.
    pub async fn run_guarded<F, Fut>(&self, force: bool, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if force {
            let _permit = self.lock.lock().await;
            f().await;
            return;
        }
        match self.lock.try_lock() {
            Ok(_permit) => f().await,
            Err(_) => tracing::debug!("refresh already in flight, skipping this tick"),
        }
    }
}

pub struct Scheduler {
    repeater_guard: InFlightGuard,
    observer_guard: InFlightGuard,
    meshscore_guard: InFlightGuard,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            repeater_guard: InFlightGuard::default(),
            observer_guard: InFlightGuard::default(),
            meshscore_guard: InFlightGuard::default(),
        }
    }
}

impl Scheduler {
    /// Spawns every boot-sequence and periodic task described in §4.8. The
    /// server binds and starts accepting requests before this is called;
    /// none of these tasks block the listener. Returns the handles of the
    /// long-running periodic loops so the caller can abort them on
    /// graceful shutdown instead of leaving them to be dropped mid-tick.
    pub fn spawn(self: Arc<Self>, state: Arc<AppState>) -> Vec<tokio::task::JoinHandle<()>> {
        spawn_db_warmup(state.clone());
        spawn_messages_cache_warmup(state.clone());
        spawn_persisted_cache_hydration(state.clone());
        spawn_warmup_timer(state.clone());
        spawn_observer_homes_rebuild(state.clone());
        vec![
            spawn_refresh_loop(self.clone(), state.clone()),
            spawn_score_update_loop(state.clone()),
            spawn_visibility_sweep(state.clone()),
            spawn_live_messages_poll(state.clone()),
            spawn_geoscore_inference(state.clone()),
            spawn_message_observer_poll(state.clone()),
            spawn_counters_broadcast(state.clone()),
            spawn_health_broadcast(state),
        ]
    }

    pub async fn refresh_repeater_rank(&self, state: &AppState, force: bool) {
        if !force && !state.is_warmed_up() {
            return;
        }
        self.repeater_guard
            .run_guarded(force, || async {
                crate::jobs::refresh_repeater_rank(state).await;
            })
            .await;
    }

    pub async fn refresh_observer_rank(&self, state: &AppState, force: bool) {
        if !force && !state.is_warmed_up() {
            return;
        }
        self.observer_guard
            .run_guarded(force, || async {
                crate::jobs::refresh_observer_rank(state).await;
            })
            .await;
    }

    pub async fn refresh_meshscore(&self, state: &AppState, force: bool) {
        if !force && !state.is_warmed_up() {
            return;
        }
        self.meshscore_guard
            .run_guarded(force, || async {
                crate::jobs::refresh_meshscore(state).await;
            })
            .await;
    }
}

fn spawn_db_warmup(state: Arc<AppState>) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let storage = state.storage.clone();
        let _ = tokio::task::spawn_blocking(move || storage.read_devices()).await;
        tracing::info!("db warm-up complete");
    });
}

fn spawn_messages_cache_warmup(state: Arc<AppState>) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        loop {
            if crate::jobs::build_channel_cache(&state).await {
                tracing::info!("channel message cache built");
                break;
            }
            tokio::time::sleep(Duration::from_secs(15)).await;
        }
    });
}

fn spawn_persisted_cache_hydration(state: Arc<AppState>) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        crate::jobs::hydrate_persisted_caches(&state).await;
        tracing::info!("persisted rank caches hydrated");
    });
}

fn spawn_warmup_timer(state: Arc<AppState>) {
    tokio::spawn(async move {
        tokio::time::sleep(CACHE_WARMUP_WINDOW).await;
        state.warmup_elapsed.store(true, Ordering::Release);
        tracing::info!("cache warmup window elapsed, periodic refreshes now active");
    });
}

fn spawn_refresh_loop(scheduler: Arc<Scheduler>, state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            scheduler.refresh_repeater_rank(&state, false).await;
            scheduler.refresh_meshscore(&state, false).await;
            scheduler.refresh_observer_rank(&state, false).await;
        }
    })
}

fn spawn_score_update_loop(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let mut interval = tokio::time::interval(SCORE_UPDATE_INTERVAL);
        loop {
            interval.tick().await;
            crate::jobs::update_stored_repeater_scores(&state).await;
        }
    })
}

fn spawn_visibility_sweep(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(VISIBILITY_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            crate::jobs::sweep_repeater_visibility(&state).await;
        }
    })
}

fn spawn_live_messages_poll(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LIVE_MESSAGES_POLL_INTERVAL);
        loop {
            interval.tick().await;
            crate::jobs::poll_live_messages(&state).await;
        }
    })
}

fn spawn_geoscore_inference(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !state.config.geoscore.enabled {
            return;
        }
        let mut interval = tokio::time::interval(GEOSCORE_INFERENCE_INTERVAL);
        loop {
            interval.tick().await;
            crate::jobs::run_geoscore_inference(&state).await;
        }
    })
}

/// §4.9's distinct 1s poll over `message_observers`, separate from the
/// 250ms `messages` poll above: collapses new observer-hit rows into
/// aggregated `packet` events.
fn spawn_message_observer_poll(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MESSAGE_OBSERVER_POLL_INTERVAL);
        loop {
            interval.tick().await;
            crate::jobs::poll_message_observer_stream(&state).await;
        }
    })
}

fn spawn_counters_broadcast(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(COUNTERS_BROADCAST_INTERVAL);
        loop {
            interval.tick().await;
            crate::jobs::broadcast_counters(&state).await;
        }
    })
}

fn spawn_health_broadcast(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_BROADCAST_INTERVAL);
        loop {
            interval.tick().await;
            crate::jobs::broadcast_health(&state).await;
        }
    })
}

fn spawn_observer_homes_rebuild(state: Arc<AppState>) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        crate::jobs::rebuild_observer_homes(&state).await;
        tracing::info!("observer-home table rebuilt");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[tokio::test]
    async fn in_flight_guard_collapses_concurrent_callers() {
        let guard = Arc::new(InFlightGuard::default());
        let calls = Arc::new(AtomicU32::new(0));

        let g1 = guard.clone();
        let c1 = calls.clone();
        let h1 = tokio::spawn(async move {
            g1.run_guarded(false, || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                c1.fetch_add(1, AtomicOrdering::SeqCst);
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(5)).await;

        let g2 = guard.clone();
        let c2 = calls.clone();
        let h2 = tokio::spawn(async move {
            g2.run_guarded(false, || async {
                c2.fetch_add(1, AtomicOrdering::SeqCst);
            })
            .await;
        });

        h1.await.unwrap();
        h2.await.unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_bypasses_in_flight_skip() {
        let guard = InFlightGuard::default();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        guard.run_guarded(true, || async move {
            c.fetch_add(1, AtomicOrdering::SeqCst);
        })
        .await;
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }
}
