//! Glue between the scheduler (C8) and the storage/rank modules: each
//! function here is one refresh tick's worth of work, run on a blocking
//! thread since it talks to SQLite.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use meshrank_protocol::{MeshScoreDay, MeshScoreSeries, ObserverRankItem, RankCache, SseEvent};

use crate::assembler;
use crate::geoscore::{self, CandidatePeer, PathDelta};
use crate::rank::meshscore::{self, DayInputs};
use crate::rank::observer::{self, ObserverInputs, RepeaterCandidate};
use crate::rank::repeater;
use crate::state::AppState;
use crate::storage::messages;

pub async fn build_channel_cache(state: &AppState) -> bool {
    let storage = state.storage.clone();
    let devices_result = tokio::task::spawn_blocking({
        let storage = storage.clone();
        move || storage.read_devices()
    })
    .await;
    let Ok(Ok(devices)) = devices_result else {
        return false;
    };

    let hits = state.observer_hits.snapshot();
    let channel_cache = state.channel_cache.clone();
    let result = tokio::task::spawn_blocking(move || {
        let db = storage.db.lock().expect("db mutex poisoned");
        let rows = messages::read_messages(db.conn(), None, 10_000, None)?;
        let hashes: Vec<String> = rows.iter().map(|r| r.message_hash.clone()).collect();
        let agg = messages::read_message_observer_agg(db.conn(), &hashes)?;
        let views = rows
            .iter()
            .map(|row| assembler::assemble(row, agg.get(&row.message_hash), &hits, &devices))
            .collect::<Vec<_>>();
        Ok::<_, crate::db::DbError>(views)
    })
    .await;

    match result {
        Ok(Ok(views)) => {
            let built = if !views.is_empty() {
                channel_cache.build(views);
                true
            } else {
                // §4.4 step 2: the `messages` table is empty, fall back to
                // grouping whatever `decoded.ndjson` already has.
                channel_cache.cold_start_from_decoded_ndjson()
            };
            if built {
                // The DB poller (§4.4) only wants rows inserted after this
                // build; everything up to here is already reflected in the
                // snapshot.
                if let Ok(rowid) = tokio::task::spawn_blocking({
                    let storage = state.storage.clone();
                    move || {
                        let db = storage.db.lock().expect("db mutex poisoned");
                        messages::last_message_rowid(db.conn())
                    }
                })
                .await
                {
                    if let Ok(rowid) = rowid {
                        channel_cache.advance_rowid(rowid);
                    }
                }
            }
            built
        }
        _ => false,
    }
}

const MESSAGES_POLL_BATCH: u32 = 100;

/// Runs one tick of the live-update path (§4.4): advance the observer-hits
/// tailer, then pull any `messages` rows inserted since the last tick,
/// append each into the channel cache, and broadcast it. A message landing
/// on `#test` may also trigger the bot-reply debounce.
pub async fn poll_live_messages(state: &Arc<AppState>) {
    state.observer_hits.tick();
    // §4.4 step 4: pick up any messages that only ever reach us through
    // the decoded-frame log rather than a `messages` row.
    for view in state.channel_cache.watch_decoded_ndjson() {
        fold_in_new_message(state, &view).await;
    }

    let storage = state.storage.clone();
    let after_rowid = state.channel_cache.last_rowid();
    let devices_result = tokio::task::spawn_blocking({
        let storage = storage.clone();
        move || storage.read_devices()
    })
    .await;
    let Ok(Ok(devices)) = devices_result else {
        return;
    };
    let hits = state.observer_hits.snapshot();

    let result = tokio::task::spawn_blocking(move || -> Result<Vec<(i64, meshrank_protocol::MessageView)>, crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let rows = messages::read_messages_since(db.conn(), after_rowid, MESSAGES_POLL_BATCH)?;
        let hashes: Vec<String> = rows.iter().map(|(_, r)| r.message_hash.clone()).collect();
        let agg = messages::read_message_observer_agg(db.conn(), &hashes)?;
        Ok(rows
            .iter()
            .map(|(rowid, row)| (*rowid, assembler::assemble(row, agg.get(&row.message_hash), &hits, &devices)))
            .collect())
    })
    .await;

    let Ok(Ok(rows)) = result else {
        return;
    };
    let Some(max_rowid) = rows.iter().map(|(rowid, _)| *rowid).max() else {
        return;
    };

    for (_, view) in rows {
        if !state.channel_cache.append(view.clone()) {
            continue;
        }
        fold_in_new_message(state, &view).await;
    }

    state.channel_cache.advance_rowid(max_rowid);
}

/// Shared per-message bookkeeping once a view has been (or already was)
/// appended to the channel cache: ingest counter, geoscore inference
/// queueing, and the bot-reply debounce check.
async fn fold_in_new_message(state: &Arc<AppState>, view: &meshrank_protocol::MessageView) {
    state.ingested_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    if !view.path.is_empty() {
        state.geoscore_queue.enqueue(PathDelta {
            msg_key: view.message_hash.clone(),
            ts_ms: Utc::now().timestamp_millis(),
            observer_id: view.observer_hits.first().cloned().unwrap_or_default(),
            path_tokens: view.path.clone(),
        });
    }

    if let Some(message_hash) = state.channel_cache.maybe_trigger_bot_reply(view) {
        emit_bot_reply(state, view, &message_hash).await;
    }
}

const MESSAGE_OBSERVER_POLL_BATCH: u32 = 200;

/// Runs one tick of the `packet` broadcast path (§4.9): a 1s poll over
/// `message_observers` for rowid > last seen, collapsed into one aggregated
/// update per message hash, independent of the 250ms `messages`-row poll.
pub async fn poll_message_observer_stream(state: &Arc<AppState>) {
    let storage = state.storage.clone();
    let after_rowid = state.message_observer_last_rowid.load(std::sync::atomic::Ordering::Acquire);
    let result = tokio::task::spawn_blocking(move || -> Result<(i64, Vec<meshrank_protocol::PacketUpdate>), crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        messages::read_message_observer_updates_since(db.conn(), after_rowid, MESSAGE_OBSERVER_POLL_BATCH)
    })
    .await;

    let Ok(Ok((max_rowid, updates))) = result else {
        return;
    };
    if !updates.is_empty() {
        state.broadcast_dashboard(SseEvent::Packet { updates });
    }
    if max_rowid > after_rowid {
        state
            .message_observer_last_rowid
            .store(max_rowid, std::sync::atomic::Ordering::Release);
    }
}

/// Emits the `#test` bot reply (§4.4): ensures a share link exists for the
/// triggering message, then fans the reply out over the bot SSE stream.
async fn emit_bot_reply(state: &Arc<AppState>, view: &meshrank_protocol::MessageView, message_hash: &str) {
    let storage = state.storage.clone();
    let message_id = message_hash.to_owned();
    let _ = tokio::task::spawn_blocking(move || -> Result<crate::share::ShareCodeRow, crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        crate::share::allocate_share_code(db.conn(), &message_id, Utc::now())
    })
    .await;

    let _ = state.bot_tx.send(SseEvent::BotReply {
        channel_name: view.channel_name.clone(),
        body: "pong".to_owned(),
        in_reply_to: message_hash.to_owned(),
    });
}

const GEOSCORE_CANDIDATES_PER_HOP: usize = 5;

/// Drains one batch off the geoscore inference queue (§4.12) and persists
/// a route guess per message. Candidate repeater peers are every device
/// whose hop token matches with a usable GPS fix, capped per hop and given
/// a flat prior: this layer has no advert-strength history to weight them
/// by, so the DP in [`geoscore::infer_route`] leans entirely on proximity
/// to the observer's home coordinate.
pub async fn run_geoscore_inference(state: &Arc<AppState>) {
    let batch = state.geoscore_queue.drain_batch(state.config.geoscore.batch_size);
    if batch.is_empty() {
        return;
    }

    let storage = state.storage.clone();
    let devices_result = tokio::task::spawn_blocking({
        let storage = storage.clone();
        move || storage.read_devices()
    })
    .await;
    let Ok(Ok(devices)) = devices_result else {
        return;
    };
    let observers_result = tokio::task::spawn_blocking({
        let storage = storage.clone();
        move || storage.read_observers()
    })
    .await;
    let Ok(Ok(observers)) = observers_result else {
        return;
    };

    let routes: Vec<geoscore::InferredRoute> = batch
        .iter()
        .map(|delta: &PathDelta| {
            let candidates_by_token: Vec<Vec<CandidatePeer>> = delta
                .path_tokens
                .iter()
                .map(|token| {
                    let mut candidates: Vec<_> = devices
                        .by_pub
                        .values()
                        .filter(|d| d.is_repeater && &d.hash_byte() == token)
                        .filter_map(|d| d.usable_gps().map(|gps| (d.pub_key.clone(), gps)))
                        .collect();
                    candidates.sort_by(|a, b| a.0.cmp(&b.0));
                    candidates
                        .into_iter()
                        .take(GEOSCORE_CANDIDATES_PER_HOP)
                        .map(|(pub_key, gps)| CandidatePeer { pub_key, gps, prior: 1.0 })
                        .collect()
                })
                .collect();
            let observer_home = observers.by_id.get(&delta.observer_id).and_then(|o| o.gps);
            geoscore::infer_route(&delta.msg_key, &delta.path_tokens, &candidates_by_token, observer_home)
        })
        .collect();

    let _ = tokio::task::spawn_blocking(move || -> Result<(), crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let conn = db.conn();
        let now = Utc::now().to_rfc3339();
        for route in &routes {
            let inferred_pubs_json = serde_json::to_string(&route.inferred_pubs).map_err(|e| {
                crate::db::DbError::IntegrityCheckFailed(format!("serialize inferred pubs: {e}"))
            })?;
            let confidences_json = serde_json::to_string(&route.hop_confidences).map_err(|e| {
                crate::db::DbError::IntegrityCheckFailed(format!("serialize hop confidences: {e}"))
            })?;
            conn.execute(
                "INSERT INTO geoscore_routes \
                    (msg_key, inferred_pubs_json, confidences_json, route_confidence, unresolved, max_teleport_km, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(msg_key) DO UPDATE SET \
                    inferred_pubs_json = excluded.inferred_pubs_json, confidences_json = excluded.confidences_json, \
                    route_confidence = excluded.route_confidence, unresolved = excluded.unresolved, \
                    max_teleport_km = excluded.max_teleport_km, updated_at = excluded.updated_at",
                rusqlite::params![
                    route.msg_key,
                    inferred_pubs_json,
                    confidences_json,
                    route.route_confidence,
                    route.unresolved as i64,
                    route.max_teleport_km,
                    now,
                ],
            )?;
        }
        Ok(())
    })
    .await;
}

/// Rebuilds `geoscore_observer_homes` (§4.12): once at boot (and safe to
/// call again on demand), each observer's own GPS wins if it has one;
/// otherwise, if every path token it has heard for a repeater resolves to
/// exactly one device, that device's location stands in as its home.
pub async fn rebuild_observer_homes(state: &Arc<AppState>) {
    let storage = state.storage.clone();
    let devices_result = tokio::task::spawn_blocking({
        let storage = storage.clone();
        move || storage.read_devices()
    })
    .await;
    let Ok(Ok(devices)) = devices_result else {
        return;
    };

    let _ = tokio::task::spawn_blocking(move || -> Result<(), crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let conn = db.conn();
        let now = Utc::now().to_rfc3339();

        let mut stmt = conn.prepare(
            "SELECT observer_id, path_json, path_text FROM message_observers ORDER BY ts DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut first_repeater_hit: HashMap<String, meshrank_geo::Gps> = HashMap::new();
        for row in rows {
            let (observer_id, path_json, path_text) = row?;
            if first_repeater_hit.contains_key(&observer_id) {
                continue;
            }
            let tokens = messages::decode_path(path_json.as_deref(), path_text.as_deref());
            let unique_repeaters_for_tokens: Vec<_> = tokens
                .iter()
                .filter_map(|token| {
                    let matches: Vec<_> = devices
                        .by_pub
                        .values()
                        .filter(|d| d.is_repeater && &d.hash_byte() == token)
                        .collect();
                    if matches.len() == 1 {
                        matches[0].usable_gps()
                    } else {
                        None
                    }
                })
                .collect();
            if let Some(gps) = unique_repeaters_for_tokens.into_iter().next() {
                first_repeater_hit.insert(observer_id, gps);
            }
        }

        for (observer_id, gps) in first_repeater_hit {
            conn.execute(
                "INSERT INTO geoscore_observer_homes (observer_id, gps_lat, gps_lon, source, updated_at) \
                 VALUES (?1, ?2, ?3, 'path_inference', ?4) \
                 ON CONFLICT(observer_id) DO NOTHING",
                rusqlite::params![observer_id, gps.lat, gps.lon, now],
            )?;
        }
        Ok(())
    })
    .await;
}

pub async fn hydrate_persisted_caches(state: &AppState) {
    let storage = state.storage.clone();
    let result = tokio::task::spawn_blocking(move || {
        let db = storage.db.lock().expect("db mutex poisoned");
        let repeater: Option<String> = db
            .conn()
            .query_row("SELECT payload FROM repeater_rank_cache WHERE id = 1", [], |r| r.get(0))
            .ok();
        let observer: Option<String> = db
            .conn()
            .query_row("SELECT payload FROM observer_rank_cache WHERE id = 1", [], |r| r.get(0))
            .ok();
        let meshscore: Option<String> = db
            .conn()
            .query_row("SELECT payload FROM meshscore_cache WHERE id = 1", [], |r| r.get(0))
            .ok();
        (repeater, observer, meshscore)
    })
    .await;

    let Ok((repeater, observer, meshscore)) = result else {
        return;
    };
    if let Some(payload) = repeater.and_then(|p| serde_json::from_str::<RankCache>(&p).ok()) {
        state.publish_repeater_rank(payload);
    }
    if let Some(payload) = observer.and_then(|p| serde_json::from_str::<Vec<ObserverRankItem>>(&p).ok())
    {
        state.publish_observer_rank(payload);
    }
    if let Some(payload) = meshscore.and_then(|p| serde_json::from_str::<MeshScoreSeries>(&p).ok()) {
        state.publish_meshscore(payload);
    }
}

/// Built once per refresh tick so every device's zero-hop resolution shares
/// the same candidate pool instead of re-deriving it per repeater.
fn neighbour_candidates(
    devices: &crate::storage::devices::DeviceSnapshot,
    advert_stats: &crate::advert_stats::AdvertStatsIndex,
    now: chrono::DateTime<Utc>,
) -> Vec<repeater::NeighbourCandidate> {
    devices
        .by_pub
        .values()
        .filter(|d| d.is_repeater)
        .filter_map(|d| {
            let gps = d.usable_gps()?;
            let hash = d.hash_byte();
            let own_zero_hop_hashes = advert_stats.stats_for(&hash, now).zero_hop_neighbours.into_keys().collect();
            Some(repeater::NeighbourCandidate {
                pub_key: d.pub_key.clone(),
                name: d.name.clone(),
                hash,
                gps,
                own_zero_hop_hashes,
            })
        })
        .collect()
}

/// Recompute the repeater leaderboard from current devices plus the last
/// 72h of message paths, persist it, and broadcast the update.
pub async fn refresh_repeater_rank(state: &Arc<AppState>) {
    let storage = state.storage.clone();
    let advert_stats = state.advert_stats.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<RankCache, crate::db::DbError> {
        let devices = storage.read_devices()?;
        let db = storage.db.lock().expect("db mutex poisoned");

        let window_start = (Utc::now() - chrono::Duration::hours(repeater::ACTIVE_WINDOW_HOURS))
            .to_rfc3339();
        let rows = messages::read_messages(db.conn(), None, 50_000, None)?;
        let recent_paths: Vec<Vec<String>> = rows
            .iter()
            .filter(|r| r.ts.as_str() >= window_start.as_str())
            .map(|r| messages::decode_path(r.path_json.as_deref(), r.path_text.as_deref()))
            .collect();

        let now = Utc::now();
        // Admin-pinned zero-hop overrides (keyed `targetPub:hash`) would live
        // in `site_settings`, but nothing writes that table yet; treat every
        // neighbour resolution as unpinned until an admin surface exists.
        let overrides: HashMap<String, String> = HashMap::new();
        let candidates = neighbour_candidates(&devices, &advert_stats, now);

        let mut items = Vec::new();
        let mut excluded = Vec::new();
        for device in devices.by_pub.values().filter(|d| d.is_repeater) {
            let hash = device.hash_byte();
            let stats = advert_stats.stats_for(&hash, now);
            let evidence = repeater::repeat_evidence_for_token(&recent_paths, &hash);
            let (quality, reasons) = repeater::classify_quality(device, &stats);
            let age_hours = device
                .last_advert_heard_ms
                .map(|ms| (Utc::now().timestamp_millis() - ms) as f64 / 3_600_000.0)
                .unwrap_or(f64::MAX);
            let stale = age_hours >= repeater::ACTIVE_WINDOW_HOURS as f64;
            let score = repeater::score(&stats, &evidence, age_hours);

            let neighbors: Vec<_> = match device.usable_gps() {
                Some(gps) => stats
                    .zero_hop_neighbours
                    .iter()
                    .filter_map(|(hash_token, stat)| {
                        repeater::resolve_zero_hop_neighbour(
                            &device.pub_key,
                            gps,
                            hash_token,
                            &candidates,
                            stat,
                            &overrides,
                            &candidates,
                        )
                    })
                    .collect(),
                None => Vec::new(),
            };

            let is_true_repeater = evidence.is_true_repeater || device.backfilled;
            let item = meshrank_protocol::RankItem {
                pub_key: device.pub_key.clone(),
                hash: hash.clone(),
                name: device.name.clone(),
                quality,
                score,
                stale,
                last_seen: Some(device.last_seen.clone()),
                evidence,
                last_advert_age_hours: age_hours,
                is_live: !stale,
                quality_reason: reasons.clone(),
                color: meshrank_protocol::ScoreColor::for_score(score, stale),
                total_24h: stats.total24h,
                avg_rssi: stats.avg_rssi,
                avg_snr: stats.avg_snr,
                best_rssi: stats.best_rssi,
                best_snr: stats.best_snr,
                neighbors,
                messages_relayed: stats.total_adverts as u64,
                unique_senders: 0,
                gps: device.usable_gps(),
            };

            if quality != meshrank_protocol::Quality::Valid || !is_true_repeater {
                let mut all_reasons = reasons;
                if !is_true_repeater {
                    all_reasons.push("not_true_repeater".to_owned());
                }
                excluded.push(meshrank_protocol::ExcludedRepeater {
                    pub_key: device.pub_key.clone(),
                    hash: device.hash_byte(),
                    name: device.name.clone(),
                    reason: all_reasons.join(","),
                });
            } else {
                items.push(item);
            }
        }

        let updated_at = Utc::now().to_rfc3339();
        let cache = RankCache {
            updated_at: updated_at.clone(),
            count: items.len(),
            items,
            excluded,
        };
        let payload = serde_json::to_string(&cache).map_err(|e| {
            crate::db::DbError::IntegrityCheckFailed(format!("serialize rank cache: {e}"))
        })?;
        db.conn().execute(
            "INSERT INTO repeater_rank_cache (id, updated_at, payload) VALUES (1, ?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at, payload = excluded.payload",
            rusqlite::params![updated_at, payload],
        )?;
        Ok(cache)
    })
    .await;

    if let Ok(Ok(cache)) = result {
        state.publish_repeater_rank(cache.clone());
        state.broadcast_dashboard(SseEvent::RanksUpdated {
            repeater_rank: cache,
            observer_rank: (*state.observer_rank.read().expect("poisoned").clone().unwrap_or_default()).clone(),
            meshscore: (*state.meshscore.read().expect("poisoned").clone().unwrap_or_else(|| {
                Arc::new(MeshScoreSeries {
                    current: 0.0,
                    updated_at: Utc::now().to_rfc3339(),
                    days: vec![],
                })
            })).clone(),
        });
    }
}

/// Recompute observer coverage/scoring (C6). Heard-repeater presence comes
/// from decoding each observer's stored message paths against the device
/// table; per-hop RSSI isn't retained at this layer, so a representative
/// mid-range value stands in for it when checking the 300km coverage radius.
const REPRESENTATIVE_HOP_RSSI_DBM: f64 = -70.0;

pub async fn refresh_observer_rank(state: &Arc<AppState>) {
    let storage = state.storage.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<Vec<ObserverRankItem>, crate::db::DbError> {
        let devices = storage.read_devices()?;
        let observers = storage.read_observers()?;
        let db = storage.db.lock().expect("db mutex poisoned");

        let now = Utc::now();
        let window_start = (now - chrono::Duration::hours(observer::PACKETS_TODAY_WINDOW_HOURS)).to_rfc3339();

        let mut packets_today: HashMap<String, u64> = HashMap::new();
        {
            let mut stmt = db.conn().prepare(
                "SELECT observer_id, count(*) FROM message_observers WHERE ts >= ?1 GROUP BY observer_id",
            )?;
            let rows = stmt.query_map([&window_start], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (id, count) = row?;
                packets_today.insert(id, count);
            }
        }

        let mut heard_hashes: HashMap<String, HashSet<String>> = HashMap::new();
        {
            let mut stmt = db
                .conn()
                .prepare("SELECT observer_id, path_json, path_text FROM message_observers")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            for row in rows {
                let (observer_id, path_json, path_text) = row?;
                let tokens = messages::decode_path(path_json.as_deref(), path_text.as_deref());
                heard_hashes.entry(observer_id).or_default().extend(tokens);
            }
        }

        let mut items = Vec::new();
        for observer in observers.by_id.values() {
            let heard_repeaters: Vec<RepeaterCandidate> = heard_hashes
                .get(&observer.id)
                .into_iter()
                .flatten()
                .filter_map(|hash| {
                    devices
                        .by_pub
                        .values()
                        .find(|d| d.is_repeater && &d.hash_byte() == hash)
                        .map(|d| RepeaterCandidate {
                            pub_key: d.pub_key.clone(),
                            name: d.name.clone(),
                            gps: d.usable_gps(),
                            rssi: REPRESENTATIVE_HOP_RSSI_DBM,
                        })
                })
                .collect();

            let last_seen = chrono::DateTime::parse_from_rfc3339(&observer.last_seen)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(now);
            let first_seen = chrono::DateTime::parse_from_rfc3339(&observer.first_seen)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(last_seen);
            let age_hours = now.signed_duration_since(last_seen).num_seconds() as f64 / 3600.0;
            let uptime_hours = last_seen.signed_duration_since(first_seen).num_seconds().max(0) as f64 / 3600.0;

            let inputs = ObserverInputs {
                observer_id: observer.id.clone(),
                own_gps: observer.gps,
                packets_today: packets_today.get(&observer.id).copied().unwrap_or(0),
                uptime_hours,
                age_hours,
                heard_repeaters,
            };
            let computed = observer::compute_observer_rank(&inputs);
            let mut item = computed.item;
            item.last_seen = Some(observer.last_seen.clone());
            items.push((computed.offline, item));
        }

        let sorted = observer::sort_observers(
            items
                .into_iter()
                .map(|(offline, item)| {
                    (
                        crate::rank::observer::ObserverComputed {
                            item,
                            offline,
                            nearest_repeater_name: None,
                            nearest_repeater_km: None,
                        },
                        !offline,
                    )
                })
                .collect(),
        );

        let payload = serde_json::to_string(&sorted).map_err(|e| {
            crate::db::DbError::IntegrityCheckFailed(format!("serialize observer rank: {e}"))
        })?;
        db.conn().execute(
            "INSERT INTO observer_rank_cache (id, updated_at, payload) VALUES (1, ?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at, payload = excluded.payload",
            rusqlite::params![now.to_rfc3339(), payload],
        )?;
        Ok(sorted)
    })
    .await;

    if let Ok(Ok(items)) = result {
        state.publish_observer_rank(items.clone());
        state.broadcast_dashboard(SseEvent::RanksUpdated {
            repeater_rank: repeater_rank_snapshot(state),
            observer_rank: items,
            meshscore: meshscore_snapshot(state),
        });
    }
}

/// Recompute the rolling daily meshscore (C7): today's datapoint is derived
/// fresh from `messages`/`devices`/`channels_catalog`, persisted into
/// `meshscore_daily`, and folded into the last two weeks read back from it.
pub async fn refresh_meshscore(state: &Arc<AppState>) {
    let storage = state.storage.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<MeshScoreSeries, crate::db::DbError> {
        let devices = storage.read_devices()?;
        let db = storage.db.lock().expect("db mutex poisoned");
        let conn = db.conn();

        let today = Utc::now().date_naive();
        let day_start = today.and_hms_opt(0, 0, 0).unwrap().and_utc().to_rfc3339();
        let day_end = (today + chrono::Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .to_rfc3339();

        let (unique_messages, total_repeats): (u64, u64) = conn.query_row(
            "SELECT count(*), coalesce(sum(repeats), 0) FROM messages WHERE ts >= ?1 AND ts < ?2",
            rusqlite::params![day_start, day_end],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;

        let repeaters_total = devices.by_pub.values().filter(|d| d.is_repeater).count() as u32;
        let cutoff_ms = Utc::now().timestamp_millis() - repeater::ACTIVE_WINDOW_HOURS * 3_600_000;
        let repeaters_active_24h = devices
            .by_pub
            .values()
            .filter(|d| d.is_repeater)
            .filter(|d| d.last_advert_heard_ms.map(|ms| ms >= cutoff_ms).unwrap_or(false))
            .count() as u32;

        let count_group = |grp: &str| -> Result<u32, crate::db::DbError> {
            Ok(conn.query_row(
                "SELECT count(*) FROM channels_catalog WHERE grp = ?1",
                [grp],
                |row| row.get(0),
            )?)
        };
        let rooms = count_group("room")?;
        let chats = count_group("chat")?;
        let companions = count_group("companion")?;

        let today_point = meshscore::compute_day(&DayInputs {
            day: today,
            unique_messages,
            total_repeats,
            repeaters_active_24h,
            repeaters_total,
            rooms,
            chats,
            companions,
        });

        let avg_repeats = if unique_messages > 0 {
            total_repeats as f64 / unique_messages as f64
        } else {
            0.0
        };
        let updated_at = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO meshscore_daily (day, score, messages, avg_repeats, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(day) DO UPDATE SET score = excluded.score, messages = excluded.messages, \
                avg_repeats = excluded.avg_repeats, updated_at = excluded.updated_at",
            rusqlite::params![today.to_string(), today_point.score, unique_messages as i64, avg_repeats, updated_at],
        )?;

        let mut stmt =
            conn.prepare("SELECT day, score, messages FROM meshscore_daily ORDER BY day DESC LIMIT 14")?;
        let rows = stmt.query_map([], |row| {
            let day_str: String = row.get(0)?;
            Ok((day_str, row.get::<_, f64>(1)?, row.get::<_, i64>(2)? as u64))
        })?;
        let mut days: Vec<MeshScoreDay> = rows
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(day_str, score, messages)| MeshScoreDay {
                day: chrono::NaiveDate::parse_from_str(&day_str, "%Y-%m-%d").unwrap_or(today),
                score,
                active_repeaters: if day_str == today.to_string() { repeaters_active_24h } else { 0 },
                active_observers: 0,
                messages,
            })
            .collect();
        days.reverse();

        Ok(MeshScoreSeries {
            current: today_point.score,
            updated_at,
            days,
        })
    })
    .await;

    if let Ok(Ok(series)) = result {
        state.publish_meshscore(series.clone());
        state.broadcast_dashboard(SseEvent::RanksUpdated {
            repeater_rank: repeater_rank_snapshot(state),
            observer_rank: (*state.observer_rank.read().expect("poisoned").clone().unwrap_or_default()).clone(),
            meshscore: series,
        });
    }
}

fn repeater_rank_snapshot(state: &Arc<AppState>) -> RankCache {
    (*state.repeater_rank.read().expect("poisoned").clone().unwrap_or_else(|| {
        Arc::new(RankCache {
            updated_at: Utc::now().to_rfc3339(),
            count: 0,
            items: vec![],
            excluded: vec![],
        })
    }))
    .clone()
}

fn meshscore_snapshot(state: &Arc<AppState>) -> MeshScoreSeries {
    (*state.meshscore.read().expect("poisoned").clone().unwrap_or_else(|| {
        Arc::new(MeshScoreSeries {
            current: 0.0,
            updated_at: Utc::now().to_rfc3339(),
            days: vec![],
        })
    }))
    .clone()
}

/// Persist the current repeater rank cache into `current_repeaters` (the
/// table the admin UI queries directly) and append one `repeater_rank_history`
/// sample, so the history chart has something to read even between full
/// `refresh_repeater_rank` recomputations.
pub async fn update_stored_repeater_scores(state: &Arc<AppState>) {
    let Some(cache) = state.repeater_rank.read().expect("repeater rank lock poisoned").clone() else {
        return;
    };
    let storage = state.storage.clone();
    let _ = tokio::task::spawn_blocking(move || -> Result<(), crate::db::DbError> {
        let db = storage.db.lock().expect("db mutex poisoned");
        let conn = db.conn();
        let now = Utc::now().to_rfc3339();
        for item in &cache.items {
            let color = format!("{:?}", item.color).to_lowercase();
            let quality = format!("{:?}", item.quality).to_lowercase();
            conn.execute(
                "INSERT INTO current_repeaters \
                    (pub, name, score, color, quality, stale, is_live, last_seen, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8) \
                 ON CONFLICT(pub) DO UPDATE SET \
                    name = excluded.name, score = excluded.score, color = excluded.color, \
                    quality = excluded.quality, stale = excluded.stale, is_live = 1, \
                    last_seen = excluded.last_seen, updated_at = excluded.updated_at",
                rusqlite::params![
                    item.pub_key,
                    item.name,
                    item.score,
                    color,
                    quality,
                    item.stale as i64,
                    item.last_seen,
                    now,
                ],
            )?;
        }
        let active = cache.items.iter().filter(|i| !i.stale).count() as i64;
        conn.execute(
            "INSERT INTO repeater_rank_history (recorded_at, total, active, total24h, cached_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![now, cache.count as i64, active, cache.count as i64, now],
        )?;
        Ok(())
    })
    .await;
}

/// Broadcasts the periodic counters tick (§4.9, every 10s): ingest total
/// plus how many repeaters/observers are currently active, read straight off
/// the published rank snapshots rather than re-querying the DB.
pub async fn broadcast_counters(state: &Arc<AppState>) {
    let repeaters_active = state
        .repeater_rank
        .read()
        .expect("repeater rank lock poisoned")
        .as_ref()
        .map(|c| c.items.iter().filter(|i| !i.stale).count() as u32)
        .unwrap_or(0);
    let observers_active = state
        .observer_rank
        .read()
        .expect("observer rank lock poisoned")
        .as_ref()
        .map(|items| items.iter().filter(|i| !i.offline).count() as u32)
        .unwrap_or(0);

    state.broadcast_dashboard(SseEvent::CountersUpdated {
        ingested_total: state.ingested_total.load(std::sync::atomic::Ordering::Relaxed).max(0) as u64,
        observers_active,
        repeaters_active,
    });
}

/// Broadcasts the periodic health tick (§4.9, every 12s): a cheap DB
/// round-trip stands in for the liveness check the `/api/health` endpoint
/// also performs.
pub async fn broadcast_health(state: &Arc<AppState>) {
    let storage = state.storage.clone();
    let healthy = tokio::task::spawn_blocking(move || {
        let db = storage.db.lock().expect("db mutex poisoned");
        db.conn().query_row("SELECT 1", [], |_| Ok(())).is_ok()
    })
    .await
    .unwrap_or(false);

    state.broadcast_dashboard(SseEvent::Health {
        healthy,
        detail: if healthy { "ok".to_owned() } else { "database unreachable".to_owned() },
    });
}

pub async fn sweep_repeater_visibility(state: &Arc<AppState>) {
    let storage = state.storage.clone();
    let _ = tokio::task::spawn_blocking(move || {
        let db = storage.db.lock().expect("db mutex poisoned");
        let cutoff_ms = Utc::now().timestamp_millis() - repeater::ACTIVE_WINDOW_HOURS * 3_600_000;
        db.conn().execute(
            "UPDATE current_repeaters SET visible = 0 \
             WHERE last_advert_heard_ms IS NULL OR last_advert_heard_ms < ?1",
            [cutoff_ms],
        )
    })
    .await;
}
