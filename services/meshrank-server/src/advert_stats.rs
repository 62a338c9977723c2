//! Advert-stats tailer (C5 support): an incremental reader over
//! `decoded.ndjson` (falling back to `observer.ndjson` when decoded adverts
//! aren't being emitted) that accumulates per-repeater RSSI/SNR/throughput
//! samples and zero-hop neighbour adjacency, so the repeater-rank engine has
//! real input instead of the zeroed-out defaults `RepeaterStats` starts with.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::ndjson::{self, TailCursor};
use crate::rank::repeater::{RepeaterStats, ACTIVE_WINDOW_HOURS};

const DAY_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdvertLine {
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    archived_at: Option<String>,
    /// Hop hash byte of the repeater this advert was heard from, same field
    /// name as the observer-hits tailer's `hash`.
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    message_hash: Option<String>,
    #[serde(default)]
    rssi: Option<f64>,
    #[serde(default)]
    snr: Option<f64>,
    #[serde(default)]
    path: Vec<String>,
}

impl AdvertLine {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.ts
            .as_deref()
            .or(self.archived_at.as_deref())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone)]
struct Sample {
    ts: DateTime<Utc>,
    message_hash: Option<String>,
    rssi: Option<f64>,
    snr: Option<f64>,
}

type NeighbourAccum = HashMap<String, HashMap<String, (f64, u32, f64)>>;

/// Samples accumulate per repeater hash token; [`stats_for`] recomputes the
/// active-window aggregate at read time, since the 10%-trimmed RSSI/SNR mean
/// needs the full sample set rather than a running average.
pub struct AdvertStatsIndex {
    decoded_path: PathBuf,
    fallback_path: PathBuf,
    samples: RwLock<HashMap<String, Vec<Sample>>>,
    neighbours: RwLock<NeighbourAccum>,
    decoded_cursor: AtomicU64,
    fallback_cursor: AtomicU64,
}

impl AdvertStatsIndex {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            decoded_path: data_dir.join("decoded.ndjson"),
            fallback_path: data_dir.join("observer.ndjson"),
            samples: RwLock::new(HashMap::new()),
            neighbours: RwLock::new(HashMap::new()),
            decoded_cursor: AtomicU64::new(0),
            fallback_cursor: AtomicU64::new(0),
        }
    }

    /// Run one tailer tick against whichever source file currently exists,
    /// preferring `decoded.ndjson`. IO errors abort the tick; the next tick
    /// retries from the same cursor.
    pub fn tick(&self) {
        if self.decoded_path.exists() {
            self.tick_source(&self.decoded_path, &self.decoded_cursor);
        } else if self.fallback_path.exists() {
            self.tick_source(&self.fallback_path, &self.fallback_cursor);
        }
    }

    fn tick_source(&self, path: &Path, cursor_cell: &AtomicU64) {
        let cursor = TailCursor {
            offset: cursor_cell.load(Ordering::Acquire),
        };
        let tick = match ndjson::tail(path, cursor) {
            Ok(tick) => tick,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "advert-stats tailer IO error, retrying next tick");
                return;
            }
        };
        if tick.lines.is_empty() && !tick.reset {
            return;
        }
        let parsed: Vec<AdvertLine> = ndjson::parse_lines(&tick.lines);

        let mut samples = self.samples.write().expect("advert samples poisoned");
        let mut neighbours = self.neighbours.write().expect("advert neighbours poisoned");
        if tick.reset {
            samples.clear();
            neighbours.clear();
        }
        for line in &parsed {
            let Some(hash) = line.hash.clone() else { continue };
            let ts = line.timestamp().unwrap_or_else(Utc::now);
            samples.entry(hash.clone()).or_default().push(Sample {
                ts,
                message_hash: line.message_hash.clone(),
                rssi: line.rssi,
                snr: line.snr,
            });

            // The path's last hop is the repeater that sent this advert; the
            // one before it is the zero-hop neighbour that relayed it.
            if line.path.len() >= 2 {
                let advertiser = &line.path[line.path.len() - 1];
                let neighbour = &line.path[line.path.len() - 2];
                let entry = neighbours
                    .entry(advertiser.clone())
                    .or_default()
                    .entry(neighbour.clone())
                    .or_insert((0.0, 0, f64::MIN));
                if let Some(rssi) = line.rssi {
                    entry.0 += rssi;
                    entry.1 += 1;
                    entry.2 = entry.2.max(rssi);
                }
            }
        }
        cursor_cell.store(tick.next_cursor.offset, Ordering::Release);
    }

    /// Aggregate stats for one repeater hash token over the active window.
    pub fn stats_for(&self, hash: &str, now: DateTime<Utc>) -> RepeaterStats {
        let samples = self.samples.read().expect("advert samples poisoned");
        let Some(all) = samples.get(hash) else {
            return RepeaterStats::default();
        };
        let window_start = now - chrono::Duration::hours(ACTIVE_WINDOW_HOURS);
        let day_start = now - chrono::Duration::hours(DAY_HOURS);
        let windowed: Vec<&Sample> = all.iter().filter(|s| s.ts >= window_start).collect();

        let mut rssi_values: Vec<f64> = windowed.iter().filter_map(|s| s.rssi).collect();
        let mut snr_values: Vec<f64> = windowed.iter().filter_map(|s| s.snr).collect();
        let best_rssi = rssi_values.iter().cloned().fold(None, keep_max);
        let best_snr = snr_values.iter().cloned().fold(None, keep_max);

        let unique_messages = windowed
            .iter()
            .filter_map(|s| s.message_hash.as_deref())
            .collect::<HashSet<_>>()
            .len() as u32;
        let total24h = windowed.iter().filter(|s| s.ts >= day_start).count() as u32;
        let last_ts = windowed.iter().map(|s| s.ts).max();

        let neighbours = self.neighbours.read().expect("advert neighbours poisoned");
        let zero_hop_neighbours = neighbours.get(hash).cloned().unwrap_or_default();

        RepeaterStats {
            total_adverts: windowed.len() as u32,
            unique_messages,
            avg_rssi: trimmed_mean(&mut rssi_values),
            avg_snr: trimmed_mean(&mut snr_values),
            best_rssi,
            best_snr,
            total24h,
            last_ts,
            zero_hop_neighbours,
        }
    }
}

fn keep_max(acc: Option<f64>, v: f64) -> Option<f64> {
    Some(acc.map_or(v, |a| a.max(v)))
}

/// Drops the top/bottom 10% before averaging so a handful of outlier
/// readings can't drag a repeater's score around.
fn trimmed_mean(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let trim = values.len() / 10;
    let slice = &values[trim..values.len() - trim];
    Some(slice.iter().sum::<f64>() / slice.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(hash: &str, rssi: f64, path: &[&str]) -> String {
        format!(
            "{{\"ts\":\"2026-01-01T00:00:00Z\",\"hash\":\"{hash}\",\"messageHash\":\"M1\",\"rssi\":{rssi},\"path\":[{}]}}",
            path.iter().map(|p| format!("\"{p}\"")).collect::<Vec<_>>().join(",")
        )
    }

    #[test]
    fn stats_for_unknown_hash_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let index = AdvertStatsIndex::new(dir.path());
        let stats = index.stats_for("AB", Utc::now());
        assert_eq!(stats.total_adverts, 0);
    }

    #[test]
    fn tick_accumulates_rssi_samples_for_a_repeater() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("decoded.ndjson"), format!("{}\n", line("AB", -60.0, &[]))).unwrap();
        let index = AdvertStatsIndex::new(dir.path());
        index.tick();
        let stats = index.stats_for("AB", chrono::DateTime::parse_from_rfc3339("2026-01-01T01:00:00Z").unwrap().with_timezone(&Utc));
        assert_eq!(stats.total_adverts, 1);
        assert_eq!(stats.best_rssi, Some(-60.0));
    }

    #[test]
    fn path_adjacency_feeds_zero_hop_neighbours() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("decoded.ndjson"), format!("{}\n", line("AB", -55.0, &["CD", "AB"]))).unwrap();
        let index = AdvertStatsIndex::new(dir.path());
        index.tick();
        let stats = index.stats_for("AB", chrono::DateTime::parse_from_rfc3339("2026-01-01T01:00:00Z").unwrap().with_timezone(&Utc));
        assert!(stats.zero_hop_neighbours.contains_key("CD"));
    }

    #[test]
    fn falls_back_to_observer_ndjson_when_decoded_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("observer.ndjson"), format!("{}\n", line("AB", -70.0, &[]))).unwrap();
        let index = AdvertStatsIndex::new(dir.path());
        index.tick();
        let stats = index.stats_for("AB", chrono::DateTime::parse_from_rfc3339("2026-01-01T01:00:00Z").unwrap().with_timezone(&Utc));
        assert_eq!(stats.total_adverts, 1);
    }
}
