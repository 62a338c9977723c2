//! Observer-hits index (C2): an incremental tailer over `observer.ndjson`
//! mapping frame/message hashes to the set of observers that heard them.
//!
//! The index is published as an immutable snapshot (`Arc<HashMap<..>>`) so
//! readers never take a lock per lookup and never observe a partially
//! updated map; the background tailer builds a new map each tick and swaps
//! the pointer.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::ndjson::{self, TailCursor};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObserverHitLine {
    #[serde(default)]
    frame_hash: Option<String>,
    #[serde(default, rename = "hash")]
    node_hash: Option<String>,
    #[serde(default)]
    message_hash: Option<String>,
    observer_id: String,
}

pub type HitsMap = HashMap<String, HashSet<String>>;

pub struct ObserverHitsIndex {
    path: PathBuf,
    map: RwLock<Arc<HitsMap>>,
    cursor: AtomicU64,
}

impl ObserverHitsIndex {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            map: RwLock::new(Arc::new(HashMap::new())),
            cursor: AtomicU64::new(0),
        }
    }

    /// A snapshot of the current map. Cheap: an `Arc` clone.
    pub fn snapshot(&self) -> Arc<HitsMap> {
        self.map.read().expect("observer hits map poisoned").clone()
    }

    /// Run one tailer tick: read newly appended lines, fold them into the
    /// published map, and advance the cursor. IO errors abort the tick; the
    /// next tick retries from the same cursor.
    pub fn tick(&self) {
        if !self.path.exists() {
            return;
        }
        let cursor = TailCursor {
            offset: self.cursor.load(Ordering::Acquire),
        };
        let tick = match ndjson::tail(&self.path, cursor) {
            Ok(tick) => tick,
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "observer-hits tailer IO error, retrying next tick");
                return;
            }
        };
        if tick.lines.is_empty() && !tick.reset {
            return;
        }
        let parsed: Vec<ObserverHitLine> = ndjson::parse_lines(&tick.lines);

        let mut next: HitsMap = if tick.reset {
            HashMap::new()
        } else {
            (*self.snapshot()).clone()
        };
        for line in parsed {
            for key in [line.frame_hash, line.node_hash, line.message_hash]
                .into_iter()
                .flatten()
            {
                next.entry(key).or_default().insert(line.observer_id.clone());
            }
        }
        *self.map.write().expect("observer hits map poisoned") = Arc::new(next);
        self.cursor.store(tick.next_cursor.offset, Ordering::Release);
    }

    pub fn cursor(&self) -> TailCursor {
        TailCursor {
            offset: self.cursor.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_populates_map_from_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observer.ndjson");
        std::fs::write(
            &path,
            "{\"messageHash\":\"ABC\",\"observerId\":\"OBS1\"}\n",
        )
        .unwrap();
        let index = ObserverHitsIndex::new(path);
        index.tick();
        let snap = index.snapshot();
        assert!(snap.get("ABC").unwrap().contains("OBS1"));
    }

    #[test]
    fn every_key_in_map_has_at_least_one_observer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observer.ndjson");
        std::fs::write(
            &path,
            "{\"frameHash\":\"F1\",\"observerId\":\"OBS1\"}\n{\"frameHash\":\"F2\",\"observerId\":\"OBS2\"}\n",
        )
        .unwrap();
        let index = ObserverHitsIndex::new(path);
        index.tick();
        let snap = index.snapshot();
        for (_, observers) in snap.iter() {
            assert!(!observers.is_empty());
        }
    }

    #[test]
    fn missing_file_is_a_no_op_not_an_error() {
        let index = ObserverHitsIndex::new(PathBuf::from("/nonexistent/observer.ndjson"));
        index.tick();
        assert!(index.snapshot().is_empty());
    }
}
