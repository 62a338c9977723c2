use std::collections::HashMap;
use std::time::{Duration, Instant};

use meshrank_geo::Gps;
use meshrank_protocol::Observer;
use rusqlite::Connection;

use crate::db::DbError;

const OBSERVER_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct ObserverSnapshot {
    pub by_id: HashMap<String, Observer>,
    pub updated_at: String,
}

#[derive(Default)]
pub struct ObserverCache {
    snapshot: Option<ObserverSnapshot>,
    fetched_at: Option<Instant>,
}

impl ObserverCache {
    pub fn invalidate(&mut self) {
        self.fetched_at = None;
    }

    pub fn read(&mut self, conn: &Connection) -> Result<ObserverSnapshot, DbError> {
        if let (Some(snap), Some(at)) = (&self.snapshot, self.fetched_at) {
            if at.elapsed() < OBSERVER_CACHE_TTL {
                return Ok(snap.clone());
            }
        }
        // Observers are derived from message_observers activity; there is no
        // standalone `observers` table, so this aggregates from the join
        // table plus any GPS an admin has attached via geoscore_observer_homes.
        let mut stmt = conn.prepare(
            "SELECT mo.observer_id, min(mo.ts), max(mo.ts), count(*), h.gps_lat, h.gps_lon \
             FROM message_observers mo \
             LEFT JOIN geoscore_observer_homes h ON h.observer_id = mo.observer_id \
             GROUP BY mo.observer_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let lat: Option<f64> = row.get(4)?;
            let lon: Option<f64> = row.get(5)?;
            Ok(Observer {
                id: row.get(0)?,
                first_seen: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                last_seen: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                count: row.get::<_, i64>(3)? as u64,
                gps: lat.zip(lon).map(|(lat, lon)| Gps::new(lat, lon)),
                best_repeater_pub: None,
            })
        })?;
        let mut by_id = HashMap::new();
        let mut updated_at = String::new();
        for row in rows {
            let observer = row?;
            updated_at = observer.last_seen.clone().max(updated_at);
            by_id.insert(observer.id.clone(), observer);
        }
        let snapshot = ObserverSnapshot { by_id, updated_at };
        self.snapshot = Some(snapshot.clone());
        self.fetched_at = Some(Instant::now());
        Ok(snapshot)
    }
}
