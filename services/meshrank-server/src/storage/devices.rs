use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use meshrank_geo::Gps;
use meshrank_protocol::{Device, DeviceFlags};
use rusqlite::Connection;

use crate::db::DbError;

const DEVICE_CACHE_TTL: Duration = Duration::from_secs(30);

/// A snapshot of the device table, merged with the admin `devices.json`
/// overlay. Cheap to clone: callers hold it by value for the duration of
/// one request rather than re-locking per field access.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub by_pub: HashMap<String, Device>,
    pub updated_at: String,
}

pub struct DeviceCache {
    snapshot: Option<DeviceSnapshot>,
    fetched_at: Option<Instant>,
}

impl Default for DeviceCache {
    fn default() -> Self {
        Self {
            snapshot: None,
            fetched_at: None,
        }
    }
}

impl DeviceCache {
    /// Invalidate immediately; the next read bypasses the TTL. Used after
    /// admin mutation (hide/flag/relocate).
    pub fn invalidate(&mut self) {
        self.fetched_at = None;
    }

    pub fn read(&mut self, conn: &Connection, overlay_path: &Path) -> Result<DeviceSnapshot, DbError> {
        if let (Some(snap), Some(at)) = (&self.snapshot, self.fetched_at) {
            if at.elapsed() < DEVICE_CACHE_TTL {
                return Ok(snap.clone());
            }
        }
        let snapshot = match read_devices_from_db(conn) {
            Ok(mut snap) => {
                merge_overlay(&mut snap, overlay_path);
                snap
            }
            Err(e) => {
                tracing::warn!(error = %e, "device DB read failed, falling back to overlay only");
                let mut snap = DeviceSnapshot::default();
                merge_overlay(&mut snap, overlay_path);
                snap
            }
        };
        self.snapshot = Some(snapshot.clone());
        self.fetched_at = Some(Instant::now());
        Ok(snapshot)
    }
}

fn read_devices_from_db(conn: &Connection) -> Result<DeviceSnapshot, DbError> {
    let mut stmt = conn.prepare(
        "SELECT pub, name, is_repeater, is_observer, last_seen, last_advert_heard_ms, \
                gps_lat, gps_lon, hidden_on_map, gps_implausible, gps_flagged, gps_estimated, \
                verified_advert, name_valid, updated_at \
         FROM devices",
    )?;
    let rows = stmt.query_map([], |row| {
        let gps_lat: Option<f64> = row.get(6)?;
        let gps_lon: Option<f64> = row.get(7)?;
        Ok(Device {
            pub_key: row.get(0)?,
            name: row.get(1)?,
            is_repeater: row.get::<_, i64>(2)? != 0,
            is_observer: row.get::<_, i64>(3)? != 0,
            last_seen: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            last_advert_heard_ms: row.get(5)?,
            gps: gps_lat.zip(gps_lon).map(|(lat, lon)| Gps::new(lat, lon)),
            flags: DeviceFlags {
                hidden_on_map: row.get::<_, i64>(8)? != 0,
                gps_implausible: row.get::<_, i64>(9)? != 0,
                gps_flagged: row.get::<_, i64>(10)? != 0,
                gps_estimated: row.get::<_, i64>(11)? != 0,
                exclude_from_routes: false,
            },
            verified_advert: row.get::<_, i64>(12)? != 0,
            name_valid: row.get::<_, i64>(13)? != 0,
            backfilled: false,
        })
    })?;
    let mut by_pub = HashMap::new();
    let mut updated_at = String::new();
    for row in rows {
        let device = row?;
        updated_at = device.last_seen.clone().max(updated_at);
        by_pub.insert(device.pub_key.clone(), device);
    }
    Ok(DeviceSnapshot { by_pub, updated_at })
}

/// Merge `devices.json` (admin-authored overlay) on top of DB rows. The
/// overlay supplies admin-only fields (manual GPS, backfilled flag) that the
/// DB schema doesn't carry; it never removes a device the DB knows about.
fn merge_overlay(snapshot: &mut DeviceSnapshot, overlay_path: &Path) {
    let Ok(text) = std::fs::read_to_string(overlay_path) else {
        return;
    };
    let Ok(overlay): Result<HashMap<String, serde_json::Value>, _> = serde_json::from_str(&text)
    else {
        tracing::warn!(path = %overlay_path.display(), "malformed devices.json overlay, ignoring");
        return;
    };
    for (pub_key, value) in overlay {
        let entry = snapshot.by_pub.entry(pub_key.clone()).or_insert_with(|| Device {
            pub_key: pub_key.clone(),
            name: String::new(),
            is_repeater: false,
            is_observer: false,
            gps: None,
            flags: DeviceFlags::default(),
            last_seen: String::new(),
            last_advert_heard_ms: None,
            verified_advert: false,
            name_valid: false,
            backfilled: false,
        });
        if let Some(backfilled) = value
            .get("raw")
            .and_then(|r| r.get("meta"))
            .and_then(|m| m.get("backfilled"))
            .and_then(|b| b.as_bool())
        {
            entry.backfilled = backfilled;
        }
        if let Some(name) = value.get("name").and_then(|n| n.as_str()) {
            if entry.name.is_empty() {
                entry.name = name.to_owned();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn reads_empty_table_without_error() {
        let db = Db::open_in_memory(false).unwrap();
        let mut cache = DeviceCache::default();
        let snap = cache
            .read(db.conn(), Path::new("/nonexistent/devices.json"))
            .unwrap();
        assert!(snap.by_pub.is_empty());
    }

    #[test]
    fn reads_inserted_device_with_gps() {
        let db = Db::open_in_memory(false).unwrap();
        db.conn()
            .execute(
                "INSERT INTO devices (pub, name, is_repeater, is_observer, last_seen, \
                 last_advert_heard_ms, gps_lat, gps_lon, updated_at, verified_advert, name_valid) \
                 VALUES ('AB00', 'Hilltop', 1, 0, '2026-01-01T00:00:00Z', 1000, 51.5, -0.1, \
                 '2026-01-01T00:00:00Z', 1, 1)",
                [],
            )
            .unwrap();
        let mut cache = DeviceCache::default();
        let snap = cache
            .read(db.conn(), Path::new("/nonexistent/devices.json"))
            .unwrap();
        let device = snap.by_pub.get("AB00").unwrap();
        assert_eq!(device.hash_byte(), "AB");
        assert!(device.gps.is_some());
    }

    #[test]
    fn overlay_backfilled_flag_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let overlay_path = dir.path().join("devices.json");
        std::fs::write(
            &overlay_path,
            r#"{"AB00": {"raw": {"meta": {"backfilled": true}}}}"#,
        )
        .unwrap();
        let db = Db::open_in_memory(false).unwrap();
        db.conn()
            .execute(
                "INSERT INTO devices (pub, name, is_repeater, is_observer, last_seen, updated_at) \
                 VALUES ('AB00', 'Hilltop', 1, 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        let mut cache = DeviceCache::default();
        let snap = cache.read(db.conn(), &overlay_path).unwrap();
        assert!(snap.by_pub.get("AB00").unwrap().backfilled);
    }
}
