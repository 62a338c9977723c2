//! Message assembler (C3): joins a `messages` row with aggregated observer
//! data, the observer-hits index, and the device table into the
//! presentation record clients receive.

use std::collections::HashSet;

use meshrank_protocol::{MessageView, PathPoint};

use crate::observer_hits::HitsMap;
use crate::storage::devices::DeviceSnapshot;
use crate::storage::messages::{decode_path, MessageRow, ObserverAgg};

pub fn assemble(
    row: &MessageRow,
    agg: Option<&ObserverAgg>,
    hits: &HitsMap,
    devices: &DeviceSnapshot,
) -> MessageView {
    let row_path = decode_path(row.path_json.as_deref(), row.path_text.as_deref());
    let path = agg
        .and_then(|agg| agg.paths.first().cloned())
        .unwrap_or(row_path);

    let mut path_names = Vec::new();
    let mut path_points = Vec::new();
    for hash in &path {
        let device = devices.by_pub.values().find(|d| d.hash_byte() == *hash);
        if let Some(device) = device {
            if device.flags.exclude_from_routes || device.flags.hidden_on_map {
                continue;
            }
            let gps = if device.flags.gps_implausible || device.flags.gps_flagged {
                None
            } else {
                device.usable_gps()
            };
            if !device.name.is_empty() {
                path_names.push(device.name.clone());
            }
            path_points.push(PathPoint {
                hash: hash.clone(),
                name: if device.name.is_empty() {
                    None
                } else {
                    Some(device.name.clone())
                },
                gps,
            });
        } else {
            path_points.push(PathPoint {
                hash: hash.clone(),
                name: None,
                gps: None,
            });
        }
    }

    let mut observer_set: HashSet<String> = HashSet::new();
    if let Some(agg) = agg {
        observer_set.extend(agg.observer_ids.iter().cloned());
    }
    for key in [&row.frame_hash, &row.message_hash] {
        if let Some(observers) = hits.get(key) {
            observer_set.extend(observers.iter().cloned());
        }
    }
    let observer_hits: Vec<String> = observer_set.into_iter().collect();
    let observer_count = observer_hits.len() as u32;

    let repeats = row.repeats.max(row.path_length).max(observer_count);

    MessageView {
        message_hash: row.message_hash.clone(),
        frame_hash: row.frame_hash.clone(),
        channel_name: row.channel_name.clone(),
        sender: row.sender.clone(),
        body: row.body.clone(),
        ts: row.ts.clone(),
        repeats,
        path: path.clone(),
        path_names,
        path_points,
        path_length: row.path_length,
        observer_hits,
        observer_count,
        observer_paths: agg.map(|a| a.paths.clone()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrank_protocol::{Device, DeviceFlags};

    fn row() -> MessageRow {
        MessageRow {
            message_hash: "M1".into(),
            frame_hash: "F1".into(),
            channel_name: "#general".into(),
            sender: Some("node1".into()),
            body: "hi".into(),
            ts: "2026-01-01T00:00:00Z".into(),
            path_json: None,
            path_text: Some("AB|CD".into()),
            path_length: 2,
            repeats: 1,
        }
    }

    #[test]
    fn repeats_is_max_of_row_path_length_and_observer_count() {
        let mut hits = HitsMap::new();
        hits.insert(
            "F1".into(),
            ["OBS1", "OBS2", "OBS3"].iter().map(|s| s.to_string()).collect(),
        );
        let devices = DeviceSnapshot::default();
        let view = assemble(&row(), None, &hits, &devices);
        assert_eq!(view.observer_count, 3);
        assert_eq!(view.repeats, 3);
    }

    #[test]
    fn excluded_devices_are_dropped_from_path_points() {
        let mut devices = DeviceSnapshot::default();
        let mut flags = DeviceFlags::default();
        flags.exclude_from_routes = true;
        devices.by_pub.insert(
            "ABkey".into(),
            Device {
                pub_key: "ABkey".into(),
                name: "Room".into(),
                is_repeater: false,
                is_observer: false,
                gps: None,
                flags,
                last_seen: String::new(),
                last_advert_heard_ms: None,
                verified_advert: false,
                name_valid: false,
                backfilled: false,
            },
        );
        let hits = HitsMap::new();
        let view = assemble(&row(), None, &hits, &devices);
        assert!(view.path_points.iter().all(|p| p.hash != "AB"));
    }

    #[test]
    fn flagged_gps_nodes_keep_name_but_drop_gps() {
        let mut devices = DeviceSnapshot::default();
        let mut flags = DeviceFlags::default();
        flags.gps_flagged = true;
        devices.by_pub.insert(
            "ABkey".into(),
            Device {
                pub_key: "ABkey".into(),
                name: "Hilltop".into(),
                is_repeater: true,
                is_observer: false,
                gps: Some(meshrank_geo::Gps::new(51.5, -0.1)),
                flags,
                last_seen: String::new(),
                last_advert_heard_ms: None,
                verified_advert: true,
                name_valid: true,
                backfilled: false,
            },
        );
        let hits = HitsMap::new();
        let view = assemble(&row(), None, &hits, &devices);
        let point = view.path_points.iter().find(|p| p.hash == "AB").unwrap();
        assert_eq!(point.name.as_deref(), Some("Hilltop"));
        assert!(point.gps.is_none());
    }
}
