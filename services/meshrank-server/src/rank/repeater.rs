//! Repeater rank engine (C5).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use meshrank_geo::Gps;
use meshrank_protocol::{
    Device, ExcludedRepeater, Quality, RankCache, RankItem, RelationKind, RepeatEvidence,
    ScoreColor, ZeroHopNeighborDetail,
};

use super::clamp01;

pub const ACTIVE_WINDOW_HOURS: i64 = 72;
const NEIGHBOUR_CANDIDATE_RADIUS_KM: f64 = 200.0;
const NEIGHBOUR_CLUSTER_RADIUS_KM: f64 = 60.0;
const GREEN_RSSI_DBM: f64 = -75.0;

/// Per-repeater RF statistics accumulated over the active window, computed
/// upstream from the NDJSON/decoded advert stream and handed in here so the
/// scoring math stays pure and independently testable.
#[derive(Debug, Clone, Default)]
pub struct RepeaterStats {
    pub total_adverts: u32,
    pub unique_messages: u32,
    pub avg_rssi: Option<f64>,
    pub avg_snr: Option<f64>,
    pub best_rssi: Option<f64>,
    pub best_snr: Option<f64>,
    pub total24h: u32,
    pub last_ts: Option<DateTime<Utc>>,
    /// hash token -> (rssi sum, count, max)
    pub zero_hop_neighbours: HashMap<String, (f64, u32, f64)>,
}

/// `(middle appearances, distinct upstream tokens, distinct downstream tokens)`
/// derived by scanning every path in the active window for a given hop token.
pub fn repeat_evidence_for_token(paths: &[Vec<String>], token: &str) -> RepeatEvidence {
    let mut middle = 0u32;
    let mut upstream: HashSet<&str> = HashSet::new();
    let mut downstream: HashSet<&str> = HashSet::new();
    for path in paths {
        for (i, hop) in path.iter().enumerate() {
            if hop != token {
                continue;
            }
            if i > 0 && i + 1 < path.len() {
                middle += 1;
            }
            if i > 0 {
                upstream.insert(path[i - 1].as_str());
            }
            if i + 1 < path.len() {
                downstream.insert(path[i + 1].as_str());
            }
        }
    }
    RepeatEvidence::evaluate(middle, upstream.len() as u32, downstream.len() as u32)
}

pub fn classify_quality(device: &Device, stats: &RepeaterStats) -> (Quality, Vec<String>) {
    let mut reasons = Vec::new();
    let has_valid_gps = device.usable_gps().is_some();
    let zero_activity = stats.total_adverts == 0 && stats.unique_messages == 0;

    if !device.verified_advert {
        reasons.push("unverified_advert".to_owned());
    }
    if device.last_advert_heard_ms.is_none() {
        reasons.push("no_advert_timestamp".to_owned());
    }
    if !device.name_valid {
        reasons.push("name_invalid".to_owned());
    }
    if !has_valid_gps {
        reasons.push("missing_gps".to_owned());
    }
    if device.flags.hidden_on_map {
        reasons.push("hidden_on_map".to_owned());
    }
    if device.flags.gps_implausible {
        reasons.push("gps_implausible".to_owned());
    }
    if device.flags.gps_flagged {
        reasons.push("gps_flagged".to_owned());
    }

    let phantom = !device.verified_advert
        || device.last_advert_heard_ms.is_none()
        || (!has_valid_gps && !device.name_valid && zero_activity);

    if phantom {
        if !has_valid_gps && !device.name_valid && zero_activity {
            reasons.push("name_invalid_no_gps_no_activity".to_owned());
        }
        reasons.push("phantom".to_owned());
        return (Quality::Phantom, reasons);
    }

    let low_quality = !device.name_valid
        || !has_valid_gps
        || device.flags.hidden_on_map
        || device.flags.gps_implausible
        || device.flags.gps_flagged;

    if low_quality {
        return (Quality::LowQuality, reasons);
    }

    (Quality::Valid, Vec::new())
}

pub fn score(stats: &RepeaterStats, evidence: &RepeatEvidence, age_hours: f64) -> f64 {
    if age_hours >= ACTIVE_WINDOW_HOURS as f64 {
        return 0.0;
    }
    let rssi_base = stats.avg_rssi.or(stats.best_rssi).unwrap_or(-120.0);
    let snr_base = stats.avg_snr.or(stats.best_snr).unwrap_or(-20.0);
    let rssi_score = clamp01((rssi_base + 120.0) / 70.0);
    let snr_score = clamp01((snr_base + 20.0) / 30.0);
    let best_rssi_score = clamp01((stats.best_rssi.unwrap_or(-120.0) + 120.0) / 70.0);
    let best_snr_score = clamp01((stats.best_snr.unwrap_or(-20.0) + 20.0) / 30.0);
    let throughput_score = clamp01(stats.total24h as f64 / 50.0);
    let avg_repeats = if stats.unique_messages > 0 {
        stats.total_adverts as f64 / stats.unique_messages as f64
    } else {
        0.0
    };
    let repeat_score = clamp01(avg_repeats / 5.0);
    let neighbour_score = clamp01(stats.zero_hop_neighbours.len() as f64 / 5.0);
    let _ = evidence;

    100.0
        * (0.30 * rssi_score
            + 0.10 * snr_score
            + 0.10 * best_rssi_score
            + 0.05 * best_snr_score
            + 0.25 * throughput_score
            + 0.10 * repeat_score
            + 0.10 * neighbour_score)
}

/// A candidate peer a hop token could concretely resolve to.
#[derive(Debug, Clone)]
pub struct NeighbourCandidate {
    pub pub_key: String,
    pub name: String,
    pub hash: String,
    pub gps: Gps,
    pub own_zero_hop_hashes: HashSet<String>,
}

/// Resolve one neighbour hash token to a concrete peer per §4.5's algorithm:
/// filter within 200 km, prefer mutual candidates, then maximise 60 km
/// cluster density, tie-break by distance ascending. An admin override
/// (keyed `targetPub:hash`) short-circuits the choice.
pub fn resolve_zero_hop_neighbour(
    target_pub: &str,
    target_gps: Gps,
    hash_token: &str,
    candidates: &[NeighbourCandidate],
    stats: &(f64, u32, f64),
    overrides: &HashMap<String, String>,
    all_candidates_for_density: &[NeighbourCandidate],
) -> Option<ZeroHopNeighborDetail> {
    let override_key = format!("{target_pub}:{hash_token}");
    if let Some(override_pub) = overrides.get(&override_key) {
        let chosen = candidates
            .iter()
            .find(|c| &c.pub_key == override_pub)
            .or_else(|| all_candidates_for_density.iter().find(|c| &c.pub_key == override_pub));
        let name = chosen.map(|c| c.name.clone()).unwrap_or_default();
        let rssi_avg = stats.1.max(1) as f64;
        let rssi_avg = stats.0 / rssi_avg;
        return Some(ZeroHopNeighborDetail {
            hash: hash_token.to_owned(),
            pub_key: override_pub.clone(),
            name,
            rssi_avg: Some(rssi_avg),
            rssi_max: Some(stats.2),
            is_green: stats.0 / (stats.1.max(1) as f64) >= GREEN_RSSI_DBM || stats.2 >= GREEN_RSSI_DBM,
            mutual: chosen.map(|c| c.own_zero_hop_hashes.contains(hash_token)).unwrap_or(false),
            relation: RelationKind::Reciprocal,
            options: candidates.len() as u32,
            override_: true,
        });
    }

    let in_range: Vec<&NeighbourCandidate> = candidates
        .iter()
        .filter(|c| target_gps.distance_km(c.gps) <= NEIGHBOUR_CANDIDATE_RADIUS_KM)
        .collect();
    if in_range.is_empty() {
        return None;
    }

    let target_hash = meshrank_geo::hash_byte(target_pub);
    let mutual: Vec<&&NeighbourCandidate> = in_range
        .iter()
        .filter(|c| c.own_zero_hop_hashes.contains(&target_hash))
        .collect();
    let pool: Vec<&NeighbourCandidate> = if !mutual.is_empty() {
        mutual.into_iter().copied().collect()
    } else {
        in_range.clone()
    };

    let chosen = pool
        .iter()
        .max_by(|a, b| {
            let density_a = cluster_density(a, all_candidates_for_density, NEIGHBOUR_CLUSTER_RADIUS_KM);
            let density_b = cluster_density(b, all_candidates_for_density, NEIGHBOUR_CLUSTER_RADIUS_KM);
            density_a
                .partial_cmp(&density_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let dist_a = target_gps.distance_km(a.gps);
                    let dist_b = target_gps.distance_km(b.gps);
                    dist_b.partial_cmp(&dist_a).unwrap_or(std::cmp::Ordering::Equal)
                })
        })
        .copied()?;

    let rssi_count = stats.1.max(1) as f64;
    let rssi_avg = stats.0 / rssi_count;
    let is_green = rssi_avg >= GREEN_RSSI_DBM || stats.2 >= GREEN_RSSI_DBM;
    let mutual_flag = chosen.own_zero_hop_hashes.contains(&target_hash);

    Some(ZeroHopNeighborDetail {
        hash: hash_token.to_owned(),
        pub_key: chosen.pub_key.clone(),
        name: chosen.name.clone(),
        rssi_avg: Some(rssi_avg),
        rssi_max: Some(stats.2),
        is_green,
        mutual: mutual_flag,
        relation: if mutual_flag {
            RelationKind::Reciprocal
        } else {
            RelationKind::Handoff
        },
        options: in_range.len() as u32,
        override_: false,
    })
}

fn cluster_density(center: &NeighbourCandidate, all: &[NeighbourCandidate], radius_km: f64) -> usize {
    all.iter()
        .filter(|c| center.gps.distance_km(c.gps) <= radius_km)
        .count()
}

/// Merge per-repeater items into the final cache, applying name dedup
/// (§4.5): when two included repeaters share a normalised name, keep the
/// newer by `last_seen`, tiebreak by `total24h` then score.
pub fn dedup_by_name(mut items: Vec<(RankItem, u32, DateTime<Utc>)>) -> Vec<RankItem> {
    items.sort_by(|a, b| b.2.cmp(&a.2).then(b.1.cmp(&a.1)).then(
        b.0.score.partial_cmp(&a.0.score).unwrap_or(std::cmp::Ordering::Equal),
    ));
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for (item, _, _) in items {
        let key = item.name.to_lowercase();
        if seen_names.insert(key) {
            out.push(item);
        }
    }
    out
}

pub fn build_cache(updated_at: String, items: Vec<RankItem>, excluded: Vec<ExcludedRepeater>) -> RankCache {
    RankCache {
        updated_at,
        count: items.len(),
        items,
        excluded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrank_protocol::DeviceFlags;

    fn device(overrides: impl FnOnce(&mut Device)) -> Device {
        let mut d = Device {
            pub_key: "AB".to_owned() + &"0".repeat(62),
            name: "Repeater".into(),
            is_repeater: true,
            is_observer: false,
            gps: Some(Gps::new(51.5, -0.1)),
            flags: DeviceFlags::default(),
            last_seen: "2026-01-01T00:00:00Z".into(),
            last_advert_heard_ms: Some(1_700_000_000_000),
            verified_advert: true,
            name_valid: true,
            backfilled: false,
        };
        overrides(&mut d);
        d
    }

    #[test]
    fn repeat_evidence_true_repeater_on_five_middle_hops() {
        let paths = vec![
            vec!["X".into(), "AB".into(), "Y".into()],
            vec!["X".into(), "AB".into(), "Y".into()],
            vec!["X".into(), "AB".into(), "Y".into()],
            vec!["X".into(), "AB".into(), "Y".into()],
            vec!["X".into(), "AB".into(), "Y".into()],
        ];
        let evidence = repeat_evidence_for_token(&paths, "AB");
        assert_eq!(evidence.middle, 5);
        assert!(evidence.is_true_repeater);
    }

    #[test]
    fn repeat_evidence_false_with_four_middle_and_insufficient_spread() {
        let paths = vec![
            vec!["X".into(), "AB".into(), "Y".into()],
            vec!["X".into(), "AB".into(), "Y".into()],
            vec!["X".into(), "AB".into(), "Y".into()],
            vec!["X".into(), "AB".into(), "Y".into()],
        ];
        let evidence = repeat_evidence_for_token(&paths, "AB");
        assert_eq!(evidence.middle, 4);
        assert!(!evidence.is_true_repeater);
    }

    #[test]
    fn quality_phantom_when_unverified() {
        let d = device(|d| d.verified_advert = false);
        let (q, reasons) = classify_quality(&d, &RepeaterStats::default());
        assert_eq!(q, Quality::Phantom);
        assert!(reasons.contains(&"phantom".to_owned()));
    }

    #[test]
    fn quality_phantom_on_name_invalid_no_gps_no_activity() {
        let d = device(|d| {
            d.name_valid = false;
            d.gps = None;
        });
        let (q, reasons) = classify_quality(&d, &RepeaterStats::default());
        assert_eq!(q, Quality::Phantom);
        assert!(reasons.contains(&"name_invalid_no_gps_no_activity".to_owned()));
    }

    #[test]
    fn quality_low_quality_when_hidden_on_map() {
        let d = device(|d| d.flags.hidden_on_map = true);
        let stats = RepeaterStats {
            total_adverts: 10,
            unique_messages: 5,
            ..Default::default()
        };
        let (q, _) = classify_quality(&d, &stats);
        assert_eq!(q, Quality::LowQuality);
    }

    #[test]
    fn quality_valid_when_everything_checks_out() {
        let d = device(|_| {});
        let stats = RepeaterStats {
            total_adverts: 10,
            unique_messages: 5,
            ..Default::default()
        };
        let (q, reasons) = classify_quality(&d, &stats);
        assert_eq!(q, Quality::Valid);
        assert!(reasons.is_empty());
    }

    #[test]
    fn score_is_zero_when_stale() {
        let stats = RepeaterStats::default();
        let evidence = RepeatEvidence::evaluate(0, 0, 0);
        assert_eq!(score(&stats, &evidence, 72.0), 0.0);
    }

    #[test]
    fn score_increases_with_throughput() {
        let evidence = RepeatEvidence::evaluate(0, 0, 0);
        let low = RepeaterStats {
            total24h: 0,
            avg_rssi: Some(-100.0),
            ..Default::default()
        };
        let high = RepeaterStats {
            total24h: 50,
            avg_rssi: Some(-100.0),
            ..Default::default()
        };
        assert!(score(&high, &evidence, 1.0) > score(&low, &evidence, 1.0));
    }

    #[test]
    fn zero_hop_override_short_circuits_distance_and_rssi() {
        let target = Gps::new(0.0, 0.0);
        let far_away = NeighbourCandidate {
            pub_key: "PSTAR".into(),
            name: "Far Peer".into(),
            hash: "CD".into(),
            gps: Gps::new(10.0, 10.0),
            own_zero_hop_hashes: HashSet::new(),
        };
        let mut overrides = HashMap::new();
        overrides.insert(format!("{}:CD", "AB".to_owned() + &"0".repeat(62)), "PSTAR".to_owned());
        let target_pub = "AB".to_owned() + &"0".repeat(62);
        let detail = resolve_zero_hop_neighbour(
            &target_pub,
            target,
            "CD",
            &[far_away.clone()],
            &(-200.0, 1, -200.0),
            &overrides,
            &[far_away],
        )
        .unwrap();
        assert_eq!(detail.pub_key, "PSTAR");
        assert!(detail.override_);
    }

    #[test]
    fn dedup_by_name_keeps_newer_last_seen() {
        let older = RankItem {
            pub_key: "A".into(),
            hash: "AB".into(),
            name: "Same Name".into(),
            quality: Quality::Valid,
            score: 90.0,
            stale: false,
            last_seen: None,
            evidence: RepeatEvidence::evaluate(5, 0, 0),
            neighbors: vec![],
            messages_relayed: 0,
            unique_senders: 0,
            gps: None,
            last_advert_age_hours: 1.0,
            is_live: true,
            quality_reason: vec![],
            color: ScoreColor::Green,
            total_24h: 0,
            avg_rssi: None,
            avg_snr: None,
            best_rssi: None,
            best_snr: None,
        };
        let newer = RankItem {
            pub_key: "B".into(),
            score: 10.0,
            ..older.clone()
        };
        let items = vec![
            (older, 5, DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)),
            (newer, 5, DateTime::parse_from_rfc3339("2026-01-02T00:00:00Z").unwrap().with_timezone(&Utc)),
        ];
        let result = dedup_by_name(items);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].pub_key, "B");
    }
}
