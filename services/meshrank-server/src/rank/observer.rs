//! Observer rank engine (C6).

use meshrank_geo::Gps;
use meshrank_protocol::ObserverRankItem;

use super::clamp01;

pub const REPEATER_ASSOCIATION_WINDOW_HOURS: i64 = 72;
pub const PACKETS_TODAY_WINDOW_HOURS: i64 = 24;
const COVERAGE_RADIUS_KM: f64 = 300.0;
const OFFLINE_AGE_HOURS: f64 = 24.0;

#[derive(Debug, Clone)]
pub struct RepeaterCandidate {
    pub pub_key: String,
    pub name: String,
    pub gps: Option<Gps>,
    pub rssi: f64,
}

pub struct ObserverInputs {
    pub observer_id: String,
    pub own_gps: Option<Gps>,
    pub packets_today: u64,
    pub uptime_hours: f64,
    pub age_hours: f64,
    /// zero-hop adverts heard from repeaters, with their RSSI.
    pub heard_repeaters: Vec<RepeaterCandidate>,
}

pub struct ObserverComputed {
    pub item: ObserverRankItem,
    pub offline: bool,
    pub nearest_repeater_name: Option<String>,
    pub nearest_repeater_km: Option<f64>,
}

pub fn compute_observer_rank(inputs: &ObserverInputs) -> ObserverComputed {
    let best_repeater = inputs
        .heard_repeaters
        .iter()
        .filter(|r| r.gps.is_some())
        .max_by(|a, b| a.rssi.partial_cmp(&b.rssi).unwrap_or(std::cmp::Ordering::Equal));

    let gps = inputs.own_gps.or_else(|| best_repeater.and_then(|r| r.gps));

    let coverage: std::collections::HashSet<String> = match gps {
        Some(gps) => inputs
            .heard_repeaters
            .iter()
            .filter(|r| r.rssi != 0.0)
            .filter(|r| r.gps.map(|g| gps.distance_km(g) <= COVERAGE_RADIUS_KM).unwrap_or(false))
            .map(|r| r.pub_key.clone())
            .collect(),
        None => std::collections::HashSet::new(),
    };

    let (nearest_name, nearest_km) = match gps {
        Some(gps) => inputs
            .heard_repeaters
            .iter()
            .filter_map(|r| r.gps.map(|g| (r, gps.distance_km(g))))
            .filter(|(_, d)| *d <= COVERAGE_RADIUS_KM)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(r, d)| (Some(r.name.clone()), Some(d)))
            .unwrap_or((None, None)),
        None => (None, None),
    };

    let uptime_score = clamp01(inputs.uptime_hours / 48.0);
    let traffic_score = clamp01(inputs.packets_today as f64 / 2000.0);
    let score = (100.0 * (0.6 * uptime_score + 0.4 * traffic_score)).round();
    let offline = inputs.age_hours > OFFLINE_AGE_HOURS;

    ObserverComputed {
        item: ObserverRankItem {
            observer_id: inputs.observer_id.clone(),
            score,
            messages_heard: inputs.packets_today,
            unique_repeaters_heard: coverage.len() as u64,
            gps,
            last_seen: None,
            best_repeater_pub: best_repeater.map(|r| r.pub_key.clone()),
            nearest_repeater_name: nearest_name.clone(),
            nearest_repeater_km: nearest_km,
            offline,
        },
        offline,
        nearest_repeater_name: nearest_name,
        nearest_repeater_km: nearest_km,
    }
}

/// Sort order: online first, then score desc, then packets-today desc.
pub fn sort_observers(mut items: Vec<(ObserverComputed, bool)>) -> Vec<ObserverRankItem> {
    items.sort_by(|(a, a_online), (b, b_online)| {
        b_online
            .cmp(a_online)
            .then(b.item.score.partial_cmp(&a.item.score).unwrap_or(std::cmp::Ordering::Equal))
            .then(b.item.messages_heard.cmp(&a.item.messages_heard))
    });
    items.into_iter().map(|(c, _)| c.item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_when_age_exceeds_24h() {
        let inputs = ObserverInputs {
            observer_id: "OBS1".into(),
            own_gps: None,
            packets_today: 0,
            uptime_hours: 0.0,
            age_hours: 25.0,
            heard_repeaters: vec![],
        };
        assert!(compute_observer_rank(&inputs).offline);
    }

    #[test]
    fn gps_falls_back_to_best_repeater() {
        let inputs = ObserverInputs {
            observer_id: "OBS1".into(),
            own_gps: None,
            packets_today: 10,
            uptime_hours: 10.0,
            age_hours: 1.0,
            heard_repeaters: vec![RepeaterCandidate {
                pub_key: "R1".into(),
                name: "Hilltop".into(),
                gps: Some(Gps::new(51.5, -0.1)),
                rssi: -60.0,
            }],
        };
        let computed = compute_observer_rank(&inputs);
        assert!(computed.item.gps.is_some());
        assert_eq!(computed.nearest_repeater_name.as_deref(), Some("Hilltop"));
    }

    #[test]
    fn score_formula_matches_weighted_sum() {
        let inputs = ObserverInputs {
            observer_id: "OBS1".into(),
            own_gps: Some(Gps::new(0.0, 1.0)),
            packets_today: 2000,
            uptime_hours: 48.0,
            age_hours: 0.0,
            heard_repeaters: vec![],
        };
        let computed = compute_observer_rank(&inputs);
        assert_eq!(computed.item.score, 100.0);
    }
}
