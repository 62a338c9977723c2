//! Types produced by the repeater-rank, observer-rank, and meshscore engines.

use serde::{Deserialize, Serialize};

/// Classification of a repeater based on GPS plausibility and advert
/// verification, independent of repeat evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Valid,
    LowQuality,
    Phantom,
}

/// Whether two repeaters directly heard each other (reciprocal) or only one
/// direction was observed (handoff).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Reciprocal,
    Handoff,
}

/// A color bucket the dashboard uses to paint a rank score. Computed once
/// per refresh via [`ScoreColor::for_score`] and stored on [`RankItem`] so
/// API consumers don't have to re-derive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreColor {
    Red,
    Orange,
    Yellow,
    Green,
}

impl ScoreColor {
    /// stale => red; score >= 70 => green; >= 45 => yellow; else orange.
    pub fn for_score(score: f64, stale: bool) -> Self {
        if stale {
            ScoreColor::Red
        } else if score >= 70.0 {
            ScoreColor::Green
        } else if score >= 45.0 {
            ScoreColor::Yellow
        } else {
            ScoreColor::Orange
        }
    }
}

/// One zero-hop neighbour of a repeater: another repeater it has directly
/// exchanged traffic with (no intermediate hops in the observed path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZeroHopNeighborDetail {
    pub hash: String,
    pub pub_key: String,
    pub name: String,
    #[serde(default)]
    pub rssi_avg: Option<f64>,
    #[serde(default)]
    pub rssi_max: Option<f64>,
    pub is_green: bool,
    pub mutual: bool,
    pub relation: RelationKind,
    /// Number of distinct messages this neighbour relation was derived from.
    pub options: u32,
    /// True if an admin override pins this relation regardless of recomputation.
    #[serde(default)]
    pub override_: bool,
}

/// The repeat-evidence test result for a repeater: has it been seen acting
/// as a genuine middle hop enough times to trust it as a repeater.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepeatEvidence {
    pub middle: u32,
    pub upstream: u32,
    pub downstream: u32,
    pub is_true_repeater: bool,
}

impl RepeatEvidence {
    /// middleCount >= 5, OR (upstream >= 2 AND downstream >= 2).
    pub fn evaluate(middle: u32, upstream: u32, downstream: u32) -> Self {
        let is_true_repeater = middle >= 5 || (upstream >= 2 && downstream >= 2);
        Self {
            middle,
            upstream,
            downstream,
            is_true_repeater,
        }
    }
}

/// One row of the repeater leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankItem {
    pub pub_key: String,
    pub hash: String,
    pub name: String,
    pub quality: Quality,
    pub score: f64,
    pub stale: bool,
    #[serde(default)]
    pub last_seen: Option<String>,
    pub evidence: RepeatEvidence,
    #[serde(default)]
    pub neighbors: Vec<ZeroHopNeighborDetail>,
    pub messages_relayed: u64,
    pub unique_senders: u64,
    #[serde(default)]
    pub gps: Option<meshrank_geo::Gps>,
    /// Hours since the last advert was heard from this repeater; feeds the
    /// `stale` cutoff and is surfaced directly so the dashboard doesn't have
    /// to re-derive it from `last_seen`.
    pub last_advert_age_hours: f64,
    /// Mirrors `!stale`; kept as its own field because "live" is a quality
    /// concept distinct from "passed `classify_quality`".
    pub is_live: bool,
    /// Human-readable reasons behind `quality`, e.g. "phantom: gps implausible".
    #[serde(default)]
    pub quality_reason: Vec<String>,
    pub color: ScoreColor,
    pub total_24h: u32,
    #[serde(default)]
    pub avg_rssi: Option<f64>,
    #[serde(default)]
    pub avg_snr: Option<f64>,
    #[serde(default)]
    pub best_rssi: Option<f64>,
    #[serde(default)]
    pub best_snr: Option<f64>,
}

/// A repeater that was excluded from the leaderboard outright, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedRepeater {
    pub pub_key: String,
    pub hash: String,
    pub name: String,
    pub reason: String,
}

/// The full repeater rank response, persisted as a singleton cache row and
/// recomputed on the scheduler's cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankCache {
    pub updated_at: String,
    pub count: usize,
    pub items: Vec<RankItem>,
    pub excluded: Vec<ExcludedRepeater>,
}

/// One row of the observer leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverRankItem {
    pub observer_id: String,
    pub score: f64,
    pub messages_heard: u64,
    pub unique_repeaters_heard: u64,
    #[serde(default)]
    pub gps: Option<meshrank_geo::Gps>,
    #[serde(default)]
    pub last_seen: Option<String>,
    /// Pub key of the strongest-RSSI repeater this observer has heard.
    #[serde(default)]
    pub best_repeater_pub: Option<String>,
    #[serde(default)]
    pub nearest_repeater_name: Option<String>,
    #[serde(default)]
    pub nearest_repeater_km: Option<f64>,
    pub offline: bool,
}

/// One day's meshscore datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshScoreDay {
    pub day: chrono::NaiveDate,
    pub score: f64,
    pub active_repeaters: u32,
    pub active_observers: u32,
    pub messages: u64,
}

/// A time series of meshscore datapoints, plus the current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshScoreSeries {
    pub current: f64,
    pub updated_at: String,
    pub days: Vec<MeshScoreDay>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_evidence_true_on_middle_threshold() {
        let e = RepeatEvidence::evaluate(5, 0, 0);
        assert!(e.is_true_repeater);
    }

    #[test]
    fn repeat_evidence_true_on_bidirectional_threshold() {
        let e = RepeatEvidence::evaluate(0, 2, 2);
        assert!(e.is_true_repeater);
    }

    #[test]
    fn repeat_evidence_false_below_both_thresholds() {
        let e = RepeatEvidence::evaluate(4, 2, 1);
        assert!(!e.is_true_repeater);
    }

    #[test]
    fn score_color_stale_always_red() {
        assert_eq!(ScoreColor::for_score(95.0, true), ScoreColor::Red);
    }

    #[test]
    fn score_color_buckets() {
        assert_eq!(ScoreColor::for_score(70.0, false), ScoreColor::Green);
        assert_eq!(ScoreColor::for_score(69.9, false), ScoreColor::Yellow);
        assert_eq!(ScoreColor::for_score(45.0, false), ScoreColor::Yellow);
        assert_eq!(ScoreColor::for_score(44.9, false), ScoreColor::Orange);
    }
}
