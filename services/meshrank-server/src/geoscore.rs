//! Route/geoscore inference (C12): assigns probable concrete pubs to path
//! hop tokens, fed from every path delta the SSE tick (§4.9 step 3) emits.

use std::collections::VecDeque;
use std::sync::Mutex;

use meshrank_geo::Gps;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct PathDelta {
    pub msg_key: String,
    pub ts_ms: i64,
    pub observer_id: String,
    pub path_tokens: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CandidatePeer {
    pub pub_key: String,
    pub gps: Gps,
    /// Static prior weight for this candidate absent any other evidence.
    pub prior: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferredRoute {
    pub msg_key: String,
    pub inferred_pubs: Vec<Option<String>>,
    pub hop_confidences: Vec<f64>,
    pub route_confidence: f64,
    pub unresolved: bool,
    pub max_teleport_km: Option<f64>,
}

/// A bounded FIFO of pending inference work, drained in batches by the
/// scheduler (C8).
#[derive(Default)]
pub struct InferenceQueue {
    queue: Mutex<VecDeque<PathDelta>>,
}

impl InferenceQueue {
    pub fn enqueue(&self, delta: PathDelta) {
        self.queue.lock().expect("inference queue poisoned").push_back(delta);
    }

    pub fn drain_batch(&self, max: usize) -> Vec<PathDelta> {
        let mut queue = self.queue.lock().expect("inference queue poisoned");
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("inference queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run a Viterbi-like pass over one path: at each hop token, score every
/// candidate peer by its static prior combined with an emission score from
/// proximity to the observer's home coordinate (if known) and to the
/// previous hop's chosen peer (edge prior held constant, per the open
/// question in the interface contract). Chooses the single best path via
/// dynamic programming rather than greedily, so a locally weak but globally
/// consistent route can still win.
pub fn infer_route(
    msg_key: &str,
    path_tokens: &[String],
    candidates_by_token: &[Vec<CandidatePeer>],
    observer_home: Option<Gps>,
) -> InferredRoute {
    if path_tokens.is_empty() {
        return InferredRoute {
            msg_key: msg_key.to_owned(),
            inferred_pubs: vec![],
            hop_confidences: vec![],
            route_confidence: 0.0,
            unresolved: true,
            max_teleport_km: None,
        };
    }

    // dp[hop][candidate_idx] = (best cumulative score, backpointer)
    let mut dp: Vec<Vec<(f64, Option<usize>)>> = Vec::with_capacity(path_tokens.len());
    for (hop, candidates) in candidates_by_token.iter().enumerate() {
        let mut scores = Vec::with_capacity(candidates.len());
        for (idx, candidate) in candidates.iter().enumerate() {
            let emission = observer_home
                .map(|home| 1.0 / (1.0 + home.distance_km(candidate.gps) / 100.0))
                .unwrap_or(1.0);
            let base = candidate.prior * emission;
            let best_prev = if hop == 0 {
                (base, None)
            } else {
                dp[hop - 1]
                    .iter()
                    .enumerate()
                    .map(|(prev_idx, (prev_score, _))| {
                        let edge_prior = 1.0; // constant edge prior per the open design question
                        (prev_score * edge_prior * base, Some(prev_idx))
                    })
                    .fold((f64::MIN, None), |acc, item| if item.0 > acc.0 { item } else { acc })
            };
            scores.push((idx, best_prev));
        }
        dp.push(scores.into_iter().map(|(_, v)| v).collect());
    }

    let last_hop = dp.len() - 1;
    let best_last = dp[last_hop]
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let Some((mut cur_idx, _)) = best_last else {
        return InferredRoute {
            msg_key: msg_key.to_owned(),
            inferred_pubs: vec![None; path_tokens.len()],
            hop_confidences: vec![0.0; path_tokens.len()],
            route_confidence: 0.0,
            unresolved: true,
            max_teleport_km: None,
        };
    };

    let mut chosen_idx = vec![None; dp.len()];
    for hop in (0..dp.len()).rev() {
        chosen_idx[hop] = Some(cur_idx);
        if let Some(prev) = dp[hop][cur_idx].1 {
            cur_idx = prev;
        }
    }

    let mut inferred_pubs = Vec::with_capacity(dp.len());
    let mut hop_confidences = Vec::with_capacity(dp.len());
    let mut prev_gps: Option<Gps> = None;
    let mut max_teleport_km = 0.0f64;
    let mut any_unresolved = false;
    for (hop, idx) in chosen_idx.iter().enumerate() {
        match idx.and_then(|i| candidates_by_token[hop].get(i)) {
            Some(candidate) => {
                inferred_pubs.push(Some(candidate.pub_key.clone()));
                hop_confidences.push(dp[hop][idx.unwrap()].0.clamp(0.0, 1.0));
                if let Some(prev) = prev_gps {
                    max_teleport_km = max_teleport_km.max(prev.distance_km(candidate.gps));
                }
                prev_gps = Some(candidate.gps);
            }
            None => {
                inferred_pubs.push(None);
                hop_confidences.push(0.0);
                any_unresolved = true;
            }
        }
    }

    let route_confidence = if hop_confidences.is_empty() {
        0.0
    } else {
        hop_confidences.iter().sum::<f64>() / hop_confidences.len() as f64
    };

    InferredRoute {
        msg_key: msg_key.to_owned(),
        inferred_pubs,
        hop_confidences,
        route_confidence,
        unresolved: any_unresolved,
        max_teleport_km: if prev_gps.is_some() { Some(max_teleport_km) } else { None },
    }
}
