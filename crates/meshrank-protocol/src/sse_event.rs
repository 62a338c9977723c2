//! The tagged union broadcast on the dashboard and bot SSE streams. Follows
//! the same `type`-tagged, snake_case convention the rest of this service's
//! wire surface uses.

use serde::{Deserialize, Serialize};

use crate::rank::{MeshScoreSeries, ObserverRankItem, RankCache};

/// One message's aggregated delta for a `packet` SSE tick: every
/// `message_observers` row for the same `message_hash` collapses into a
/// single update rather than one event per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketUpdate {
    pub message_hash: String,
    pub frame_hash: String,
    pub observer_hits: Vec<String>,
    pub path_length: i64,
    pub repeats: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseEvent {
    /// Sent once, immediately after a client subscribes.
    Ready { server_time: String },
    /// One or more messages with newly observed `message_observers` rows,
    /// aggregated per message hash.
    Packet { updates: Vec<PacketUpdate> },
    /// Periodic counters: ingest lag, active streams, buffer depth.
    CountersUpdated {
        ingested_total: u64,
        observers_active: u32,
        repeaters_active: u32,
    },
    /// Fired whenever the repeater/observer/meshscore caches are recomputed.
    RanksUpdated {
        repeater_rank: RankCache,
        observer_rank: Vec<ObserverRankItem>,
        meshscore: MeshScoreSeries,
    },
    Health { healthy: bool, detail: String },
    /// A UI log line, mirrored from the ring-buffered logger.
    LogEntry { line: String },
    Ping,
    Error { code: String, message: String },
    /// A bot-channel reply, delivered over the separate bot SSE stream.
    BotReply {
        channel_name: String,
        body: String,
        in_reply_to: String,
    },
}
