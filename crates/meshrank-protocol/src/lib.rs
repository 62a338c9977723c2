//! meshrank-protocol: wire types shared between the HTTP/SSE surface, the
//! storage façade, and the rank engines.
//!
//! All WebSocket/SSE discriminated payloads use a top-level `type` field for
//! tagged deserialization, mirroring the `kind`-tagged union convention this
//! service's surface follows.

pub mod device;
pub mod http_error;
pub mod message;
pub mod ndjson;
pub mod rank;
pub mod share;
pub mod sse_event;

pub use device::{Device, DeviceFlags, Observer};
pub use http_error::HttpErrorEnvelope;
pub use message::{Channel, Message, MessageObserver, MessageView, PathPoint};
pub use rank::{
    ExcludedRepeater, MeshScoreDay, MeshScoreSeries, ObserverRankItem, Quality, RankCache,
    RankItem, RelationKind, RepeatEvidence, ScoreColor, ZeroHopNeighborDetail,
};
pub use share::{ShareCode, ShareResolution};
pub use sse_event::{PacketUpdate, SseEvent};

pub use meshrank_geo::Gps;
