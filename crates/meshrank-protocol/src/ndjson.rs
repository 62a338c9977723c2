//! Raw line shapes for the NDJSON files the ingest tailer follows
//! (`observer.ndjson`, `rf.ndjson`, `decoded.ndjson`). These mirror the
//! producer's field names exactly; parsing into the richer [`crate::message`]
//! and [`crate::device`] types happens downstream in the ingest pipeline.

use serde::{Deserialize, Serialize};

/// One line of `rf.ndjson`: a raw RF frame as heard by an observer, before
/// decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfLine {
    pub ts: String,
    #[serde(default)]
    pub archived_at: Option<String>,
    pub observer_id: String,
    pub frame_hash: String,
    pub payload_hex: String,
    #[serde(default)]
    pub rssi: Option<f64>,
    #[serde(default)]
    pub snr: Option<f64>,
}

/// One line of `decoded.ndjson`: a successfully decoded application frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedLine {
    pub ts: String,
    pub observer_id: String,
    pub frame_hash: String,
    pub message_hash: String,
    pub topic: String,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub sender: Option<String>,
    pub body: String,
}

/// One line of `observer.ndjson`: an observer-heartbeat/self-advert record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverLine {
    pub ts: String,
    pub observer_id: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

/// A byte offset bookmark into an NDJSON file, persisted across restarts so
/// the tailer resumes instead of re-reading from the start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailCursor {
    pub offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoded_line_defaults_path_to_empty() {
        let json = r#"{"ts":"2026-01-01T00:00:00Z","observer_id":"obs1","frame_hash":"f1","message_hash":"m1","topic":"general","body":"hi"}"#;
        let line: DecodedLine = serde_json::from_str(json).unwrap();
        assert!(line.path.is_empty());
        assert!(line.sender.is_none());
    }

    #[test]
    fn tail_cursor_defaults_to_zero() {
        assert_eq!(TailCursor::default().offset, 0);
    }
}
