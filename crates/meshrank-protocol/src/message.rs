use meshrank_geo::Gps;
use serde::{Deserialize, Serialize};

/// A channel-directory entry. `code` is the client-supplied PSK/name hash
/// used to look up the channel without trusting the plaintext name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    pub code: String,
    #[serde(default)]
    pub allow_popular: bool,
    pub created_at: String,
}

/// One decoded mesh message, deduplicated on `(message_hash)` and carrying
/// the best-known repeat path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_hash: String,
    pub frame_hash: String,
    pub channel_name: String,
    #[serde(default)]
    pub sender: Option<String>,
    pub body: String,
    pub ts: String,
    pub path_length: u32,
    #[serde(default)]
    pub path: Vec<String>,
    pub repeats: u32,
}

/// Raw observation: which observer saw this message, by what path, when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageObserver {
    pub message_hash: String,
    pub observer_id: String,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub ts_ms: Option<i64>,
}

/// A node in a resolved display path: hash byte, resolved name (if any
/// device claims it), and GPS (if usable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    pub hash: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub gps: Option<Gps>,
}

/// The assembled, display-ready form of a message: the merge of the
/// canonical [`Message`] row with every [`MessageObserver`] that has been
/// seen for it, resolved against the device table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub message_hash: String,
    pub frame_hash: String,
    pub channel_name: String,
    #[serde(default)]
    pub sender: Option<String>,
    pub body: String,
    pub ts: String,
    pub repeats: u32,
    pub path: Vec<String>,
    pub path_names: Vec<String>,
    pub path_points: Vec<PathPoint>,
    pub path_length: u32,
    pub observer_hits: Vec<String>,
    pub observer_count: u32,
    pub observer_paths: Vec<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_view_round_trips_through_json() {
        let view = MessageView {
            message_hash: "m1".into(),
            frame_hash: "f1".into(),
            channel_name: "general".into(),
            sender: Some("node1".into()),
            body: "hi".into(),
            ts: "2026-01-01T00:00:00Z".into(),
            repeats: 2,
            path: vec!["AB".into(), "CD".into()],
            path_names: vec!["Repeater A".into()],
            path_points: vec![PathPoint {
                hash: "AB".into(),
                name: Some("Repeater A".into()),
                gps: None,
            }],
            path_length: 2,
            observer_hits: vec!["OBS1".into(), "OBS2".into(), "OBS3".into()],
            observer_count: 2,
            observer_paths: vec![vec!["AB".into()]],
        };
        let json = serde_json::to_string(&view).unwrap();
        let back: MessageView = serde_json::from_str(&json).unwrap();
        assert_eq!(back, view);
    }
}
