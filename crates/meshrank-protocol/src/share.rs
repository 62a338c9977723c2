use serde::{Deserialize, Serialize};

use crate::message::MessageView;

/// A short, collision-resistant code that resolves to a single message,
/// generated on demand and pruned once expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareCode {
    pub code: String,
    pub message_hash: String,
    pub created_at: String,
    pub expires_at: String,
}

/// `GET /api/share/:code`'s full body (§4.11): the code's metadata plus the
/// canonical message it names, already filtered through the assembler so
/// the route/observers match what the owning dashboard would show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareResolution {
    pub code: String,
    pub created_at: String,
    pub expires_at: String,
    pub message: MessageView,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_code_round_trips_through_json() {
        let s = ShareCode {
            code: "a1b2c3".into(),
            message_hash: "m1".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            expires_at: "2026-01-08T00:00:00Z".into(),
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: ShareCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
