use serde::{Deserialize, Serialize};

/// The envelope every non-2xx JSON response on the HTTP surface carries:
/// `{"code": "...", "message": "...", "details": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HttpErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_without_details_field_when_none() {
        let env = HttpErrorEnvelope::new("not_found", "no such stream");
        let v = serde_json::to_value(&env).unwrap();
        assert!(v.get("details").is_none());
    }

    #[test]
    fn serializes_with_details_when_present() {
        let env = HttpErrorEnvelope::new("bad_request", "bad field")
            .with_details(serde_json::json!({"field": "ts"}));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["details"]["field"], "ts");
    }
}
