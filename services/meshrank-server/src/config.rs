use std::path::PathBuf;

/// Process configuration, read once at boot from environment variables
/// (§6 of the interface contract). There is no file-based config layer;
/// every knob is an env var with a documented default.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub static_dir: PathBuf,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_redirect_uri: Option<String>,
    pub bot_token: Option<String>,
    pub debug_perf: bool,
    pub debug_sql: bool,
    pub geoscore: GeoscoreConfig,
    pub meshflow_jitter_ms: u64,
}

#[derive(Debug, Clone)]
pub struct GeoscoreConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub candidate_radius_km: f64,
}

impl Default for GeoscoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 20,
            candidate_radius_km: 200.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {value:?}: {reason}")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Testable without mutating the real process environment.
    pub fn from_env_with(getenv: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = match getenv("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                field: "PORT",
                value: raw,
                reason: e.to_string(),
            })?,
            None => 5199,
        };

        let data_dir = PathBuf::from(getenv("MESHRANK_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let db_path = getenv("MESHRANK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("meshrank.db"));
        let static_dir =
            PathBuf::from(getenv("MESHRANK_STATIC_DIR").unwrap_or_else(|| "./public".into()));

        let debug_perf = is_truthy(getenv("DEBUG_PERF"));
        let debug_sql = is_truthy(getenv("DEBUG_SQL"));

        let geoscore = GeoscoreConfig {
            enabled: getenv("GEOSCORE_DISABLED").map_or(true, |v| !is_truthy(Some(v))),
            batch_size: getenv("GEOSCORE_BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            candidate_radius_km: getenv("GEOSCORE_CANDIDATE_RADIUS_KM")
                .and_then(|v| v.parse().ok())
                .unwrap_or(200.0),
        };

        let meshflow_jitter_ms = getenv("MESHFLOW_JITTER")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            port,
            db_path,
            data_dir,
            static_dir,
            google_client_id: getenv("GOOGLE_CLIENT_ID"),
            google_client_secret: getenv("GOOGLE_CLIENT_SECRET"),
            google_redirect_uri: getenv("GOOGLE_REDIRECT_URI"),
            bot_token: getenv("MESHRANK_BOT_TOKEN"),
            debug_perf,
            debug_sql,
            geoscore,
            meshflow_jitter_ms,
        })
    }
}

fn is_truthy(v: Option<String>) -> bool {
    matches!(v.as_deref(), Some("1") | Some("true") | Some("TRUE") | Some("yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = Config::from_env_with(env(&[])).unwrap();
        assert_eq!(cfg.port, 5199);
        assert!(!cfg.debug_perf);
        assert!(cfg.geoscore.enabled);
    }

    #[test]
    fn port_parse_failure_is_reported() {
        let err = Config::from_env_with(env(&[("PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "PORT", .. }));
    }

    #[test]
    fn debug_flags_are_truthy_parsed() {
        let cfg = Config::from_env_with(env(&[("DEBUG_SQL", "true"), ("DEBUG_PERF", "1")])).unwrap();
        assert!(cfg.debug_sql);
        assert!(cfg.debug_perf);
    }

    #[test]
    fn geoscore_disabled_flag_flips_enabled() {
        let cfg = Config::from_env_with(env(&[("GEOSCORE_DISABLED", "1")])).unwrap();
        assert!(!cfg.geoscore.enabled);
    }
}
