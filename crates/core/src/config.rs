use serde::{Deserialize, Serialize};

fn default_schema_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigIntervals {
    pub source_poll_ms: u64,
    pub artwork_timeout_ms: u64,
    pub file_watch_poll_ms: u64,
}

impl Default for ConfigIntervals {
    fn default() -> Self {
        Self {
            source_poll_ms: 2_000,
            artwork_timeout_ms: 10_000,
            file_watch_poll_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub source_priority: Vec<String>,
    pub intervals: ConfigIntervals,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            source_priority: vec![
                "apple_music".to_string(),
                "windows".to_string(),
                "mpris".to_string(),
            ],
            intervals: ConfigIntervals::default(),
            log_level: "info".to_string(),
        }
    }
}
