use std::net::SocketAddr;

use serde::Deserialize;

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Socket address the server binds to. Overridden by `LYNKR_LISTEN`.
    pub listen_address: Option<SocketAddr>,

    /// Path of the liveness endpoint.
    pub health_path: String,

    /// Load shedding thresholds. New work is rejected with 503 when crossed;
    /// in-flight requests complete normally.
    pub load_shedding: LoadSheddingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            health_path: "/health/live".to_string(),
            load_shedding: LoadSheddingConfig::default(),
        }
    }
}

/// Memory-based load shedding configuration.
///
/// Overridden by `LOAD_SHEDDING_ENABLED` and `LOAD_SHEDDING_MAX_RSS_MB`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadSheddingConfig {
    /// Whether load shedding is active.
    pub enabled: bool,

    /// Process resident set size above which new requests are rejected, in megabytes.
    pub max_rss_mb: u64,
}

impl Default for LoadSheddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_rss_mb: 4096,
        }
    }
}
