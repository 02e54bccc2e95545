//! Upstream health tracking, reported through the status surface.

use std::sync::Arc;

use dashmap::DashMap;
use jiff::Timestamp;

/// Health view of one upstream.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UpstreamHealth {
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Last error message observed.
    pub last_error: Option<String>,
    /// When the upstream last answered successfully.
    pub last_success: Option<Timestamp>,
    /// When the upstream last failed.
    pub last_failure: Option<Timestamp>,
}

impl UpstreamHealth {
    /// An upstream is healthy until proven otherwise.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures == 0
    }
}

/// Process-wide tracker, one entry per upstream. Updates are atomic per
/// entry; the map itself is lock-free for readers.
#[derive(Debug, Default)]
pub struct HealthTracker {
    upstreams: DashMap<String, UpstreamHealth>,
}

impl HealthTracker {
    /// An empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a successful call to an upstream.
    pub fn record_success(&self, provider: &str) {
        let mut entry = self.upstreams.entry(provider.to_string()).or_default();
        entry.consecutive_failures = 0;
        entry.last_error = None;
        entry.last_success = Some(Timestamp::now());
    }

    /// Record a failed call to an upstream.
    pub fn record_failure(&self, provider: &str, error: &str) {
        let mut entry = self.upstreams.entry(provider.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_error = Some(error.to_string());
        entry.last_failure = Some(Timestamp::now());
    }

    /// Health of one upstream, defaulting to healthy when never seen.
    pub fn get(&self, provider: &str) -> UpstreamHealth {
        self.upstreams
            .get(provider)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// All tracked upstreams.
    pub fn all(&self) -> Vec<(String, UpstreamHealth)> {
        self.upstreams
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
