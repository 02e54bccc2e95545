//! Audit log and content dictionary configuration.

use serde::Deserialize;

/// Audit trail configuration.
///
/// Paths are overridden by `AUDIT_LOG_PATH` and `AUDIT_DICTIONARY_PATH`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    /// Whether audit logging is active.
    pub enabled: bool,

    /// JSONL file receiving audit records.
    pub log_path: String,

    /// JSONL content dictionary used for deduplication.
    pub dictionary_path: String,

    /// Content longer than this is truncated in audit records. The
    /// dictionary always keeps the full content.
    pub truncate_over: usize,

    /// Fields smaller than this are never deduplicated.
    pub dedup_min_size: usize,

    /// Directory receiving per-session oversized warn/error records.
    pub oversized_dir: String,

    /// Any record field above this size counts as oversized.
    pub oversized_threshold: usize,

    /// Oversized files retained per session.
    pub oversized_retention: usize,

    /// Capacity of the in-memory cache used when resolving `$ref` entries.
    pub restore_cache_size: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: "logs/audit.jsonl".to_string(),
            dictionary_path: "logs/audit-dictionary.jsonl".to_string(),
            truncate_over: 4096,
            dedup_min_size: 256,
            oversized_dir: "logs/oversized".to_string(),
            oversized_threshold: 64 * 1024,
            oversized_retention: 20,
            restore_cache_size: 512,
        }
    }
}
