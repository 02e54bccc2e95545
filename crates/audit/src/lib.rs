//! Deduplicated audit trail.
//!
//! Every request/response pair is appended to a JSONL audit log through a
//! bounded background writer, so audit work never blocks the request path.
//! Large fields are content-addressed into an append-only dictionary and
//! replaced by `{"$ref": hash, "size": n}` after their first occurrence in a
//! process lifetime.

#![deny(missing_docs)]

pub mod compact;
pub mod dictionary;
pub mod reader;
mod oversized;
mod writer;

use jiff::Timestamp;
use lynkr_config::AuditConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use dictionary::{Deduplicator, dictionary_hash, strip_empty_user_turns};
pub use writer::AuditWriter;

/// Fields eligible for deduplication, by record key.
const DEDUP_FIELDS: &[&str] = &["system_prompt", "user_messages", "user_query", "response"];

/// One audit record before field deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the record was produced.
    pub timestamp: Timestamp,
    /// What happened (`llm_request`, `llm_response`, `query`, ...).
    pub kind: String,
    /// Correlation id shared with session turns.
    pub correlation_id: String,
    /// Provider that served the call, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Model involved, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Record payload. Values under the dedup-eligible keys may be replaced
    /// by dictionary references.
    pub fields: serde_json::Map<String, Value>,
}

impl AuditRecord {
    /// A new record stamped now.
    pub fn new(kind: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            timestamp: Timestamp::now(),
            kind: kind.into(),
            correlation_id: correlation_id.into(),
            provider: None,
            model: None,
            fields: serde_json::Map::new(),
        }
    }

    /// Attach a field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// The audit logger: deduplicates eligible fields and hands the record to
/// the background writer. Constructed once at startup and shared.
pub struct AuditLogger {
    deduplicator: Deduplicator,
    writer: AuditWriter,
    config: AuditConfig,
}

impl AuditLogger {
    /// Open the audit log and dictionary, spawning the writer task.
    pub async fn open(config: AuditConfig) -> anyhow::Result<Self> {
        let deduplicator = Deduplicator::open(&config)?;
        let writer = AuditWriter::spawn(&config).await?;

        Ok(Self {
            deduplicator,
            writer,
            config,
        })
    }

    /// Record one audit entry. Dedup and truncation happen here, on the
    /// caller's task; the file append happens on the writer task.
    pub fn record(&self, mut record: AuditRecord) {
        if !self.config.enabled {
            return;
        }

        for key in DEDUP_FIELDS {
            if let Some(Value::String(content)) = record.fields.get(*key) {
                let deduplicated = self.deduplicator.process(content);
                record.fields.insert((*key).to_string(), deduplicated);
            }
        }

        match serde_json::to_string(&record) {
            Ok(line) => {
                let oversized = record
                    .fields
                    .values()
                    .any(|value| value.to_string().len() > self.config.oversized_threshold);

                if oversized {
                    oversized::capture(&self.config, &record.correlation_id, &line);
                }

                self.writer.append(line);
            }
            Err(e) => log::warn!("failed to serialize audit record: {e}"),
        }
    }

    /// Drain in-flight writes and close the log. Called during shutdown;
    /// idempotent, and later records are dropped with a warning.
    pub async fn close(&self) {
        self.writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> AuditConfig {
        AuditConfig {
            enabled: true,
            log_path: dir.join("audit.jsonl").display().to_string(),
            dictionary_path: dir.join("dictionary.jsonl").display().to_string(),
            truncate_over: 64,
            dedup_min_size: 16,
            oversized_dir: dir.join("oversized").display().to_string(),
            oversized_threshold: 1 << 20,
            oversized_retention: 3,
            restore_cache_size: 16,
        }
    }

    #[tokio::test]
    async fn second_occurrence_becomes_a_reference() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let logger = AuditLogger::open(config.clone()).await.unwrap();

        let prompt = "You are a helpful proxy. ".repeat(20);

        for i in 0..2 {
            logger.record(
                AuditRecord::new("llm_request", format!("corr-{i}")).field("system_prompt", prompt.clone()),
            );
        }

        logger.close().await;

        let log = std::fs::read_to_string(&config.log_path).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();

        // First sighting carries content and hash, second only the reference.
        assert!(first["fields"]["system_prompt"]["hash"].is_string());
        assert!(first["fields"]["system_prompt"]["content"].is_string());
        assert_eq!(
            second["fields"]["system_prompt"]["$ref"],
            first["fields"]["system_prompt"]["hash"]
        );
        assert_eq!(second["fields"]["system_prompt"]["size"], prompt.len());

        // The dictionary holds the full, untruncated content.
        let restored = reader::Restorer::open(&config)
            .unwrap()
            .restore(first["fields"]["system_prompt"]["hash"].as_str().unwrap())
            .unwrap();
        assert_eq!(restored, prompt);
    }

    #[tokio::test]
    async fn small_fields_are_left_inline() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let logger = AuditLogger::open(config.clone()).await.unwrap();

        logger.record(AuditRecord::new("query", "corr-1").field("user_query", "short"));
        logger.close().await;

        let log = std::fs::read_to_string(&config.log_path).unwrap();
        let record: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();

        assert_eq!(record["fields"]["user_query"], "short");
    }
}
