//! Audit log reader: `$ref` restoration, filtering, stats and verification.

use std::{collections::HashMap, path::PathBuf};

use lynkr_config::AuditConfig;
use mini_moka::sync::Cache;
use serde_json::Value;

use crate::dictionary::DictionaryEntry;

/// Resolves dictionary references back to full content.
pub struct Restorer {
    contents: HashMap<String, String>,
    cache: Cache<String, String>,
}

impl Restorer {
    /// Load the dictionary into memory. Update entries carry no content, so
    /// only full entries populate the map.
    pub fn open(config: &AuditConfig) -> anyhow::Result<Self> {
        let path = PathBuf::from(&config.dictionary_path);
        let mut contents = HashMap::new();

        if path.exists() {
            for line in std::fs::read_to_string(&path)?.lines() {
                if line.trim().is_empty() {
                    continue;
                }

                if let Ok(entry) = serde_json::from_str::<DictionaryEntry>(line)
                    && let Some(content) = entry.content
                {
                    contents.insert(entry.hash, content);
                }
            }
        }

        Ok(Self {
            contents,
            cache: Cache::new(config.restore_cache_size),
        })
    }

    /// Full content for a hash, if the dictionary knows it.
    pub fn restore(&self, hash: &str) -> Option<String> {
        if let Some(content) = self.cache.get(&hash.to_string()) {
            return Some(content);
        }

        let content = self.contents.get(hash)?.clone();
        self.cache.insert(hash.to_string(), content.clone());
        Some(content)
    }

    /// Replace every `{"$ref": hash, ...}` object in a record with the full
    /// dictionary content. Unresolvable references are left in place.
    pub fn resolve_record(&self, record: &mut Value) {
        match record {
            Value::Object(map) => {
                if let Some(Value::String(hash)) = map.get("$ref") {
                    if let Some(content) = self.restore(hash) {
                        *record = Value::String(content);
                    }
                    return;
                }

                for value in map.values_mut() {
                    self.resolve_record(value);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.resolve_record(item);
                }
            }
            _ => {}
        }
    }

    /// Hashes referenced by a record that the dictionary cannot resolve.
    pub fn unresolved_refs(&self, record: &Value) -> Vec<String> {
        let mut missing = Vec::new();
        collect_refs(record, &mut |hash| {
            if !self.contents.contains_key(hash) {
                missing.push(hash.to_string());
            }
        });
        missing
    }
}

fn collect_refs(value: &Value, visit: &mut impl FnMut(&str)) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(hash)) = map.get("$ref") {
                visit(hash);
                return;
            }
            for child in map.values() {
                collect_refs(child, visit);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, visit);
            }
        }
        _ => {}
    }
}

/// Options for one reader pass, mirroring the CLI flags.
#[derive(Debug, Default)]
pub struct ReadOptions {
    /// Resolve references to full content.
    pub full: bool,
    /// `key=value` filters matched against top-level record fields.
    pub filters: Vec<(String, String)>,
    /// Only records with this correlation id.
    pub correlation_id: Option<String>,
    /// Only the last N records, after filtering.
    pub last: Option<usize>,
}

/// Aggregate stats over the audit log.
#[derive(Debug, Default, serde::Serialize)]
pub struct AuditStats {
    /// Total records read.
    pub records: u64,
    /// Records per kind.
    pub by_kind: HashMap<String, u64>,
    /// References encountered.
    pub references: u64,
    /// References the dictionary cannot resolve.
    pub unresolved_references: u64,
}

/// Read the audit log with the given options.
pub fn read(config: &AuditConfig, options: &ReadOptions) -> anyhow::Result<Vec<Value>> {
    let restorer = Restorer::open(config)?;
    let content = std::fs::read_to_string(&config.log_path)?;

    let mut records = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let Ok(mut record) = serde_json::from_str::<Value>(line) else {
            log::warn!("skipping malformed audit line");
            continue;
        };

        if let Some(id) = &options.correlation_id
            && record.get("correlation_id").and_then(Value::as_str) != Some(id.as_str())
        {
            continue;
        }

        let matches = options.filters.iter().all(|(key, expected)| {
            record
                .get(key)
                .map(|value| match value {
                    Value::String(s) => s == expected,
                    other => other.to_string() == *expected,
                })
                .unwrap_or(false)
        });

        if !matches {
            continue;
        }

        if options.full {
            restorer.resolve_record(&mut record);
        }

        records.push(record);
    }

    if let Some(last) = options.last
        && records.len() > last
    {
        records.drain(..records.len() - last);
    }

    Ok(records)
}

/// Compute stats and reference integrity over the whole log.
pub fn stats(config: &AuditConfig) -> anyhow::Result<AuditStats> {
    let restorer = Restorer::open(config)?;
    let content = std::fs::read_to_string(&config.log_path)?;

    let mut stats = AuditStats::default();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        stats.records += 1;

        if let Some(kind) = record.get("kind").and_then(Value::as_str) {
            *stats.by_kind.entry(kind.to_string()).or_default() += 1;
        }

        collect_refs(&record, &mut |hash| {
            stats.references += 1;
            if restorer.restore(hash).is_none() {
                stats.unresolved_references += 1;
            }
        });
    }

    Ok(stats)
}

/// Verify that every reference in the log resolves. Returns the number of
/// unresolved references.
pub fn verify(config: &AuditConfig) -> anyhow::Result<u64> {
    Ok(stats(config)?.unresolved_references)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dictionary::{Deduplicator, dictionary_hash};

    fn config(dir: &std::path::Path) -> AuditConfig {
        AuditConfig {
            log_path: dir.join("audit.jsonl").display().to_string(),
            dictionary_path: dir.join("dictionary.jsonl").display().to_string(),
            dedup_min_size: 8,
            truncate_over: 16,
            ..Default::default()
        }
    }

    fn write_log(config: &AuditConfig, lines: &[Value]) {
        let content: String = lines.iter().map(|line| format!("{line}\n")).collect();
        std::fs::write(&config.log_path, content).unwrap();
    }

    #[test]
    fn restore_round_trips_the_original_content() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let dedup = Deduplicator::open(&config).unwrap();
        let original = "the quick brown fox jumps over the lazy dog".to_string();
        let first = dedup.process(&original);
        let reference = dedup.process(&original);

        assert_eq!(reference["$ref"], first["hash"]);

        let restorer = Restorer::open(&config).unwrap();
        assert_eq!(restorer.restore(first["hash"].as_str().unwrap()).unwrap(), original);

        // Cached second lookup returns the same content.
        assert_eq!(restorer.restore(first["hash"].as_str().unwrap()).unwrap(), original);
    }

    #[test]
    fn full_read_resolves_references_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let dedup = Deduplicator::open(&config).unwrap();
        let content = "a reasonably long system prompt".to_string();
        dedup.process(&content);
        let reference = dedup.process(&content);

        write_log(
            &config,
            &[json!({
                "kind": "llm_request",
                "correlation_id": "c1",
                "fields": {"system_prompt": reference}
            })],
        );

        let records = read(
            &config,
            &ReadOptions {
                full: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(records[0]["fields"]["system_prompt"], content);
    }

    #[test]
    fn filters_and_last_compose() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(&config.dictionary_path, "").unwrap();

        write_log(
            &config,
            &[
                json!({"kind": "llm_request", "correlation_id": "a"}),
                json!({"kind": "llm_response", "correlation_id": "a"}),
                json!({"kind": "llm_request", "correlation_id": "b"}),
                json!({"kind": "llm_request", "correlation_id": "c"}),
            ],
        );

        let records = read(
            &config,
            &ReadOptions {
                filters: vec![("kind".to_string(), "llm_request".to_string())],
                last: Some(2),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["correlation_id"], "b");
        assert_eq!(records[1]["correlation_id"], "c");

        let by_id = read(
            &config,
            &ReadOptions {
                correlation_id: Some("a".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(by_id.len(), 2);
    }

    #[test]
    fn verify_counts_unresolved_references() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(&config.dictionary_path, "").unwrap();

        write_log(
            &config,
            &[json!({
                "kind": "llm_request",
                "fields": {"system_prompt": {"$ref": dictionary_hash("never stored"), "size": 12}}
            })],
        );

        assert_eq!(verify(&config).unwrap(), 1);
    }
}
