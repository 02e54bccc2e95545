//! Content dictionary: hash-addressed storage for large audit fields.
//!
//! The dictionary file is append-only JSONL. The first sighting of a hash
//! writes a full entry carrying the complete pre-truncation content; every
//! later sighting appends an update entry with `first_seen` and `content`
//! null. Compaction (`lynkr-compact`) collapses the lines per hash offline.

use std::{
    collections::{HashMap, HashSet},
    fs::OpenOptions,
    io::Write as _,
    path::PathBuf,
    sync::Mutex,
};

use jiff::Timestamp;
use lynkr_config::AuditConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// One dictionary line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictionaryEntry {
    /// `sha256:<16 hex>` of the full content.
    pub hash: String,
    /// Set on the first sighting only; null on update entries.
    pub first_seen: Option<Timestamp>,
    /// Last time the hash was seen.
    pub last_seen: Timestamp,
    /// Sightings so far.
    pub use_count: u64,
    /// Full content on the first sighting; null on update entries.
    pub content: Option<String>,
}

/// Hash content for the dictionary: always computed on the full
/// pre-truncation text.
pub fn dictionary_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());

    let mut hex = String::with_capacity(23);
    hex.push_str("sha256:");
    for byte in digest.iter().take(8) {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Strip empty `User:` turns from a conversation transcript before hashing,
/// so transcripts differing only by trailing empty turns dedupe together.
pub fn strip_empty_user_turns(transcript: &str) -> String {
    transcript
        .split("\n\n")
        .filter(|segment| {
            let trimmed = segment.trim();
            trimmed != "User:" && !(trimmed.starts_with("User:") && trimmed["User:".len()..].trim().is_empty())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

struct DedupState {
    /// Hashes with a full entry already on disk (any process lifetime).
    known: HashSet<String>,
    /// Per-hash sighting counts for update entries.
    use_counts: HashMap<String, u64>,
    /// Hashes already emitted with content in this process lifetime.
    seen_this_session: HashSet<String>,
}

/// Deduplicates audit fields against the dictionary file.
pub struct Deduplicator {
    path: PathBuf,
    truncate_over: usize,
    min_size: usize,
    state: Mutex<DedupState>,
}

impl Deduplicator {
    /// Open the dictionary, indexing hashes already present on disk.
    pub fn open(config: &AuditConfig) -> anyhow::Result<Self> {
        let path = PathBuf::from(&config.dictionary_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut known = HashSet::new();
        let mut use_counts = HashMap::new();

        if path.exists() {
            for line in std::fs::read_to_string(&path)?.lines() {
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<DictionaryEntry>(line) {
                    Ok(entry) => {
                        use_counts
                            .entry(entry.hash.clone())
                            .and_modify(|count: &mut u64| *count = (*count).max(entry.use_count))
                            .or_insert(entry.use_count);
                        known.insert(entry.hash);
                    }
                    Err(e) => log::warn!("skipping malformed dictionary line: {e}"),
                }
            }
        }

        Ok(Self {
            path,
            truncate_over: config.truncate_over,
            min_size: config.dedup_min_size,
            state: Mutex::new(DedupState {
                known,
                use_counts,
                seen_this_session: HashSet::new(),
            }),
        })
    }

    /// Deduplicate one field value.
    ///
    /// Small content passes through inline. Otherwise the full content is
    /// hashed before any truncation; the first occurrence in this process
    /// emits `{hash, size, content}` (content possibly truncated), later
    /// occurrences emit `{"$ref": hash, "size": n}`.
    pub fn process(&self, content: &str) -> Value {
        if content.len() < self.min_size {
            return Value::String(content.to_string());
        }

        let hash = dictionary_hash(content);
        let size = content.len();

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let count = state.use_counts.entry(hash.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        let entry = if state.known.insert(hash.clone()) {
            DictionaryEntry {
                hash: hash.clone(),
                first_seen: Some(Timestamp::now()),
                last_seen: Timestamp::now(),
                use_count: count,
                content: Some(content.to_string()),
            }
        } else {
            DictionaryEntry {
                hash: hash.clone(),
                first_seen: None,
                last_seen: Timestamp::now(),
                use_count: count,
                content: None,
            }
        };

        if let Err(e) = self.append(&entry) {
            log::warn!("failed to append dictionary entry: {e}");
        }

        if state.seen_this_session.insert(hash.clone()) {
            let truncated = if content.len() > self.truncate_over {
                &content[..floor_char_boundary(content, self.truncate_over)]
            } else {
                content
            };

            json!({
                "hash": hash,
                "size": size,
                "content": truncated,
            })
        } else {
            json!({
                "$ref": hash,
                "size": size,
            })
        }
    }

    fn append(&self, entry: &DictionaryEntry) -> anyhow::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Largest byte index ≤ `index` that sits on a UTF-8 boundary.
fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> AuditConfig {
        AuditConfig {
            dictionary_path: dir.join("dictionary.jsonl").display().to_string(),
            truncate_over: 32,
            dedup_min_size: 16,
            ..Default::default()
        }
    }

    #[test]
    fn hash_is_computed_before_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let dedup = Deduplicator::open(&config(dir.path())).unwrap();

        let long = "x".repeat(100);
        let value = dedup.process(&long);

        // The emitted content is truncated, but the hash matches the full text.
        assert_eq!(value["hash"], dictionary_hash(&long));
        assert_eq!(value["size"], 100);
        assert_eq!(value["content"].as_str().unwrap().len(), 32);

        // And the dictionary entry keeps the full content.
        let line = std::fs::read_to_string(dir.path().join("dictionary.jsonl")).unwrap();
        let entry: DictionaryEntry = serde_json::from_str(line.lines().next().unwrap()).unwrap();
        assert_eq!(entry.content.as_deref(), Some(long.as_str()));
        assert!(entry.first_seen.is_some());
    }

    #[test]
    fn repeat_sightings_write_update_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dedup = Deduplicator::open(&config(dir.path())).unwrap();

        let content = "y".repeat(50);
        let first = dedup.process(&content);
        let second = dedup.process(&content);
        let third = dedup.process(&content);

        assert!(first.get("$ref").is_none());
        assert_eq!(second["$ref"], first["hash"]);
        assert_eq!(third["$ref"], first["hash"]);

        let lines: Vec<DictionaryEntry> = std::fs::read_to_string(dir.path().join("dictionary.jsonl"))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[1].first_seen.is_none());
        assert!(lines[1].content.is_none());
        assert_eq!(lines[2].use_count, 3);
    }

    #[test]
    fn known_hashes_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let content = "z".repeat(50);

        {
            let dedup = Deduplicator::open(&config(dir.path())).unwrap();
            dedup.process(&content);
        }

        // New process: dictionary already knows the hash, so only an update
        // entry lands; but the session cache starts fresh, so content is
        // emitted once more to the audit record.
        let dedup = Deduplicator::open(&config(dir.path())).unwrap();
        let value = dedup.process(&content);

        assert!(value.get("content").is_some());

        let lines: Vec<DictionaryEntry> = std::fs::read_to_string(dir.path().join("dictionary.jsonl"))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[1].content.is_none());
    }

    #[test]
    fn small_content_is_not_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let dedup = Deduplicator::open(&config(dir.path())).unwrap();

        assert_eq!(dedup.process("tiny"), Value::String("tiny".to_string()));
        assert!(!dir.path().join("dictionary.jsonl").exists());
    }

    #[test]
    fn empty_user_turns_are_stripped_for_hashing() {
        let transcript = "User: hello\n\nAssistant: hi\n\nUser:\n\nUser: bye";
        let stripped = strip_empty_user_turns(transcript);

        assert_eq!(stripped, "User: hello\n\nAssistant: hi\n\nUser: bye");
        assert_ne!(dictionary_hash(transcript), dictionary_hash(&stripped));
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let dedup = Deduplicator::open(&config(dir.path())).unwrap();

        let content = "é".repeat(40);
        let value = dedup.process(&content);

        // Would panic on a bad boundary; also verify it parsed as a string.
        assert!(value["content"].is_string());
    }
}
