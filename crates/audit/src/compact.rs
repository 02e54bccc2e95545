//! Offline dictionary compaction.
//!
//! The dictionary grows one line per sighting. Compaction collapses all
//! lines for a hash into a single canonical entry carrying the earliest
//! `first_seen`, the latest `last_seen`, the highest `use_count` and the
//! content, then atomically replaces the file.

use std::{collections::BTreeMap, path::Path};

use crate::dictionary::DictionaryEntry;

/// Result of one compaction pass.
#[derive(Debug, serde::Serialize)]
pub struct CompactionReport {
    /// Lines before compaction.
    pub lines_before: u64,
    /// Entries after compaction.
    pub entries_after: u64,
    /// Hashes whose content never appeared in any line.
    pub missing_content: u64,
}

/// Compact the dictionary file in place.
pub fn compact(path: &Path) -> anyhow::Result<CompactionReport> {
    let content = std::fs::read_to_string(path)?;

    let mut merged: BTreeMap<String, DictionaryEntry> = BTreeMap::new();
    let mut lines_before = 0u64;

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }

        lines_before += 1;

        let entry: DictionaryEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("skipping malformed dictionary line during compaction: {e}");
                continue;
            }
        };

        match merged.get_mut(&entry.hash) {
            Some(existing) => {
                existing.use_count = existing.use_count.max(entry.use_count);
                existing.last_seen = existing.last_seen.max(entry.last_seen);

                if existing.first_seen.is_none() {
                    existing.first_seen = entry.first_seen;
                } else if let Some(first_seen) = entry.first_seen {
                    existing.first_seen = existing.first_seen.map(|current| current.min(first_seen));
                }

                if existing.content.is_none() {
                    existing.content = entry.content;
                }
            }
            None => {
                merged.insert(entry.hash.clone(), entry);
            }
        }
    }

    let missing_content = merged.values().filter(|entry| entry.content.is_none()).count() as u64;
    let entries_after = merged.len() as u64;

    let mut output = String::new();
    for entry in merged.values() {
        output.push_str(&serde_json::to_string(entry)?);
        output.push('\n');
    }

    // Atomic replace: write a sibling temp file, then rename over.
    let temp = path.with_extension("jsonl.tmp");
    std::fs::write(&temp, output)?;
    std::fs::rename(&temp, path)?;

    Ok(CompactionReport {
        lines_before,
        entries_after,
        missing_content,
    })
}
