//! Per-session capture of oversized audit records.
//!
//! Records with any field over the configured threshold are additionally
//! written to per-session files so they can be inspected without paging
//! through the main log. Retention is capped per session.

use std::path::{Path, PathBuf};

use lynkr_config::AuditConfig;

pub(crate) fn capture(config: &AuditConfig, correlation_id: &str, line: &str) {
    let dir = PathBuf::from(&config.oversized_dir);

    if let Err(e) = std::fs::create_dir_all(&dir) {
        log::warn!("cannot create oversized dir {}: {e}", dir.display());
        return;
    }

    let session_prefix = format!("session-{}", sanitize_id(correlation_id));

    if let Err(e) = enforce_retention(&dir, &session_prefix, config.oversized_retention) {
        log::warn!("oversized retention sweep failed: {e}");
    }

    let sequence = next_sequence(&dir, &session_prefix);
    let path = dir.join(format!("{session_prefix}-{sequence:04}.jsonl"));

    if let Err(e) = std::fs::write(&path, format!("{line}\n")) {
        log::warn!("cannot write oversized record {}: {e}", path.display());
    }
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn session_files(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix))
        })
        .collect();

    files.sort();
    files
}

fn next_sequence(dir: &Path, prefix: &str) -> u32 {
    session_files(dir, prefix)
        .last()
        .and_then(|path| path.file_stem()?.to_str()?.rsplit('-').next()?.parse::<u32>().ok())
        .map(|n| n + 1)
        .unwrap_or(0)
}

fn enforce_retention(dir: &Path, prefix: &str, retention: usize) -> std::io::Result<()> {
    let files = session_files(dir, prefix);

    if files.len() < retention.max(1) {
        return Ok(());
    }

    // Oldest first; keep retention - 1 so the new file fits the cap.
    let excess = files.len() + 1 - retention.max(1);
    for path in files.into_iter().take(excess) {
        std::fs::remove_file(path)?;
    }

    Ok(())
}
