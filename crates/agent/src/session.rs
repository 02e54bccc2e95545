//! Append-only session transcript.
//!
//! Turn order is a total order per session matching the causal order of the
//! loop. The record is owned and mutated only by its request task.

use std::{
    fs::OpenOptions,
    io::Write as _,
    path::PathBuf,
};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a turn records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnKind {
    /// Plain message content.
    Message,
    /// The model asked for tool execution.
    ToolRequest,
    /// A tool produced output.
    ToolResult,
    /// Something failed.
    Error,
    /// A guard injected a warning.
    SystemWarning,
}

/// One session turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Position in the session, starting at 0.
    pub turn_index: u64,
    /// Who produced the turn.
    pub role: String,
    /// What the turn records.
    pub kind: TurnKind,
    /// Outcome marker (`ok`, `error`, `denied`, ...).
    pub status: String,
    /// Turn content, flattened to text.
    pub content: String,
    /// Structured extras (tool name, signature, provider, ...).
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    /// When the turn was appended.
    pub timestamp: Timestamp,
}

/// Append-only per-session transcript, optionally persisted as JSONL.
pub struct SessionRecorder {
    id: String,
    turns: Vec<Turn>,
    path: Option<PathBuf>,
}

impl SessionRecorder {
    /// A new session. With a directory, turns also append to
    /// `<dir>/<id>.jsonl`.
    pub fn new(id: impl Into<String>, dir: Option<&str>) -> Self {
        let id = id.into();

        let path = dir.map(|dir| {
            let dir = PathBuf::from(dir);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                log::warn!("cannot create session dir {}: {e}", dir.display());
            }
            dir.join(format!("{id}.jsonl"))
        });

        Self {
            id,
            turns: Vec::new(),
            path,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append one turn.
    pub fn append(&mut self, role: &str, kind: TurnKind, status: &str, content: impl Into<String>, metadata: Value) {
        let turn = Turn {
            turn_index: self.turns.len() as u64,
            role: role.to_string(),
            kind,
            status: status.to_string(),
            content: content.into(),
            metadata,
            timestamp: Timestamp::now(),
        };

        if let Some(path) = &self.path
            && let Ok(line) = serde_json::to_string(&turn)
        {
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{line}"));

            if let Err(e) = written {
                log::warn!("session append failed for {}: {e}", self.id);
            }
        }

        self.turns.push(turn);
    }

    /// All turns so far.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn turn_indices_are_dense_and_ordered() {
        let mut session = SessionRecorder::new("s1", None);

        session.append("user", TurnKind::Message, "ok", "hello", Value::Null);
        session.append("assistant", TurnKind::ToolRequest, "ok", "", json!({"tool": "bash"}));
        session.append("tool", TurnKind::ToolResult, "ok", "output", Value::Null);

        let indices: Vec<u64> = session.turns().iter().map(|turn| turn.turn_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn turns_persist_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().display().to_string();

        let mut session = SessionRecorder::new("persisted", Some(&dir_str));
        session.append("user", TurnKind::Message, "ok", "hello", Value::Null);
        session.append("assistant", TurnKind::Message, "ok", "hi", Value::Null);

        let content = std::fs::read_to_string(dir.path().join("persisted.jsonl")).unwrap();
        let turns: Vec<Turn> = content.lines().map(|line| serde_json::from_str(line).unwrap()).collect();

        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "hi");
        assert_eq!(turns[1].kind, TurnKind::Message);
    }
}
