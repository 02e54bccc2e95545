//! Long-term memory injection hook.
//!
//! Retrieval and extraction live outside the core; the orchestrator only
//! asks for memories relevant to the last user message and prepends them to
//! the system instruction on the first iteration.

use async_trait::async_trait;

/// Source of long-term memories.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// Memories relevant to the given user text, most relevant first.
    async fn recall(&self, last_user_text: &str) -> Vec<String>;
}

/// Format recalled memories into a system prompt fragment.
pub fn format_memories(memories: &[String]) -> Option<String> {
    if memories.is_empty() {
        return None;
    }

    let mut section = String::from("Relevant context from earlier sessions:\n");
    for memory in memories {
        section.push_str("- ");
        section.push_str(memory);
        section.push('\n');
    }

    Some(section)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recall_injects_nothing() {
        assert!(format_memories(&[]).is_none());
    }

    #[test]
    fn memories_become_a_bulleted_section() {
        let formatted = format_memories(&["prefers short answers".to_string(), "works in UTC".to_string()]).unwrap();

        assert!(formatted.contains("- prefers short answers"));
        assert!(formatted.contains("- works in UTC"));
    }
}
