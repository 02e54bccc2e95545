//! Tool-loop guards.
//!
//! Two layers: a per-request signature tracker that warns on the third
//! identical call and terminates past it, and a pre-sanitisation guard that
//! breaks runaway loops carried across requests by counting tool results
//! since the last user text.

use std::collections::HashMap;

use lynkr_llm::messages::{
    ChatRequest, ContentBlock, MessageContent, Role, ToolCall, tool_call_signature,
};

/// What the signature tracker says about a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    /// Nothing notable; execute the call.
    Proceed,
    /// The signature just hit the warning threshold; inject a warning.
    Warn,
    /// The signature passed the threshold; terminate the loop.
    Terminate,
}

/// Per-request tracker of identical `(name, canonical args)` signatures.
pub struct SignatureTracker {
    warning_threshold: u32,
    counts: HashMap<String, u32>,
}

impl SignatureTracker {
    /// Tracker warning at `warning_threshold` occurrences and terminating
    /// one past it.
    pub fn new(warning_threshold: u32) -> Self {
        Self {
            warning_threshold,
            counts: HashMap::new(),
        }
    }

    /// Record a call and decide what to do about it.
    pub fn observe(&mut self, call: &ToolCall) -> GuardAction {
        let signature = tool_call_signature(&call.name, &call.arguments);
        let count = self.counts.entry(signature).or_insert(0);
        *count += 1;

        match (*count).cmp(&self.warning_threshold) {
            std::cmp::Ordering::Less => GuardAction::Proceed,
            std::cmp::Ordering::Equal => GuardAction::Warn,
            std::cmp::Ordering::Greater => GuardAction::Terminate,
        }
    }

    /// Warning text injected as a user turn when a signature hits the
    /// threshold.
    pub fn warning_text(&self, call: &ToolCall) -> String {
        format!(
            "Notice: you have called '{}' with identical arguments {} times. \
             Do not repeat this call; use the results you already have or answer directly.",
            call.name, self.warning_threshold
        )
    }
}

/// Count `tool_result` blocks appearing after the last user turn that
/// carries actual text.
pub fn tool_results_since_last_user_text(request: &ChatRequest) -> usize {
    let mut count = 0;

    for message in request.messages.iter().rev() {
        let mut message_results = 0;
        let mut has_user_text = false;

        match &message.content {
            MessageContent::Text(text) => {
                has_user_text = message.role == Role::User && !text.trim().is_empty();
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::ToolResult { .. } => message_results += 1,
                        ContentBlock::Text { text } | ContentBlock::InputText { text } => {
                            if message.role == Role::User && !text.trim().is_empty() {
                                has_user_text = true;
                            }
                        }
                        ContentBlock::ToolUse { .. } => {}
                    }
                }
            }
        }

        count += message_results;

        if has_user_text {
            break;
        }
    }

    count
}

/// Summarise accumulated tool results into the text of the synthesised
/// guard response.
pub fn summarize_tool_results(request: &ChatRequest) -> String {
    let mut summaries = Vec::new();

    for message in &request.messages {
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let ContentBlock::ToolResult { content, .. } = block {
                    let text = content.flatten_text();
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        let mut line = trimmed.chars().take(400).collect::<String>();
                        if trimmed.chars().count() > 400 {
                            line.push('…');
                        }
                        summaries.push(format!("- {line}"));
                    }
                }
            }
        }
    }

    if summaries.is_empty() {
        "I gathered the requested tool results but received no further instructions; stopping here.".to_string()
    } else {
        format!(
            "Based on the tool results gathered so far:\n\n{}\n\nStopping further tool calls to avoid a loop.",
            summaries.join("\n")
        )
    }
}
