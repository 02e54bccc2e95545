//! Request sanitiser.
//!
//! Turns a raw client payload into a clean canonical request that is safe to
//! mutate and safe to hand to any adapter. Rules run in a fixed order; the
//! incoming request is cloned first and never touched.

use lynkr_config::{LlmConfig, LlmProviderConfig};
use serde_json::json;

use crate::messages::{ChatRequest, ContentBlock, Message, MessageContent, Role, ToolDefinition};

/// Historical artifact prefix left by older clients; these placeholder
/// results and their paired tool_use blocks are stripped to keep the
/// id-matching invariant.
const PLACEHOLDER_RESULT_PREFIX: &str = "Web search results for query:";

/// Last user turns longer than this get a focus instruction appended.
const LONG_TURN_THRESHOLD: usize = 4000;

const FOCUS_INSTRUCTION: &str =
    "\n\n[Focus on answering the most recent request above; earlier context is background.]";

/// Separator used when merging consecutive same-role text turns.
const MERGE_SEPARATOR: &str = "\n\n";

/// Classified intent of the request, driving smart tool selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Editing or writing code.
    CodeEdit,
    /// Research and lookup work.
    Research,
    /// Small talk; tools are noise.
    Conversational,
    /// Anything else keeps the full tool set.
    General,
}

/// The standard tool set injected when a client declares none.
pub fn standard_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "web_search".to_string(),
            description: Some("Search the web for current information".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: "web_fetch".to_string(),
            description: Some("Fetch the contents of a URL".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }),
        },
        ToolDefinition {
            name: "bash".to_string(),
            description: Some("Run a shell command in the working directory".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: "read_file".to_string(),
            description: Some("Read a file from the working directory".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "write_file".to_string(),
            description: Some("Write a file under the working directory".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}, "content": {"type": "string"}},
                "required": ["path", "content"]
            }),
        },
        ToolDefinition {
            name: "task".to_string(),
            description: Some("Delegate a self-contained task to a subagent".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"prompt": {"type": "string"}},
                "required": ["prompt"]
            }),
        },
    ]
}

/// Produce the clean payload the agent loop mutates. The input is cloned;
/// the original request is never modified.
pub fn clean(payload: &ChatRequest, config: &LlmConfig) -> ChatRequest {
    let mut request = payload.clone();

    // 1. Model: trimmed client value or the default provider's model.
    request.model = request.model.trim().to_string();
    if request.model.is_empty()
        && let Some(model) = default_model(config)
    {
        request.model = model;
    }

    // 2. Fold OpenAI-style tool-role turns into user-role result blocks.
    normalise_roles(&mut request);

    // 3. Non-portable fields never leave the proxy.
    request.extra.clear();

    // 4. Placeholder tool_results and their paired tool_use blocks.
    strip_placeholder_results(&mut request);

    // 5. Empty turns carry no information unless they hold a tool_use.
    request
        .messages
        .retain(|message| !message.content.is_empty() || message.content.has_tool_use());

    // 6. Merge consecutive same-role turns; nudge focus on very long tails.
    merge_consecutive(&mut request);
    append_focus_instruction(&mut request);

    // 7. Tool schemas must declare an object root.
    if let Some(tools) = &mut request.tools {
        for tool in tools.iter_mut() {
            ensure_object_schema(tool);
        }
    }

    // Inject the standard set when the client declared nothing.
    if request.tools.as_ref().is_none_or(Vec::is_empty) && config.inject_standard_tools {
        request.tools = Some(standard_tools());
    }

    // 8 + 9. Smart tool selection, including the conversational strip.
    apply_tool_selection(&mut request);

    // 10. Streaming is opt-in.
    if request.stream.is_none() {
        request.stream = Some(false);
    }

    request
}

fn default_model(config: &LlmConfig) -> Option<String> {
    let name = config.default_provider.as_ref()?;

    match config.providers.get(name)? {
        LlmProviderConfig::Anthropic(api)
        | LlmProviderConfig::Openai(api)
        | LlmProviderConfig::OpenaiResponses(api)
        | LlmProviderConfig::Llamacpp(api)
        | LlmProviderConfig::Google(api) => api.model.clone(),
        LlmProviderConfig::Ollama(ollama) => ollama.model.clone(),
        LlmProviderConfig::Bedrock(bedrock) => bedrock.model.clone(),
        LlmProviderConfig::Zai(zai) => zai.model.clone(),
    }
}

/// Tool-role turns become user turns, which is the canonical encoding for
/// result content. A bare tool turn with no result block cannot be
/// correlated, so its text simply rides along as user content.
fn normalise_roles(request: &mut ChatRequest) {
    for message in &mut request.messages {
        if message.role == Role::Tool {
            message.role = Role::User;
        }
    }
}

fn strip_placeholder_results(request: &mut ChatRequest) {
    let mut placeholder_ids = Vec::new();

    for message in &request.messages {
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let ContentBlock::ToolResult {
                    tool_use_id, content, ..
                } = block
                    && content.flatten_text().starts_with(PLACEHOLDER_RESULT_PREFIX)
                {
                    placeholder_ids.push(tool_use_id.clone());
                }
            }
        }
    }

    if placeholder_ids.is_empty() {
        return;
    }

    for message in &mut request.messages {
        if let MessageContent::Blocks(blocks) = &mut message.content {
            blocks.retain(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => !placeholder_ids.contains(tool_use_id),
                ContentBlock::ToolUse { id, .. } => !placeholder_ids.contains(id),
                _ => true,
            });
        }
    }
}

fn merge_consecutive(request: &mut ChatRequest) {
    let messages = std::mem::take(&mut request.messages);
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());

    for message in messages {
        match merged.last_mut() {
            Some(previous) if previous.role == message.role => {
                match (&mut previous.content, &message.content) {
                    (MessageContent::Text(left), MessageContent::Text(right)) => {
                        left.push_str(MERGE_SEPARATOR);
                        left.push_str(right);
                    }
                    _ => {
                        let mut blocks = previous.content.to_blocks();
                        blocks.extend(message.content.to_blocks());
                        previous.content = MessageContent::Blocks(blocks);
                    }
                }
            }
            _ => merged.push(message),
        }
    }

    request.messages = merged;
}

fn append_focus_instruction(request: &mut ChatRequest) {
    if request.tool_count() > 0 {
        return;
    }

    let Some(last) = request.messages.last_mut() else {
        return;
    };

    if last.role != Role::User {
        return;
    }

    let text = last.content.flatten_text();
    if text.len() <= LONG_TURN_THRESHOLD || last.content.has_tool_use() {
        return;
    }

    match &mut last.content {
        MessageContent::Text(text) => text.push_str(FOCUS_INSTRUCTION),
        MessageContent::Blocks(blocks) => blocks.push(ContentBlock::Text {
            text: FOCUS_INSTRUCTION.to_string(),
        }),
    }
}

fn ensure_object_schema(tool: &mut ToolDefinition) {
    let schema = &mut tool.input_schema;

    if !schema.is_object() {
        tool.input_schema = json!({"type": "object", "properties": {}});
        return;
    }

    if let Some(object) = schema.as_object_mut()
        && object.get("type").and_then(|t| t.as_str()) != Some("object")
    {
        object.insert("type".to_string(), json!("object"));
        object.entry("properties").or_insert_with(|| json!({}));
    }
}

/// Classify the request from its last user turn.
pub fn classify(request: &ChatRequest) -> RequestKind {
    let Some(text) = request.last_user_text() else {
        return RequestKind::General;
    };

    let lowered = text.to_lowercase();

    if is_conversational(&lowered) {
        return RequestKind::Conversational;
    }

    const CODE_MARKERS: &[&str] = &[
        "```", "fix the", "refactor", "implement", "compile", "stack trace", "function", "write a test",
        "rename", ".rs", ".py", ".ts",
    ];
    if CODE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return RequestKind::CodeEdit;
    }

    const RESEARCH_MARKERS: &[&str] = &[
        "search", "look up", "find out", "latest", "news", "documentation for", "what is the current",
    ];
    if RESEARCH_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return RequestKind::Research;
    }

    RequestKind::General
}

fn is_conversational(lowered: &str) -> bool {
    if lowered.len() > 80 {
        return false;
    }

    const GREETINGS: &[&str] = &[
        "hi", "hello", "hey", "thanks", "thank you", "ok", "okay", "good morning", "good evening", "yo",
        "how are you",
    ];

    let trimmed = lowered.trim_end_matches(['!', '.', '?', ' ']);

    if GREETINGS.iter().any(|greeting| trimmed == *greeting || trimmed.starts_with(&format!("{greeting} "))) {
        return true;
    }

    // Short non-technical chatter: few words, no code or path markers.
    let word_count = trimmed.split_whitespace().count();
    word_count <= 4 && !trimmed.contains('`') && !trimmed.contains('/') && !trimmed.contains('.')
}

/// Keep only the tools matching the classified request kind. An empty
/// selection removes the tools field entirely, as does a conversational turn.
fn apply_tool_selection(request: &mut ChatRequest) {
    let Some(tools) = &request.tools else {
        return;
    };

    if tools.is_empty() {
        request.tools = None;
        return;
    }

    let kind = classify(request);

    let keep = |name: &str| -> bool {
        let lowered = name.to_lowercase();

        let is_web = lowered.contains("search") || lowered.contains("fetch") || lowered.contains("web");
        let is_file = lowered.contains("file")
            || lowered.contains("read")
            || lowered.contains("write")
            || lowered.contains("edit")
            || lowered.contains("glob")
            || lowered.contains("grep");
        let is_exec = lowered.contains("bash") || lowered.contains("shell") || lowered.contains("command");
        let is_task = lowered.contains("task") || lowered.contains("agent");

        match kind {
            RequestKind::Conversational => false,
            RequestKind::CodeEdit => is_file || is_exec || is_task,
            RequestKind::Research => is_web || is_task,
            RequestKind::General => true,
        }
    };

    let selected: Vec<ToolDefinition> = request
        .tools
        .take()
        .unwrap_or_default()
        .into_iter()
        .filter(|tool| keep(&tool.name))
        .collect();

    if selected.is_empty() {
        request.tools = None;
        request.tool_choice = None;
    } else {
        request.tools = Some(selected);
    }
}
