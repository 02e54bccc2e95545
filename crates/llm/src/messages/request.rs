use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical chat request. This is the shape the orchestrator consumes and
/// every adapter converts from; it matches the Anthropic messages API.
///
/// The request is created once per incoming HTTP call. The sanitiser deep
/// clones it; only the clone is ever mutated by the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Opaque model identifier.
    pub model: String,

    /// Top-level system instruction, a string or flattened blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    /// Ordered conversation turns.
    pub messages: Vec<Message>,

    /// Tool declarations offered to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,

    /// Hint on how the model should use tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Whether the response should stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Request metadata passed through to upstreams that support it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    /// Fields the client sent that no upstream understands
    /// (`provider`, `api_type`, `beta`, `thinking`, ...). Captured on
    /// ingress, dropped by the sanitiser.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ChatRequest {
    /// Number of tools declared on this request.
    pub fn tool_count(&self) -> usize {
        self.tools.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Text of the last user turn, flattening blocks.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.flatten_text())
            .filter(|text| !text.is_empty())
    }
}

/// System instruction: a plain string or Anthropic-style text blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Plain instruction text.
    Text(String),
    /// Block form as sent by newer Anthropic clients.
    Blocks(Vec<ContentBlock>),
}

impl SystemPrompt {
    /// Flatten to a single string, joining text blocks with newlines.
    pub fn flatten(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Sender of the turn.
    pub role: Role,
    /// Turn content, a string or a block sequence.
    pub content: MessageContent,
}

impl Message {
    /// A plain text turn.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    /// A block-sequence turn.
    pub fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End user input.
    User,
    /// Model output.
    Assistant,
    /// Tool output (OpenAI ingress only; the sanitiser folds these into
    /// user-role tool_result blocks).
    Tool,
}

/// Turn content container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple text content.
    Text(String),
    /// Structured block sequence.
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to plain text; tool blocks contribute nothing.
    pub fn flatten_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Blocks view; a text container reads as a single text block.
    pub fn to_blocks(&self) -> Vec<ContentBlock> {
        match self {
            Self::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            Self::Blocks(blocks) => blocks.clone(),
        }
    }

    /// Whether the content carries neither text nor blocks.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Blocks(blocks) => blocks.is_empty(),
        }
    }

    /// Whether any block is a `tool_use`.
    pub fn has_tool_use(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Blocks(blocks) => blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })),
        }
    }
}

/// Tagged content block. Every consumer matches on the variant explicitly;
/// there is no duck typing on a `type` field anywhere in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },

    /// Input text block produced by OpenAI responses-style clients.
    InputText {
        /// The text content.
        text: String,
    },

    /// Tool invocation requested by the model.
    ToolUse {
        /// Unique id correlating with a later `tool_result`.
        id: String,
        /// Declared tool name.
        name: String,
        /// Decoded argument object. Encoded to a string only at the last
        /// adapter hop, decoded immediately on ingress.
        input: Value,
    },

    /// Result of a tool invocation.
    ToolResult {
        /// Id of the `tool_use` block this answers.
        tool_use_id: String,
        /// Tool output.
        content: ToolResultContent,
        /// Whether the execution failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    /// Text of a `text` or `input_text` block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::InputText { text } => Some(text),
            _ => None,
        }
    }
}

/// Tool output, either plain text or nested blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Plain text output.
    Text(String),
    /// Structured output blocks.
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    /// Flatten to plain text.
    pub fn flatten_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Tool declaration offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,

    /// What the tool does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema subset describing the arguments.
    pub input_schema: Value,
}

/// Hint on how the model should use tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// Tools are disabled for this request.
    None,
    /// The model must call one tool of its choosing.
    Any,
    /// The model must call the named tool.
    Tool {
        /// Name of the required tool.
        name: String,
    },
}
