use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// System-tier messages are always retained by selection.
    pub fn is_system(self) -> bool {
        matches!(self, Role::System | Role::Developer)
    }
}

/// A content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
    },
}

/// Message content: either a bare string or structured blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(t) => t.is_empty(),
            MessageContent::Blocks(b) => b.is_empty(),
        }
    }
}

/// A single transcript message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Host-supplied stable id, when the host has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            id: None,
            role,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// All visible text, with tool inputs/outputs flattened to strings.
    pub fn flat_text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => parts.push(text.clone()),
                        ContentBlock::ToolUse { name, input, .. } => {
                            parts.push(format!("{name} {input}"));
                        }
                        ContentBlock::ToolResult { content, .. } => match content {
                            Value::String(s) => parts.push(s.clone()),
                            other => parts.push(other.to_string()),
                        },
                    }
                }
                parts.join("\n")
            }
        }
    }

    /// Ids of tool-use blocks emitted by this message.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Ids referenced by tool-result blocks in this message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn has_tool_blocks(&self) -> bool {
        !self.tool_use_ids().is_empty() || !self.tool_result_ids().is_empty()
    }
}

/// Identity carried by every hook event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookContext {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
}

/// Payload for `before-turn` and `after-turn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnEvent {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub ctx: HookContext,
}

/// Payload for `tool-call-return`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolReturnEvent {
    pub tool_name: String,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    pub result: String,
    #[serde(default)]
    pub ctx: HookContext,
}

/// What a before-turn invocation hands back to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Replace the transcript the model will see.
    Messages(Vec<Message>),
    /// Engine declined or failed; the host proceeds untouched.
    Passthrough,
}

/// What a tool-call-return invocation hands back to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolReturnOutcome {
    /// Replace the oversize result with a compact reference block.
    Result(String),
    Passthrough,
}
