//! Canonical message types.
//!
//! A `StreamMessage` is the persistent unit of a conversation: every runner
//! emits them, the registry appends them to a session's history, and clients
//! render them. The shape follows the CLI provider's stream format closely,
//! so that provider's output deserializes directly into these types while the
//! thread provider is translated into them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A canonical conversation message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Lifecycle message; `subtype == "init"` carries the resume token.
    System(SystemMessage),
    /// Assistant output: text, thinking and tool-use requests.
    Assistant(AssistantMessage),
    /// Tool results (and echoed user input) fed back to the model.
    User(UserMessage),
    /// Terminal summary of a turn.
    Result(ResultMessage),
    /// The prompt a client submitted, recorded so history replays cleanly.
    UserPrompt(UserPromptMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Provider-issued resume token (CLI session id or thread id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(
        default,
        alias = "permissionMode",
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

/// Role-tagged content of an assistant or user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    #[serde(deserialize_with = "deserialize_content")]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        /// String or array of text blocks, as the provider sent it.
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// `success`, `error_during_execution`, `error_max_turns`, ...
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPromptMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub prompt: String,
}

/// Token counters reported at the end of a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

/// Accept either a bare string or an array of blocks.
fn deserialize_content<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Content {
        Text(String),
        Blocks(Vec<ContentBlock>),
    }

    Ok(match Content::deserialize(deserializer)? {
        Content::Text(text) => vec![ContentBlock::Text { text }],
        Content::Blocks(blocks) => blocks,
    })
}

fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl StreamMessage {
    /// Caller-supplied unique id, used for idempotent persistence.
    pub fn uuid(&self) -> Option<&str> {
        match self {
            StreamMessage::System(m) => m.uuid.as_deref(),
            StreamMessage::Assistant(m) => m.uuid.as_deref(),
            StreamMessage::User(m) => m.uuid.as_deref(),
            StreamMessage::Result(m) => m.uuid.as_deref(),
            StreamMessage::UserPrompt(m) => m.uuid.as_deref(),
        }
    }

    /// Assign a fresh uuid when the provider did not supply one.
    pub fn ensure_uuid(&mut self) -> &str {
        let slot = match self {
            StreamMessage::System(m) => &mut m.uuid,
            StreamMessage::Assistant(m) => &mut m.uuid,
            StreamMessage::User(m) => &mut m.uuid,
            StreamMessage::Result(m) => &mut m.uuid,
            StreamMessage::UserPrompt(m) => &mut m.uuid,
        };
        slot.get_or_insert_with(new_uuid)
    }

    /// The resume token carried by an init message.
    pub fn resume_token(&self) -> Option<&str> {
        match self {
            StreamMessage::System(m) if m.subtype == "init" => m.session_id.as_deref(),
            _ => None,
        }
    }

    /// Tool results carried by this message, as `(tool_use_id, is_error)`.
    pub fn tool_results(&self) -> Vec<(&str, bool)> {
        match self {
            StreamMessage::User(m) => m
                .message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        is_error,
                        ..
                    } => Some((tool_use_id.as_str(), is_error.unwrap_or(false))),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn init(
        session_id: impl Into<String>,
        model: Option<String>,
        cwd: Option<String>,
    ) -> Self {
        StreamMessage::System(SystemMessage {
            subtype: "init".to_string(),
            uuid: Some(new_uuid()),
            session_id: Some(session_id.into()),
            model,
            cwd,
            tools: Vec::new(),
            permission_mode: None,
        })
    }

    pub fn user_prompt(prompt: impl Into<String>) -> Self {
        StreamMessage::UserPrompt(UserPromptMessage {
            uuid: Some(new_uuid()),
            prompt: prompt.into(),
        })
    }

    pub fn assistant(session_id: Option<String>, content: Vec<ContentBlock>) -> Self {
        StreamMessage::Assistant(AssistantMessage {
            uuid: Some(new_uuid()),
            session_id,
            message: MessageBody {
                id: None,
                role: "assistant".to_string(),
                content,
                model: None,
            },
            parent_tool_use_id: None,
        })
    }

    pub fn assistant_text(session_id: Option<String>, text: impl Into<String>) -> Self {
        Self::assistant(session_id, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn tool_use(
        session_id: Option<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::assistant(
            session_id,
            vec![ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            }],
        )
    }

    pub fn tool_result(
        session_id: Option<String>,
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        StreamMessage::User(UserMessage {
            uuid: Some(new_uuid()),
            session_id,
            message: MessageBody {
                id: None,
                role: "user".to_string(),
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.into(),
                    content: Value::String(content.into()),
                    is_error: Some(is_error),
                }],
                model: None,
            },
            parent_tool_use_id: None,
        })
    }

    pub fn result_success(session_id: Option<String>, usage: Option<Usage>) -> Self {
        StreamMessage::Result(ResultMessage {
            subtype: "success".to_string(),
            is_error: false,
            uuid: Some(new_uuid()),
            session_id,
            result: None,
            usage,
            duration_ms: None,
            num_turns: None,
            total_cost_usd: None,
        })
    }

    pub fn result_error(session_id: Option<String>, error: impl Into<String>) -> Self {
        StreamMessage::Result(ResultMessage {
            subtype: "error_during_execution".to_string(),
            is_error: true,
            uuid: Some(new_uuid()),
            session_id,
            result: Some(error.into()),
            usage: None,
            duration_ms: None,
            num_turns: None,
            total_cost_usd: None,
        })
    }
}

impl ContentBlock {
    /// Flatten a tool result's content into plain text.
    pub fn result_text(content: &Value) -> String {
        match content {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}
