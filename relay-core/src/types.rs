//! Core types: inbound chat messages, dialog turns, persisted thread nodes, usage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to an image plus the number of tokens it costs in a prompt.
///
/// The cost is computed once by whoever produced the reference and travels with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    pub token_cost: usize,
}

/// One part of multi-part content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image: ImageRef },
}

/// Plain text or a list of parts (text and images).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of all text parts (images are skipped).
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(self, MessageContent::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

/// Inbound message from the transport. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user_id: i64,
    pub chat_id: i64,
    pub platform_message_id: i64,
    pub reply_to_message_id: Option<i64>,
    pub content: MessageContent,
    pub is_forward: bool,
    /// Display label of the original sender when `is_forward` is set (user name, sender name or chat title).
    pub forward_sender: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Text message with no reply and no forward; used by the transport adapter and tests.
    pub fn text(user_id: i64, chat_id: i64, platform_message_id: i64, text: impl Into<String>) -> Self {
        Self {
            user_id,
            chat_id,
            platform_message_id,
            reply_to_message_id: None,
            content: MessageContent::Text(text.into()),
            is_forward: false,
            forward_sender: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_reply_to(mut self, message_id: i64) -> Self {
        self.reply_to_message_id = Some(message_id);
        self
    }

    pub fn forwarded_from(mut self, sender: Option<String>) -> Self {
        self.is_forward = true;
        self.forward_sender = sender;
        self
    }
}

/// Role of a turn, aligned with the chat-completions `role` values (system prompt is handled by the backend).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Function,
    Tool,
}

/// Legacy single function call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as produced by the model.
    pub arguments: String,
}

/// Tool call requested by the model; answered by a `tool` turn with the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionCall,
}

/// One role-tagged unit of conversation content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogTurn {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    /// Function name for `function` turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl DialogTurn {
    fn with_role(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            name: None,
            function_call: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, MessageContent::Text(text.into()))
    }

    pub fn user_content(content: MessageContent) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, MessageContent::Text(text.into()))
    }

    /// Assistant turn that only carries a legacy function call.
    pub fn function_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        let mut turn = Self::assistant("");
        turn.function_call = Some(FunctionCall {
            name: name.into(),
            arguments: arguments.into(),
        });
        turn
    }

    /// Assistant turn that only carries tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        let mut turn = Self::assistant("");
        turn.tool_calls = calls;
        turn
    }

    /// Result of a legacy function call.
    pub fn function_result(name: impl Into<String>, content: impl Into<String>) -> Self {
        let mut turn = Self::with_role(Role::Function, MessageContent::Text(content.into()));
        turn.name = Some(name.into());
        turn
    }

    /// Result of a tool call.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut turn = Self::with_role(Role::Tool, MessageContent::Text(content.into()));
        turn.tool_call_id = Some(tool_call_id.into());
        turn
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    /// True when the model asked for a function or tool call.
    pub fn has_call(&self) -> bool {
        self.function_call.is_some() || !self.tool_calls.is_empty()
    }
}

/// Kind of a persisted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    Summary,
    /// Sentinel persisted by an explicit "clear conversation"; carries no payload.
    Reset,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Message => "message",
            MessageKind::Summary => "summary",
            MessageKind::Reset => "reset",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "message" => Ok(MessageKind::Message),
            "summary" => Ok(MessageKind::Summary),
            "reset" => Ok(MessageKind::Reset),
            other => Err(format!("unknown message kind: {}", other)),
        }
    }
}

/// Platform message id used for nodes that were never sent to the chat (summaries, reset markers).
pub const NO_PLATFORM_MESSAGE_ID: i64 = -1;

/// Persisted thread node. Append-only; only `last_activated_at` ever changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub user_id: i64,
    pub chat_id: i64,
    pub platform_message_id: i64,
    pub payload: Option<DialogTurn>,
    pub created_at: DateTime<Utc>,
    pub last_activated_at: DateTime<Utc>,
    /// Ids of every earlier node of the branch this node continues.
    pub previous_message_ids: Vec<i64>,
    pub kind: MessageKind,
}

/// Fields for creating a [`StoredMessage`]; the store assigns `id` and timestamps.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: i64,
    pub chat_id: i64,
    pub platform_message_id: i64,
    pub payload: Option<DialogTurn>,
    pub previous_message_ids: Vec<i64>,
    pub kind: MessageKind,
}

/// Token accounting for one completion call. Write-only from the relay's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub user_id: i64,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Identifies a message the bot sent, for later edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingRef {
    pub chat_id: i64,
    pub message_id: i64,
}
