//! Message and Conversation domain types.
//!
//! A conversation is the full negotiation context replayed to the model on
//! every iteration: user turns, assistant turns (optionally requesting tool
//! invocations) and one tool-result frame per requested invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::{ToolCallOutcome, ToolCallRequest};

/// Unique identifier for a conversation (session).
///
/// Opaque to the server; generated ids look like `conv_1a2b3c4d`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("conv_{}", &hex[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The end user
    User,
    /// The model
    Assistant,
    /// Outcome of one tool invocation
    ToolResult,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content; `None` for tool-result frames and for assistant
    /// turns that only request tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Tool invocations requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// If this is a tool result, the outcome it carries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_outcome: Option<ToolCallOutcome>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: None,
            tool_calls: Vec::new(),
            tool_outcome: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::with_role(Role::User)
        }
    }

    /// Create a new assistant message carrying final text.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::with_role(Role::Assistant)
        }
    }

    /// Create an assistant message that requests tool invocations.
    pub fn tool_request(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::with_role(Role::Assistant)
        }
    }

    /// Create a tool result message.
    pub fn tool_result(outcome: ToolCallOutcome) -> Self {
        Self {
            tool_outcome: Some(outcome),
            ..Self::with_role(Role::ToolResult)
        }
    }

    /// Text content or the empty string.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Lifecycle status of a conversation's most recent turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Completed,
    Failed,
}

impl ConversationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// A conversation is an ordered sequence of messages with shared context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Ordered, append-only messages
    pub messages: Vec<Message>,

    /// Model round trips across all turns since creation (or last reset)
    pub iterations: u32,

    pub status: ConversationStatus,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the conversation was last touched
    pub last_activity: DateTime<Utc>,
}

impl Conversation {
    /// Create a new empty conversation with the given id.
    pub fn new(id: ConversationId) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: Vec::new(),
            iterations: 0,
            status: ConversationStatus::Active,
            created_at: now,
            last_activity: now,
        }
    }

    /// Add a message to the conversation.
    pub fn push(&mut self, message: Message) {
        self.last_activity = Utc::now();
        self.messages.push(message);
    }

    /// Record one completed round trip to the model.
    pub fn record_iteration(&mut self) {
        self.iterations += 1;
        self.last_activity = Utc::now();
    }

    /// Move to a new status. Returns `false` (and leaves the status alone)
    /// when asked to leave a terminal state for another terminal state.
    pub fn transition(&mut self, status: ConversationStatus) -> bool {
        if self.status.is_terminal() && status.is_terminal() {
            return false;
        }
        self.status = status;
        self.last_activity = Utc::now();
        true
    }

    /// The most recent `limit` messages, with the window start moved forward
    /// to a user message so tool results never lose their request.
    ///
    /// Inside a long tool-calling turn the window may hold no user message;
    /// it then starts at the first assistant message it contains. Only when
    /// a single round's tool results outnumber `limit` does the window grow
    /// past it, back to that round's tool request.
    pub fn history_window(&self, limit: usize) -> &[Message] {
        if self.messages.len() <= limit {
            return &self.messages;
        }
        let start = self.messages.len() - limit;
        let window = &self.messages[start..];
        let aligned = window
            .iter()
            .position(|m| m.role == Role::User)
            .or_else(|| window.iter().position(|m| m.role == Role::Assistant))
            .map(|offset| start + offset)
            .or_else(|| self.messages[..start].iter().rposition(|m| m.role == Role::Assistant))
            .unwrap_or(start);
        &self.messages[aligned..]
    }
}
