//! Conversation data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One finalized message in a conversation.
///
/// Messages are immutable once appended. The assistant reply currently being
/// streamed is not represented as a `Message`; it lives in
/// [`ConversationState::live_text`](crate::exchange::ConversationState) until
/// the exchange finalizes, at which point a `Message` is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Content of the message
    pub text: String,
    /// Whether the message is currently being streamed. Always false for
    /// messages in the conversation list; kept for wire compatibility with
    /// the platform's message shape.
    #[serde(default)]
    pub streaming: bool,
    /// When the message was created locally
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a finalized user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            streaming: false,
            created_at: Utc::now(),
        }
    }

    /// Create a finalized assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            streaming: false,
            created_at: Utc::now(),
        }
    }
}

/// Request body for `POST /chat`.
///
/// The conversation id is only ever echoed back from upstream responses; it
/// is never generated locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    /// The user's query text
    pub query: String,
    /// Continuation token from a previous response - None starts a new
    /// conversation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    /// Create a request that starts a new conversation.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            conversation_id: None,
        }
    }

    /// Create a request that continues an existing conversation.
    pub fn with_conversation(query: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            conversation_id: Some(conversation_id.into()),
        }
    }
}
