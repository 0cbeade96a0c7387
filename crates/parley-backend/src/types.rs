//! Domain types moved across the backend contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix shared by every client-generated placeholder message id.
pub const OPTIMISTIC_PREFIX: &str = "optimistic-";

/// Opaque, backend-assigned chat identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message identifier: backend-assigned for confirmed messages, a
/// client-generated placeholder for optimistic ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was synthesized locally for a pending message.
    pub fn is_optimistic(&self) -> bool {
        self.0.starts_with(OPTIMISTIC_PREFIX)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Denormalized preview of a chat's most recent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub content: String,
    pub is_bot: bool,
    pub created_at: DateTime<Utc>,
}

/// A conversation as shown in the chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Denormalized message count, authoritative on the backend.
    #[serde(default)]
    pub message_count: u64,
    /// Denormalized most recent message.
    #[serde(default)]
    pub latest: Option<MessagePreview>,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub content: String,
    pub is_bot: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Preview form of this message for the chat list.
    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            content: self.content.clone(),
            is_bot: self.is_bot,
            created_at: self.created_at,
        }
    }
}

/// A chat together with its full message history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatWithMessages {
    pub chat: Chat,
    pub messages: Vec<Message>,
}

/// Input for the send-message mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub content: String,
    pub is_bot: bool,
}

/// Result of bumping a chat's `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTimestamp {
    pub id: ChatId,
    pub updated_at: DateTime<Utc>,
}

/// Acknowledgement from the AI responder action.
///
/// The reply itself is written to the chat asynchronously and arrives through
/// the message feed, not in this response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderReply {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimistic_ids() {
        assert!(MessageId::from("optimistic-hello-1700000000000-0").is_optimistic());
        assert!(!MessageId::from("6f1c2a4e-0000-4000-8000-000000000000").is_optimistic());
    }

    #[test]
    fn test_message_deserializes_backend_row() {
        let json = serde_json::json!({
            "id": "m1",
            "chat_id": "c1",
            "content": "hello",
            "is_bot": false,
            "created_at": "2024-05-01T12:00:00.123456+00:00"
        });
        let message: Message = serde_json::from_value(json).unwrap();
        assert_eq!(message.id, MessageId::from("m1"));
        assert_eq!(message.chat_id, ChatId::from("c1"));
        assert!(!message.is_bot);
        assert_eq!(message.created_at.timestamp_subsec_micros(), 123456);
    }

    #[test]
    fn test_responder_reply_tolerates_missing_fields() {
        let reply: ResponderReply = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(reply.success);
        assert_eq!(reply.message, None);
    }
}
