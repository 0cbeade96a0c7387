//! GraphQL documents and wire shapes for the Hasura schema.
//!
//! Rows are decoded into private wire structs first and then converted into
//! the domain types, so schema quirks (nested aggregates, single-element
//! preview arrays) stay in this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BackendError, Chat, ChatId, ChatTimestamp, ChatWithMessages, Message, MessagePreview};

// ============================================================================
// Queries
// ============================================================================

pub const GET_USER_CHATS: &str = r#"
query GetUserChats {
  chats(order_by: { updated_at: desc }) {
    id
    title
    created_at
    updated_at
    messages_aggregate { aggregate { count } }
    messages(limit: 1, order_by: { created_at: desc }) { content is_bot created_at }
  }
}"#;

pub const GET_CHAT_MESSAGES: &str = r#"
query GetChatMessages($chatId: uuid!) {
  messages(where: { chat_id: { _eq: $chatId } }, order_by: { created_at: asc }) {
    id
    content
    is_bot
    created_at
    chat_id
  }
}"#;

pub const GET_CHAT_WITH_MESSAGES: &str = r#"
query GetChatWithMessages($chatId: uuid!) {
  chats_by_pk(id: $chatId) {
    id
    title
    created_at
    updated_at
    messages(order_by: { created_at: asc }) { id content is_bot created_at chat_id }
  }
}"#;

// ============================================================================
// Mutations and actions
// ============================================================================

pub const CREATE_CHAT: &str = r#"
mutation CreateChat($title: String!) {
  insert_chats_one(object: { title: $title }) {
    id
    title
    created_at
    updated_at
  }
}"#;

pub const UPDATE_CHAT_TITLE: &str = r#"
mutation UpdateChatTitle($chatId: uuid!, $title: String!) {
  update_chats_by_pk(pk_columns: { id: $chatId }, _set: { title: $title }) {
    id
    title
    created_at
    updated_at
    messages_aggregate { aggregate { count } }
    messages(limit: 1, order_by: { created_at: desc }) { content is_bot created_at }
  }
}"#;

pub const SEND_MESSAGE: &str = r#"
mutation SendMessage($chatId: uuid!, $content: String!, $isBot: Boolean = false) {
  insert_messages_one(object: { chat_id: $chatId, content: $content, is_bot: $isBot }) {
    id
    content
    is_bot
    created_at
    chat_id
  }
}"#;

pub const UPDATE_CHAT_TIMESTAMP: &str = r#"
mutation UpdateChatTimestamp($chatId: uuid!) {
  update_chats_by_pk(pk_columns: { id: $chatId }, _set: { updated_at: "now()" }) {
    id
    updated_at
  }
}"#;

pub const SEND_MESSAGE_WITH_AI: &str = r#"
mutation SendMessageWithAI($chatId: uuid!, $message: String!) {
  sendMessage(chatId: $chatId, message: $message) {
    success
    message
    timestamp
  }
}"#;

// ============================================================================
// Subscriptions
// ============================================================================

pub const SUBSCRIBE_TO_USER_CHATS: &str = r#"
subscription SubscribeToUserChats {
  chats(order_by: { updated_at: desc }) {
    id
    title
    created_at
    updated_at
    messages_aggregate { aggregate { count } }
    messages(limit: 1, order_by: { created_at: desc }) { content is_bot created_at }
  }
}"#;

pub const SUBSCRIBE_TO_CHAT_MESSAGES: &str = r#"
subscription SubscribeToChatMessages($chatId: uuid!) {
  messages(where: { chat_id: { _eq: $chatId } }, order_by: { created_at: asc }) {
    id
    content
    is_bot
    created_at
    chat_id
  }
}"#;

// ============================================================================
// Envelopes
// ============================================================================

/// Body of a GraphQL request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest<'a, V> {
    pub query: &'a str,
    pub operation_name: &'a str,
    pub variables: V,
}

/// Body of a GraphQL response (also the payload of a `next` frame).
#[derive(Debug, Deserialize)]
pub struct GraphqlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

/// One entry of a GraphQL `errors` array.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default)]
    pub extensions: Option<ErrorExtensions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorExtensions {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl GraphqlError {
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref().and_then(|e| e.code.as_deref())
    }
}

impl From<GraphqlError> for BackendError {
    fn from(err: GraphqlError) -> Self {
        let code = err.code().map(str::to_string);
        BackendError::from_graphql_code(code.as_deref(), err.message)
    }
}

impl<T> GraphqlResponse<T> {
    /// Collapse the envelope: the first error wins, missing data is an error.
    pub fn into_result(self) -> Result<T, BackendError> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(first.into());
        }
        self.data
            .ok_or_else(|| BackendError::Unknown("response contained no data".to_string()))
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Deserialize)]
struct AggregateCount {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct AggregateRow {
    aggregate: Option<AggregateCount>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatRow {
    id: ChatId,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    messages_aggregate: Option<AggregateRow>,
    #[serde(default)]
    messages: Vec<MessagePreview>,
}

impl From<ChatRow> for Chat {
    fn from(row: ChatRow) -> Self {
        let message_count = row
            .messages_aggregate
            .and_then(|a| a.aggregate)
            .map(|a| a.count)
            .unwrap_or(0);
        Chat {
            id: row.id,
            title: row.title,
            created_at: row.created_at,
            updated_at: row.updated_at,
            message_count,
            latest: row.messages.into_iter().next(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatWithMessagesRow {
    id: ChatId,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    messages: Vec<Message>,
}

impl From<ChatWithMessagesRow> for ChatWithMessages {
    fn from(row: ChatWithMessagesRow) -> Self {
        let latest = row.messages.last().map(Message::preview);
        ChatWithMessages {
            chat: Chat {
                id: row.id,
                title: row.title,
                created_at: row.created_at,
                updated_at: row.updated_at,
                message_count: row.messages.len() as u64,
                latest,
            },
            messages: row.messages,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatsData {
    pub chats: Vec<ChatRow>,
}

impl ChatsData {
    pub fn into_chats(self) -> Vec<Chat> {
        self.chats.into_iter().map(Chat::from).collect()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesData {
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatByPkData {
    pub chats_by_pk: Option<ChatWithMessagesRow>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateChatData {
    pub insert_chats_one: ChatRow,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateChatData {
    pub update_chats_by_pk: Option<ChatRow>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendMessageData {
    pub insert_messages_one: Message,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BumpTimestampData {
    pub update_chats_by_pk: Option<ChatTimestamp>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponderData {
    #[serde(rename = "sendMessage")]
    pub send_message: crate::ResponderReply,
}
