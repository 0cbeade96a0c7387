//! The backend contract.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{
    BackendError, Chat, ChatId, ChatTimestamp, ChatWithMessages, Message, NewMessage,
    ResponderReply,
};

/// A live feed: every item is a full snapshot of the subscribed query.
///
/// Dropping the stream tears the subscription down and releases the
/// underlying transport.
pub type FeedStream<T> = BoxStream<'static, Result<T, BackendError>>;

/// Operations the chat backend exposes.
///
/// Queries and mutations resolve once. Subscriptions resolve to a
/// [`FeedStream`] that pushes snapshots until dropped or until the transport
/// fails; there is no resumption token, so reconnecting means calling the
/// subscribe method again.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Chats ordered by `updated_at` descending, each with its message count
    /// and latest-message preview.
    async fn fetch_chats(&self) -> Result<Vec<Chat>, BackendError>;

    /// A chat's messages ordered by `created_at` ascending.
    async fn fetch_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, BackendError>;

    /// A single chat with its whole history, `None` if it does not exist.
    async fn fetch_chat_with_messages(
        &self,
        chat_id: &ChatId,
    ) -> Result<Option<ChatWithMessages>, BackendError>;

    /// Create a chat; the backend assigns id and timestamps.
    async fn create_chat(&self, title: &str) -> Result<Chat, BackendError>;

    /// Rename a chat.
    async fn update_chat_title(&self, chat_id: &ChatId, title: &str)
    -> Result<Chat, BackendError>;

    /// Insert a message; the backend assigns id and timestamp.
    async fn send_message(&self, message: NewMessage) -> Result<Message, BackendError>;

    /// Set the chat's `updated_at` to the server's current time.
    async fn bump_chat_timestamp(&self, chat_id: &ChatId) -> Result<ChatTimestamp, BackendError>;

    /// Hand a user message to the AI responder action.
    async fn forward_to_responder(
        &self,
        chat_id: &ChatId,
        message: &str,
    ) -> Result<ResponderReply, BackendError>;

    /// Live feed of the chat list, same shape as [`ChatBackend::fetch_chats`].
    async fn subscribe_chats(&self) -> Result<FeedStream<Vec<Chat>>, BackendError>;

    /// Live feed of one chat's messages, same shape as
    /// [`ChatBackend::fetch_messages`].
    async fn subscribe_messages(
        &self,
        chat_id: &ChatId,
    ) -> Result<FeedStream<Vec<Message>>, BackendError>;
}
