//! Per-chat message view model.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use parley_backend::{BackendError, Chat, ChatBackend, ChatId, Message, MessageId, NewMessage};
use tracing::{debug, error, info, warn};

use super::{FetchStatus, InFlight, combine, feed_running, feed_status, lock};
use crate::{
    ChatPatch, ConnectionState, FeedHandle, OptimisticBuffer, Origin, Store, SyncConfig, SyncError,
};

/// Snapshot of one chat's messages as presented to the user.
#[derive(Debug, Clone)]
pub struct MessageListState {
    /// Confirmed messages overlaid with optimistic ones, oldest first.
    pub messages: Vec<Message>,
    pub loading: bool,
    pub error: Option<Arc<SyncError>>,
    pub connection: ConnectionState,
    /// At least one send is in flight.
    pub sending: bool,
}

/// Shared with background sends and refetches.
struct MessageContext {
    backend: Arc<dyn ChatBackend>,
    store: Arc<Store>,
    chat_id: ChatId,
    config: SyncConfig,
    buffer: OptimisticBuffer,
    fetch: Mutex<FetchStatus>,
    sending: AtomicUsize,
}

impl MessageContext {
    /// Write a confirmed snapshot and retire the optimistic entries it
    /// confirms.
    fn apply(&self, origin: Origin, messages: &[Message]) {
        self.store.write_messages(origin, &self.chat_id, messages);
        let reconciled = self.buffer.reconcile(messages);
        debug!(
            chat_id = %self.chat_id,
            ?origin,
            count = messages.len(),
            reconciled,
            "applied message snapshot"
        );
    }

    async fn refresh(&self) {
        lock(&self.fetch).in_flight = true;

        let result = self.backend.fetch_messages(&self.chat_id).await;

        let mut fetch = lock(&self.fetch);
        fetch.in_flight = false;
        match result {
            Ok(messages) => {
                self.apply(Origin::Fetch, &messages);
                fetch.error = None;
            }
            Err(e) => {
                warn!(chat_id = %self.chat_id, error = %e, "failed to fetch messages");
                fetch.error = Some(Arc::new(SyncError::from(e)));
            }
        }
    }

    /// Fetch the chat together with its history.
    async fn refresh_with_chat(&self) {
        lock(&self.fetch).in_flight = true;

        let result = self.backend.fetch_chat_with_messages(&self.chat_id).await;

        let mut fetch = lock(&self.fetch);
        fetch.in_flight = false;
        match result {
            Ok(Some(found)) => {
                self.store.write_chat_with_messages(Origin::Fetch, &found);
                let reconciled = self.buffer.reconcile(&found.messages);
                debug!(
                    chat_id = %self.chat_id,
                    count = found.messages.len(),
                    reconciled,
                    "applied chat with messages"
                );
                fetch.error = None;
            }
            Ok(None) => {
                warn!(chat_id = %self.chat_id, "chat not found");
                fetch.error = Some(Arc::new(SyncError::from(BackendError::NotFound(
                    format!("chat {}", self.chat_id),
                ))));
            }
            Err(e) => {
                warn!(chat_id = %self.chat_id, error = %e, "failed to fetch chat");
                fetch.error = Some(Arc::new(SyncError::from(e)));
            }
        }
    }

    /// Send one message, record it locally and bump the chat's timestamp.
    ///
    /// `placeholder` is retired as soon as the confirmed message is stored.
    async fn send(
        &self,
        content: &str,
        is_bot: bool,
        placeholder: Option<&MessageId>,
    ) -> Result<Message, SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::InvalidInput(
                "message must not be empty".to_string(),
            ));
        }

        let _sending = InFlight::enter(&self.sending);
        let message = self
            .backend
            .send_message(NewMessage {
                chat_id: self.chat_id.clone(),
                content: content.to_string(),
                is_bot,
            })
            .await?;

        self.store.append_message(&message);
        if let Some(placeholder) = placeholder {
            self.buffer.discard(placeholder);
        }
        debug!(chat_id = %self.chat_id, message_id = %message.id, "message sent");

        // A failed bump is logged, not returned
        match self.backend.bump_chat_timestamp(&self.chat_id).await {
            Ok(stamp) => {
                self.store.modify_chat(
                    &self.chat_id,
                    ChatPatch {
                        updated_at: Some(stamp.updated_at),
                        ..Default::default()
                    },
                );
            }
            Err(e) => {
                warn!(chat_id = %self.chat_id, error = %e, "failed to bump chat timestamp");
            }
        }

        Ok(message)
    }
}

/// One chat's messages, kept in sync with the backend.
pub struct MessageView {
    ctx: Arc<MessageContext>,
    feed: Mutex<Option<FeedHandle>>,
}

impl MessageView {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<Store>,
        chat_id: ChatId,
        config: SyncConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(MessageContext {
                backend,
                store,
                chat_id,
                config,
                buffer: OptimisticBuffer::new(),
                fetch: Mutex::new(FetchStatus::default()),
                sending: AtomicUsize::new(0),
            }),
            feed: Mutex::new(None),
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.ctx.chat_id
    }

    /// One-shot fetch of the chat's messages into the store.
    pub async fn refresh(&self) {
        self.ctx.refresh().await;
    }

    /// One-shot fetch of the chat and its messages, so the chat header is
    /// cached alongside the history.
    pub async fn refresh_with_chat(&self) {
        self.ctx.refresh_with_chat().await;
    }

    /// The chat this view shows, if cached.
    pub fn chat(&self) -> Option<Chat> {
        self.ctx.store.chat(&self.ctx.chat_id)
    }

    /// Start the message live feed. Returns `false` if it is already
    /// running.
    pub fn start_live(&self) -> bool {
        let mut slot = lock(&self.feed);
        if feed_running(&slot) {
            return false;
        }

        let opener = Arc::clone(&self.ctx);
        let applier = Arc::clone(&self.ctx);
        *slot = Some(FeedHandle::spawn(
            format!("messages:{}", self.ctx.chat_id),
            self.ctx.config.retry.clone(),
            move || {
                let ctx = Arc::clone(&opener);
                async move { ctx.backend.subscribe_messages(&ctx.chat_id).await }
            },
            move |messages: Vec<Message>| applier.apply(Origin::Feed, &messages),
        ));
        true
    }

    /// Stop the live feed and wait for its subscription to be released.
    pub async fn stop_live(&self) {
        let handle = lock(&self.feed).take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    pub fn state(&self) -> MessageListState {
        let feed = feed_status(&self.feed);
        let fetch = lock(&self.ctx.fetch).clone();
        let (loading, error) = combine(&fetch, &feed);

        let mut messages = self.ctx.store.messages(&self.ctx.chat_id);
        let confirmed: HashSet<MessageId> = messages.iter().map(|m| m.id.clone()).collect();
        messages.extend(
            self.ctx
                .buffer
                .list_for(&self.ctx.chat_id)
                .into_iter()
                .filter(|m| !confirmed.contains(&m.id)),
        );
        messages.sort_by_key(|m| m.created_at);

        MessageListState {
            messages,
            loading,
            error,
            connection: feed.connection(),
            sending: self.ctx.sending.load(Ordering::SeqCst) > 0,
        }
    }

    /// Send a message and wait for the backend. Returns `false` on failure.
    pub async fn send_message(&self, content: &str, is_bot: bool) -> bool {
        match self.ctx.send(content, is_bot, None).await {
            Ok(_) => true,
            Err(e) => {
                error!(chat_id = %self.ctx.chat_id, error = %e, "failed to send message");
                false
            }
        }
    }

    /// Show the message immediately and send it in the background.
    ///
    /// On success the placeholder is swapped for the confirmed message before
    /// the timestamp bump; on failure it simply disappears.
    pub fn send_message_optimistic(&self, content: &str, is_bot: bool) -> MessageId {
        let id = self.ctx.buffer.add(&self.ctx.chat_id, content, is_bot);

        let ctx = Arc::clone(&self.ctx);
        let placeholder = id.clone();
        let content = content.to_string();
        tokio::spawn(async move {
            let result = ctx.send(&content, is_bot, Some(&placeholder)).await;
            ctx.buffer.discard(&placeholder);
            if let Err(e) = result {
                error!(
                    chat_id = %ctx.chat_id,
                    placeholder = %placeholder,
                    error = %e,
                    "optimistic send failed, discarding"
                );
            }
        });

        id
    }

    /// Forward a user message to the AI responder.
    ///
    /// The reply arrives through the live feed. When a responder refetch is
    /// configured, the messages are also refetched after that delay.
    pub async fn send_to_responder(&self, content: &str) -> bool {
        let reply = match self
            .ctx
            .backend
            .forward_to_responder(&self.ctx.chat_id, content)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!(chat_id = %self.ctx.chat_id, error = %e, "failed to reach responder");
                return false;
            }
        };

        if !reply.success {
            warn!(
                chat_id = %self.ctx.chat_id,
                reason = reply.message.as_deref().unwrap_or_default(),
                "responder declined"
            );
            return false;
        }

        info!(chat_id = %self.ctx.chat_id, "forwarded to responder");

        if let Some(delay) = self.ctx.config.responder_refetch_after() {
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                ctx.refresh().await;
            });
        }

        true
    }

    /// Most recent message, optimistic ones included.
    pub fn latest_message(&self) -> Option<Message> {
        self.state().messages.pop()
    }

    /// Number of messages shown, optimistic ones included.
    pub fn message_count(&self) -> usize {
        self.state().messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use parley_backend::{ErrorKind, MemoryBackend, Operation};
    use pretty_assertions::assert_eq;

    fn view_for(backend: &MemoryBackend, chat_id: &ChatId, config: SyncConfig) -> MessageView {
        MessageView::new(
            Arc::new(backend.clone()),
            Store::new(),
            chat_id.clone(),
            config,
        )
    }

    fn contents(state: &MessageListState) -> Vec<&str> {
        state.messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test]
    async fn test_refresh_orders_by_created_at() {
        let backend = MemoryBackend::new();
        let chat_id = backend.seed_chat("history");
        let base = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        backend.seed_message(&chat_id, "second", false, base + chrono::TimeDelta::seconds(2));
        backend.seed_message(&chat_id, "first", false, base + chrono::TimeDelta::seconds(1));

        let view = view_for(&backend, &chat_id, SyncConfig::default());
        view.refresh().await;

        assert_eq!(contents(&view.state()), vec!["first", "second"]);
        assert_eq!(view.message_count(), 2);
        assert_eq!(view.latest_message().unwrap().content, "second");
    }

    #[tokio::test]
    async fn test_send_message_appends_and_bumps() {
        let backend = MemoryBackend::new();
        let chat_id = backend.seed_chat("chat");
        let view = view_for(&backend, &chat_id, SyncConfig::default());

        assert!(view.send_message("hello", false).await);

        assert_eq!(contents(&view.state()), vec!["hello"]);
        assert_eq!(backend.calls(Operation::BumpChatTimestamp), 1);
        assert!(!view.state().sending);
    }

    #[tokio::test]
    async fn test_failed_bump_is_swallowed() {
        let backend = MemoryBackend::new();
        let chat_id = backend.seed_chat("chat");
        backend.fail_next(Operation::BumpChatTimestamp, ErrorKind::Transport);
        let view = view_for(&backend, &chat_id, SyncConfig::default());

        assert!(view.send_message("still sent", false).await);
        assert_eq!(backend.stored_messages(&chat_id).len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_returns_false() {
        let backend = MemoryBackend::new();
        let chat_id = backend.seed_chat("chat");
        backend.fail_next(Operation::SendMessage, ErrorKind::Permission);
        let view = view_for(&backend, &chat_id, SyncConfig::default());

        assert!(!view.send_message("denied", false).await);
        assert!(view.state().messages.is_empty());
        assert_eq!(backend.calls(Operation::BumpChatTimestamp), 0);
    }

    #[tokio::test]
    async fn test_optimistic_message_visible_then_confirmed() {
        let backend = MemoryBackend::new();
        let chat_id = backend.seed_chat("chat");
        let view = view_for(&backend, &chat_id, SyncConfig::default());

        let id = view.send_message_optimistic("fast", false);
        assert!(id.is_optimistic());
        let state = view.state();
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].id, id);

        tokio::time::timeout(Duration::from_secs(5), async {
            while view.state().messages.iter().any(|m| m.id.is_optimistic()) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let state = view.state();
        assert_eq!(contents(&state), vec!["fast"]);
        assert!(!state.messages[0].id.is_optimistic());
    }

    #[tokio::test]
    async fn test_optimistic_failure_discards_entry() {
        let backend = MemoryBackend::new();
        let chat_id = backend.seed_chat("chat");
        backend.fail_next(Operation::SendMessage, ErrorKind::Transport);
        let view = view_for(&backend, &chat_id, SyncConfig::default());

        view.send_message_optimistic("lost", false);
        assert_eq!(view.message_count(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while view.message_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(backend.calls(Operation::SendMessage), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_reply_arrives_through_feed() {
        let backend = MemoryBackend::new();
        backend.set_responder(Duration::from_secs(1), |m| Some(format!("bot: {}", m)));
        let chat_id = backend.seed_chat("ai");
        let view = view_for(&backend, &chat_id, SyncConfig::default());
        view.start_live();

        assert!(view.send_message("question", false).await);
        assert!(view.send_to_responder("question").await);

        tokio::time::timeout(Duration::from_secs(30), async {
            while view.message_count() < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        let state = view.state();
        assert_eq!(contents(&state), vec!["question", "bot: question"]);
        assert!(state.messages[1].is_bot);
        assert_eq!(state.connection, ConnectionState::Connected);
        view.stop_live().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_refetch_without_feed() {
        let backend = MemoryBackend::new();
        backend.set_responder(Duration::from_millis(500), |m| Some(format!("bot: {}", m)));
        let chat_id = backend.seed_chat("ai");
        let config = SyncConfig::default().with_responder_refetch(Duration::from_secs(3));
        let view = view_for(&backend, &chat_id, config);

        assert!(view.send_to_responder("ping").await);
        assert_eq!(view.message_count(), 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(contents(&view.state()), vec!["bot: ping"]);
    }

    #[tokio::test]
    async fn test_responder_for_missing_chat_fails() {
        let backend = MemoryBackend::new();
        let view = view_for(&backend, &ChatId::from("missing"), SyncConfig::default());
        assert!(!view.send_to_responder("anyone?").await);
    }

    #[tokio::test]
    async fn test_refresh_with_chat_caches_header_and_history() {
        let backend = MemoryBackend::new();
        let chat_id = backend.seed_chat("trip");
        let base = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        backend.seed_message(&chat_id, "later", true, base + chrono::TimeDelta::seconds(2));
        backend.seed_message(&chat_id, "earlier", false, base + chrono::TimeDelta::seconds(1));

        let view = view_for(&backend, &chat_id, SyncConfig::default());
        assert!(view.chat().is_none());

        view.refresh_with_chat().await;

        let chat = view.chat().unwrap();
        assert_eq!(chat.title, "trip");
        assert_eq!(chat.message_count, 2);
        assert_eq!(contents(&view.state()), vec!["earlier", "later"]);
        assert_eq!(backend.calls(Operation::FetchChatWithMessages), 1);
        assert_eq!(backend.calls(Operation::FetchMessages), 0);
    }

    #[tokio::test]
    async fn test_refresh_with_chat_records_missing_chat() {
        let backend = MemoryBackend::new();
        let view = view_for(&backend, &ChatId::from("gone"), SyncConfig::default());

        view.refresh_with_chat().await;

        let state = view.state();
        assert!(state.messages.is_empty());
        assert!(matches!(
            state.error.as_deref(),
            Some(SyncError::Backend(BackendError::NotFound(_)))
        ));
    }
}
