//! Chat list view model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use parley_backend::{Chat, ChatBackend, ChatId};
use tracing::{debug, error, info, warn};

use super::{FetchStatus, InFlight, combine, feed_running, feed_status, lock};
use crate::{ChatPatch, ConnectionState, FeedHandle, Origin, Store, SyncConfig, SyncError};

/// Snapshot of the chat list as presented to the user.
#[derive(Debug, Clone)]
pub struct ChatListState {
    pub chats: Vec<Chat>,
    pub loading: bool,
    pub error: Option<Arc<SyncError>>,
    pub connection: ConnectionState,
}

/// The user's chats, kept in sync with the backend.
pub struct ChatListView {
    backend: Arc<dyn ChatBackend>,
    store: Arc<Store>,
    config: SyncConfig,
    fetch: Mutex<FetchStatus>,
    feed: Mutex<Option<FeedHandle>>,
    creating: AtomicUsize,
    updating: AtomicUsize,
}

impl ChatListView {
    pub fn new(backend: Arc<dyn ChatBackend>, store: Arc<Store>, config: SyncConfig) -> Self {
        Self {
            backend,
            store,
            config,
            fetch: Mutex::new(FetchStatus::default()),
            feed: Mutex::new(None),
            creating: AtomicUsize::new(0),
            updating: AtomicUsize::new(0),
        }
    }

    /// One-shot fetch of the chat list into the store.
    pub async fn refresh(&self) {
        lock(&self.fetch).in_flight = true;

        let result = self.backend.fetch_chats().await;

        let mut fetch = lock(&self.fetch);
        fetch.in_flight = false;
        match result {
            Ok(chats) => {
                self.store.write_chat_list(Origin::Fetch, &chats);
                fetch.error = None;
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch chats");
                fetch.error = Some(Arc::new(SyncError::from(e)));
            }
        }
    }

    /// Start the chat-list live feed. Returns `false` if it is already
    /// running.
    pub fn start_live(&self) -> bool {
        let mut slot = lock(&self.feed);
        if feed_running(&slot) {
            return false;
        }

        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        *slot = Some(FeedHandle::spawn(
            "chats",
            self.config.retry.clone(),
            move || {
                let backend = Arc::clone(&backend);
                async move { backend.subscribe_chats().await }
            },
            move |chats: Vec<Chat>| {
                debug!(count = chats.len(), "chat list snapshot");
                store.write_chat_list(Origin::Feed, &chats);
            },
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

    pub fn state(&self) -> ChatListState {
        let feed = feed_status(&self.feed);
        let fetch = lock(&self.fetch).clone();
        let (loading, error) = combine(&fetch, &feed);

        ChatListState {
            chats: self.store.chat_list(),
            loading,
            error,
            connection: feed.connection(),
        }
    }

    pub fn chat(&self, chat_id: &ChatId) -> Option<Chat> {
        self.store.chat(chat_id)
    }

    /// Create a chat and put it at the head of the cached list.
    pub async fn create_chat(&self, title: &str) -> Result<ChatId, SyncError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::InvalidInput(
                "chat title must not be empty".to_string(),
            ));
        }

        let _creating = InFlight::enter(&self.creating);
        match self.backend.create_chat(title).await {
            Ok(chat) => {
                info!(chat_id = %chat.id, "created chat");
                self.store.prepend_chat(&chat);
                Ok(chat.id)
            }
            Err(e) => {
                error!(error = %e, "failed to create chat");
                Err(e.into())
            }
        }
    }

    /// Rename a chat. Returns `false` if the backend rejected it.
    pub async fn update_chat_title(&self, chat_id: &ChatId, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            warn!(chat_id = %chat_id, "refusing to set an empty chat title");
            return false;
        }

        let _updating = InFlight::enter(&self.updating);
        match self.backend.update_chat_title(chat_id, title).await {
            Ok(chat) => {
                self.store.modify_chat(
                    chat_id,
                    ChatPatch {
                        title: Some(chat.title),
                        updated_at: Some(chat.updated_at),
                        message_count: Some(chat.message_count),
                        latest: chat.latest,
                    },
                );
                true
            }
            Err(e) => {
                error!(chat_id = %chat_id, error = %e, "failed to update chat title");
                false
            }
        }
    }

    /// Move a chat's `updated_at` to the server's current time.
    pub async fn update_chat_timestamp(&self, chat_id: &ChatId) -> bool {
        let _updating = InFlight::enter(&self.updating);
        match self.backend.bump_chat_timestamp(chat_id).await {
            Ok(stamp) => {
                self.store.modify_chat(
                    chat_id,
                    ChatPatch {
                        updated_at: Some(stamp.updated_at),
                        ..Default::default()
                    },
                );
                true
            }
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "failed to update chat timestamp");
                false
            }
        }
    }

    pub fn creating(&self) -> bool {
        self.creating.load(Ordering::SeqCst) > 0
    }

    pub fn updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_backend::{ErrorKind, MemoryBackend, Operation};
    use pretty_assertions::assert_eq;

    fn view(backend: &MemoryBackend) -> ChatListView {
        ChatListView::new(Arc::new(backend.clone()), Store::new(), SyncConfig::default())
    }

    #[tokio::test]
    async fn test_refresh_populates_store() {
        let backend = MemoryBackend::new();
        backend.seed_chat("one");
        backend.seed_chat("two");
        let view = view(&backend);

        view.refresh().await;

        let state = view.state();
        assert_eq!(state.chats.len(), 2);
        assert_eq!(state.chats[0].title, "two");
        assert!(!state.loading);
        assert!(state.error.is_none());
        assert_eq!(state.connection, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_fetch_error_is_recorded_not_returned() {
        let backend = MemoryBackend::new();
        backend.fail_next(Operation::FetchChats, ErrorKind::Permission);
        let view = view(&backend);

        view.refresh().await;

        let error = view.state().error.unwrap();
        assert_eq!(
            error.user_message(),
            "Permission denied. Please refresh and try again."
        );

        view.refresh().await;
        assert!(view.state().error.is_none());
    }

    #[tokio::test]
    async fn test_create_chat_prepends() {
        let backend = MemoryBackend::new();
        backend.seed_chat("existing");
        let view = view(&backend);
        view.refresh().await;

        let id = view.create_chat("  Fresh  ").await.unwrap();

        let state = view.state();
        assert_eq!(state.chats[0].id, id);
        assert_eq!(state.chats[0].title, "Fresh");
        assert_eq!(state.chats[0].message_count, 0);
        assert!(!view.creating());
    }

    #[tokio::test]
    async fn test_create_chat_rejects_empty_title() {
        let backend = MemoryBackend::new();
        let view = view(&backend);

        let err = view.create_chat("   ").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
        assert_eq!(backend.calls(Operation::CreateChat), 0);
    }

    #[tokio::test]
    async fn test_update_title_and_timestamp() {
        let backend = MemoryBackend::new();
        let id = backend.seed_chat("before");
        let view = view(&backend);
        view.refresh().await;
        let before = view.chat(&id).unwrap().updated_at;

        assert!(view.update_chat_title(&id, "after").await);
        assert_eq!(view.chat(&id).unwrap().title, "after");

        assert!(view.update_chat_timestamp(&id).await);
        assert!(view.chat(&id).unwrap().updated_at > before);

        backend.fail_next(Operation::UpdateChatTitle, ErrorKind::Transport);
        assert!(!view.update_chat_title(&id, "lost").await);
        assert_eq!(view.chat(&id).unwrap().title, "after");
        assert!(!view.updating());
    }

    async fn wait_connected(view: &ChatListView) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while view.state().connection != ConnectionState::Connected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_live_feed_tracks_backend() {
        let backend = MemoryBackend::new();
        let view = view(&backend);
        view.start_live();
        wait_connected(&view).await;

        backend.seed_chat("pushed");

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while view.state().chats.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(view.state().chats[0].title, "pushed");
        view.stop_live().await;
    }

    #[tokio::test]
    async fn test_start_live_is_idempotent() {
        let backend = MemoryBackend::new();
        let view = view(&backend);

        assert!(view.start_live());
        assert!(!view.start_live());
        wait_connected(&view).await;

        view.stop_live().await;
        assert_eq!(view.state().connection, ConnectionState::Disconnected);
        assert!(view.start_live());
        wait_connected(&view).await;
        view.stop_live().await;
        assert_eq!(backend.calls(Operation::SubscribeChats), 2);
    }
}
