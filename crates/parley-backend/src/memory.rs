//! In-process backend.
//!
//! Holds chats and messages in memory and pushes full snapshots to live-feed
//! subscribers after every change, the way the hosted backend does. Failures
//! can be injected per operation, and forwarding to the responder schedules a
//! scripted bot reply that arrives through the message feed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

use crate::{
    BackendError, Chat, ChatBackend, ChatId, ChatTimestamp, ChatWithMessages, ErrorKind,
    FeedStream, Message, MessageId, NewMessage, ResponderReply,
};

/// Backend operations, used to target failure injection and call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchChats,
    FetchMessages,
    FetchChatWithMessages,
    CreateChat,
    UpdateChatTitle,
    SendMessage,
    BumpChatTimestamp,
    ForwardToResponder,
    SubscribeChats,
    SubscribeMessages,
}

/// Produces the responder's reply text for a forwarded message. `None` means
/// the responder stays silent.
pub type ReplyFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone)]
enum Change {
    Chats,
    Messages(ChatId),
    Disconnect,
}

struct ChatRecord {
    id: ChatId,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

struct State {
    chats: Vec<ChatRecord>,
    messages: Vec<Message>,
    failures: HashMap<Operation, VecDeque<ErrorKind>>,
    calls: HashMap<Operation, usize>,
    clock: DateTime<Utc>,
    responder_delay: Duration,
    responder_reply: ReplyFn,
}

impl State {
    /// Server time, strictly increasing across calls.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now().max(self.clock + TimeDelta::microseconds(1));
        self.clock = now;
        now
    }

    fn chat_snapshot(&self, record: &ChatRecord) -> Chat {
        let mut count = 0;
        let mut latest: Option<&Message> = None;
        for message in self.messages.iter().filter(|m| m.chat_id == record.id) {
            count += 1;
            if latest.is_none_or(|l| message.created_at >= l.created_at) {
                latest = Some(message);
            }
        }
        Chat {
            id: record.id.clone(),
            title: record.title.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            message_count: count,
            latest: latest.map(Message::preview),
        }
    }

    fn chat_list(&self) -> Vec<Chat> {
        let mut chats: Vec<Chat> = self.chats.iter().map(|c| self.chat_snapshot(c)).collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        chats
    }

    fn messages_for(&self, chat_id: &ChatId) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| &m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    fn record_mut(&mut self, chat_id: &ChatId) -> Option<&mut ChatRecord> {
        self.chats.iter_mut().find(|c| &c.id == chat_id)
    }

    fn insert_message(
        &mut self,
        chat_id: ChatId,
        content: String,
        is_bot: bool,
        created_at: DateTime<Utc>,
    ) -> Message {
        let message = Message {
            id: MessageId(uuid::Uuid::new_v4().to_string()),
            chat_id,
            content,
            is_bot,
            created_at,
        };
        self.messages.push(message.clone());
        message
    }
}

struct Shared {
    state: Mutex<State>,
    changes: broadcast::Sender<Change>,
    active_feeds: AtomicUsize,
}

/// Decrements the live-feed counter when a feed task exits.
struct FeedGuard(Arc<Shared>);

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.0.active_feeds.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`ChatBackend`].
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend whose responder echoes the message after 500ms.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        let state = State {
            chats: Vec::new(),
            messages: Vec::new(),
            failures: HashMap::new(),
            calls: HashMap::new(),
            clock: DateTime::<Utc>::default(),
            responder_delay: Duration::from_millis(500),
            responder_reply: Arc::new(|message| Some(format!("Echo: {}", message))),
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                changes,
                active_feeds: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: Change) {
        // No subscribers is fine
        let _ = self.shared.changes.send(change);
    }

    /// Count the call and pop an injected failure, if any.
    fn enter(&self, op: Operation) -> Result<(), BackendError> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        let injected = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
        match injected {
            Some(kind) => {
                debug!(operation = ?op, kind = ?kind, "injected failure");
                Err(injected_error(op, kind))
            }
            None => Ok(()),
        }
    }

    /// Make the next call of `op` fail with an error of `kind`. Queued
    /// failures are consumed in order, one per call.
    pub fn fail_next(&self, op: Operation, kind: ErrorKind) {
        self.state().failures.entry(op).or_default().push_back(kind);
    }

    /// How many times `op` has been invoked, including failed calls.
    pub fn calls(&self, op: Operation) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Script the responder: `reply` runs on the forwarded text and its
    /// result is inserted as a bot message after `delay`.
    pub fn set_responder<F>(&self, delay: Duration, reply: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let mut state = self.state();
        state.responder_delay = delay;
        state.responder_reply = Arc::new(reply);
    }

    /// Insert a chat directly, bypassing failure injection.
    pub fn seed_chat(&self, title: &str) -> ChatId {
        let id = {
            let mut state = self.state();
            let now = state.tick();
            let id = ChatId(uuid::Uuid::new_v4().to_string());
            state.chats.push(ChatRecord {
                id: id.clone(),
                title: title.to_string(),
                created_at: now,
                updated_at: now,
            });
            id
        };
        self.notify(Change::Chats);
        id
    }

    /// Insert a message with an explicit timestamp, bypassing failure
    /// injection. The chat does not need to exist.
    pub fn seed_message(
        &self,
        chat_id: &ChatId,
        content: &str,
        is_bot: bool,
        created_at: DateTime<Utc>,
    ) -> Message {
        let message = self.state().insert_message(
            chat_id.clone(),
            content.to_string(),
            is_bot,
            created_at,
        );
        self.notify(Change::Messages(chat_id.clone()));
        self.notify(Change::Chats);
        message
    }

    /// Messages currently stored for a chat, oldest first.
    pub fn stored_messages(&self, chat_id: &ChatId) -> Vec<Message> {
        self.state().messages_for(chat_id)
    }

    /// Chats currently stored, most recently updated first.
    pub fn stored_chats(&self) -> Vec<Chat> {
        self.state().chat_list()
    }

    /// Number of live feeds whose task is still running.
    pub fn active_feeds(&self) -> usize {
        self.shared.active_feeds.load(Ordering::SeqCst)
    }

    /// Fail every open live feed with a transport error, as if the socket
    /// dropped.
    pub fn drop_feeds(&self) {
        debug!("dropping all live feeds");
        self.notify(Change::Disconnect);
    }

    /// Spawn a feed task that pushes `snapshot()` initially and whenever a
    /// change matching `relevant` is broadcast.
    fn open_feed<T, S, R>(&self, snapshot: S, relevant: R) -> FeedStream<T>
    where
        T: Send + 'static,
        S: Fn(&State) -> T + Send + 'static,
        R: Fn(&Change) -> bool + Send + 'static,
    {
        // Subscribe before taking the first snapshot so no change is missed
        let mut changes = self.shared.changes.subscribe();
        let (tx, rx) = mpsc::channel(16);

        self.shared.active_feeds.fetch_add(1, Ordering::SeqCst);
        let guard = FeedGuard(Arc::clone(&self.shared));
        let backend = self.clone();

        tokio::spawn(async move {
            let _guard = guard;

            let initial = snapshot(&backend.state());
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    change = changes.recv() => {
                        match change {
                            Ok(Change::Disconnect) => {
                                let _ = tx
                                    .send(Err(BackendError::Transport("socket closed".to_string())))
                                    .await;
                                return;
                            }
                            Ok(change) if !relevant(&change) => continue,
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                                let next = snapshot(&backend.state());
                                trace!("pushing live feed snapshot");
                                if tx.send(Ok(next)).await.is_err() {
                                    return;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });

        ReceiverStream::new(rx).boxed()
    }
}

fn injected_error(op: Operation, kind: ErrorKind) -> BackendError {
    let message = format!("injected failure in {:?}", op);
    match kind {
        ErrorKind::Transport => BackendError::Transport(message),
        ErrorKind::Permission => BackendError::Permission(message),
        ErrorKind::MalformedRequest => BackendError::MalformedRequest(message),
        ErrorKind::Unknown => BackendError::Unknown(message),
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    async fn fetch_chats(&self) -> Result<Vec<Chat>, BackendError> {
        self.enter(Operation::FetchChats)?;
        Ok(self.state().chat_list())
    }

    async fn fetch_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, BackendError> {
        self.enter(Operation::FetchMessages)?;
        Ok(self.state().messages_for(chat_id))
    }

    async fn fetch_chat_with_messages(
        &self,
        chat_id: &ChatId,
    ) -> Result<Option<ChatWithMessages>, BackendError> {
        self.enter(Operation::FetchChatWithMessages)?;
        let state = self.state();
        Ok(state
            .chats
            .iter()
            .find(|c| &c.id == chat_id)
            .map(|record| ChatWithMessages {
                chat: state.chat_snapshot(record),
                messages: state.messages_for(chat_id),
            }))
    }

    async fn create_chat(&self, title: &str) -> Result<Chat, BackendError> {
        self.enter(Operation::CreateChat)?;
        let chat = {
            let mut state = self.state();
            let now = state.tick();
            let record = ChatRecord {
                id: ChatId(uuid::Uuid::new_v4().to_string()),
                title: title.to_string(),
                created_at: now,
                updated_at: now,
            };
            let chat = state.chat_snapshot(&record);
            state.chats.push(record);
            chat
        };
        self.notify(Change::Chats);
        Ok(chat)
    }

    async fn update_chat_title(
        &self,
        chat_id: &ChatId,
        title: &str,
    ) -> Result<Chat, BackendError> {
        self.enter(Operation::UpdateChatTitle)?;
        let chat = {
            let mut state = self.state();
            let record = state
                .record_mut(chat_id)
                .ok_or_else(|| BackendError::NotFound(format!("chat {}", chat_id)))?;
            record.title = title.to_string();
            let state = &*state;
            state
                .chats
                .iter()
                .find(|c| &c.id == chat_id)
                .map(|record| state.chat_snapshot(record))
                .ok_or_else(|| BackendError::NotFound(format!("chat {}", chat_id)))?
        };
        self.notify(Change::Chats);
        Ok(chat)
    }

    async fn send_message(&self, message: NewMessage) -> Result<Message, BackendError> {
        self.enter(Operation::SendMessage)?;
        let stored = {
            let mut state = self.state();
            if !state.chats.iter().any(|c| c.id == message.chat_id) {
                return Err(BackendError::NotFound(format!("chat {}", message.chat_id)));
            }
            let now = state.tick();
            state.insert_message(message.chat_id, message.content, message.is_bot, now)
        };
        self.notify(Change::Messages(stored.chat_id.clone()));
        self.notify(Change::Chats);
        Ok(stored)
    }

    async fn bump_chat_timestamp(&self, chat_id: &ChatId) -> Result<ChatTimestamp, BackendError> {
        self.enter(Operation::BumpChatTimestamp)?;
        let updated_at = {
            let mut state = self.state();
            let now = state.tick();
            let record = state
                .record_mut(chat_id)
                .ok_or_else(|| BackendError::NotFound(format!("chat {}", chat_id)))?;
            record.updated_at = now;
            now
        };
        self.notify(Change::Chats);
        Ok(ChatTimestamp {
            id: chat_id.clone(),
            updated_at,
        })
    }

    async fn forward_to_responder(
        &self,
        chat_id: &ChatId,
        message: &str,
    ) -> Result<ResponderReply, BackendError> {
        self.enter(Operation::ForwardToResponder)?;
        let (exists, delay, reply, now) = {
            let mut state = self.state();
            let exists = state.chats.iter().any(|c| &c.id == chat_id);
            let now = state.tick();
            (
                exists,
                state.responder_delay,
                Arc::clone(&state.responder_reply),
                now,
            )
        };

        if !exists {
            return Ok(ResponderReply {
                success: false,
                message: Some(format!("chat {} not found", chat_id)),
                timestamp: Some(now.to_rfc3339()),
            });
        }

        if let Some(text) = reply(message) {
            let backend = self.clone();
            let chat_id = chat_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let inserted = {
                    let mut state = backend.state();
                    let at = state.tick();
                    state.insert_message(chat_id.clone(), text, true, at)
                };
                debug!(chat_id = %chat_id, message_id = %inserted.id, "responder replied");
                backend.notify(Change::Messages(chat_id));
                backend.notify(Change::Chats);
            });
        }

        Ok(ResponderReply {
            success: true,
            message: Some("Message forwarded".to_string()),
            timestamp: Some(now.to_rfc3339()),
        })
    }

    async fn subscribe_chats(&self) -> Result<FeedStream<Vec<Chat>>, BackendError> {
        self.enter(Operation::SubscribeChats)?;
        Ok(self.open_feed(State::chat_list, |change| {
            matches!(change, Change::Chats)
        }))
    }

    async fn subscribe_messages(
        &self,
        chat_id: &ChatId,
    ) -> Result<FeedStream<Vec<Message>>, BackendError> {
        self.enter(Operation::SubscribeMessages)?;
        let snapshot_id = chat_id.clone();
        let filter_id = chat_id.clone();
        Ok(self.open_feed(
            move |state| state.messages_for(&snapshot_id),
            move |change| matches!(change, Change::Messages(id) if *id == filter_id),
        ))
    }
}
