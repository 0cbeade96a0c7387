//! Provisional messages shown before the backend confirms them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use parley_backend::{ChatId, Message, MessageId, OPTIMISTIC_PREFIX};
use tracing::debug;

/// Disambiguates placeholder ids created in the same millisecond.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Client-side buffer of optimistic messages.
///
/// Entries live here until a confirmed message with the same chat and content
/// shows up, or until their send fails. Confirmed and optimistic messages are
/// never stored together: the store only ever sees confirmed ones.
#[derive(Debug, Default)]
pub struct OptimisticBuffer {
    entries: Mutex<Vec<Message>>,
}

impl OptimisticBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a provisional message and return its placeholder id.
    pub fn add(&self, chat_id: &ChatId, content: &str, is_bot: bool) -> MessageId {
        let now = Utc::now();
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let id = MessageId(format!(
            "{}{}-{}-{}",
            OPTIMISTIC_PREFIX,
            content,
            now.timestamp_millis(),
            seq
        ));

        self.lock().push(Message {
            id: id.clone(),
            chat_id: chat_id.clone(),
            content: content.to_string(),
            is_bot,
            created_at: now,
        });
        id
    }

    /// Drop every provisional entry matched by a confirmed message (same chat
    /// and content). Returns how many were removed.
    pub fn reconcile(&self, confirmed: &[Message]) -> usize {
        if confirmed.is_empty() {
            return 0;
        }
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|pending| {
            !confirmed
                .iter()
                .any(|m| m.chat_id == pending.chat_id && m.content == pending.content)
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "reconciled optimistic messages");
        }
        removed
    }

    /// Remove one entry regardless of confirmation.
    pub fn discard(&self, id: &MessageId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|m| &m.id != id);
        entries.len() != before
    }

    /// All entries, oldest first.
    pub fn list_all(&self) -> Vec<Message> {
        let mut entries = self.lock().clone();
        entries.sort_by_key(|m| m.created_at);
        entries
    }

    /// Entries for one chat, oldest first.
    pub fn list_for(&self, chat_id: &ChatId) -> Vec<Message> {
        let mut entries: Vec<Message> = self
            .lock()
            .iter()
            .filter(|m| &m.chat_id == chat_id)
            .cloned()
            .collect();
        entries.sort_by_key(|m| m.created_at);
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed(chat_id: &str, content: &str) -> Message {
        Message {
            id: MessageId::from(format!("srv-{}", content)),
            chat_id: ChatId::from(chat_id),
            content: content.to_string(),
            is_bot: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_add_then_reconcile() {
        let buffer = OptimisticBuffer::new();
        let c1 = ChatId::from("c1");
        let id = buffer.add(&c1, "hello", false);

        assert!(id.is_optimistic());
        assert_eq!(buffer.list_for(&c1).len(), 1);

        assert_eq!(buffer.reconcile(&[confirmed("c1", "hello")]), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_same_content_twice_gets_distinct_ids() {
        let buffer = OptimisticBuffer::new();
        let c1 = ChatId::from("c1");
        let a = buffer.add(&c1, "same", false);
        let b = buffer.add(&c1, "same", false);
        assert_ne!(a, b);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_reconcile_ignores_other_chats() {
        let buffer = OptimisticBuffer::new();
        buffer.add(&ChatId::from("c1"), "hello", false);

        assert_eq!(buffer.reconcile(&[confirmed("c2", "hello")]), 0);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_discard() {
        let buffer = OptimisticBuffer::new();
        let c1 = ChatId::from("c1");
        let id = buffer.add(&c1, "oops", false);
        buffer.add(&c1, "keep", false);

        assert!(buffer.discard(&id));
        assert!(!buffer.discard(&id));
        let remaining = buffer.list_all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "keep");
    }
}
