//! Read models over the store.
//!
//! A view combines a one-shot fetch, a supervised live feed and (for
//! messages) the optimistic buffer into a single state snapshot. Read-path
//! failures are recorded in that snapshot and never returned as `Err`.

mod chats;
mod messages;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use chats::{ChatListState, ChatListView};
pub use messages::{MessageListState, MessageView};

use crate::{FeedHandle, FeedStatus, SyncError};

/// State of the most recent one-shot fetch.
#[derive(Debug, Clone, Default)]
struct FetchStatus {
    in_flight: bool,
    error: Option<Arc<SyncError>>,
}

/// Counts an operation as in flight for as long as it is alive.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Status of the feed in `slot`, or the idle default when none runs.
fn feed_status(slot: &Mutex<Option<FeedHandle>>) -> FeedStatus {
    lock(slot)
        .as_ref()
        .map(FeedHandle::status)
        .unwrap_or_default()
}

/// Whether `slot` holds a feed that is still worth keeping.
fn feed_running(slot: &Option<FeedHandle>) -> bool {
    slot.as_ref()
        .is_some_and(|h| !h.is_closed() && h.status().error.is_none())
}

/// `loading` and `error` as shown to the user: the fetch only counts as
/// loading until the feed delivers, and a feed error wins over a fetch error.
fn combine(fetch: &FetchStatus, feed: &FeedStatus) -> (bool, Option<Arc<SyncError>>) {
    let loading = fetch.in_flight && !feed.has_data;
    let error = feed.error.clone().or_else(|| fetch.error.clone());
    (loading, error)
}
