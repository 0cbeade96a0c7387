//! Client-side data synchronization for Parley.
//!
//! Reconciles three sources of truth into one consistent view of chats and
//! messages: one-shot fetches, live-feed snapshots and locally originated
//! optimistic writes.
//!
//! ## Features
//!
//! - **Local store**: normalized entity map with per-field merge policies
//! - **Live feeds**: supervised subscriptions with capped exponential backoff
//! - **Optimistic buffer**: provisional messages shown until confirmed
//! - **View models**: chat list and per-chat message list read models

mod config;
mod connection;
mod error;
pub mod feed;
mod optimistic;
pub mod retry;
pub mod store;
pub mod view;

pub use config::SyncConfig;
pub use connection::{ConnectionState, classify};
pub use error::SyncError;
pub use feed::{FeedHandle, FeedStatus};
pub use optimistic::OptimisticBuffer;
pub use retry::{FeedBackoff, RetryPolicy, retry_delay};
pub use store::{ChatPatch, EntityKey, Origin, Store, StoreEvent};
pub use view::{ChatListState, ChatListView, MessageListState, MessageView};
