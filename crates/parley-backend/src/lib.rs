//! Backend contract for Parley's chat client.
//!
//! The hosted backend is treated as an opaque store reachable through a fixed
//! set of queries, mutations, one action and two live feeds. This crate
//! defines that contract and ships the implementations the client uses.
//!
//! ## Features
//!
//! - **Contract**: the [`ChatBackend`] trait and the domain types it moves
//! - **GraphQL client**: HTTP queries/mutations against a Hasura endpoint
//! - **Live feed**: `graphql-transport-ws` subscriptions over WebSocket
//! - **Memory backend**: in-process implementation with failure injection

mod backend;
mod client;
mod config;
mod error;
pub mod graphql;
pub mod live;
pub mod memory;
mod types;

pub use backend::{ChatBackend, FeedStream};
pub use client::GraphqlClient;
pub use config::{BackendConfig, ws_url_for_graphql};
pub use error::{BackendError, ErrorKind};
pub use live::LiveFeedClient;
pub use memory::{MemoryBackend, Operation};
pub use types::*;
