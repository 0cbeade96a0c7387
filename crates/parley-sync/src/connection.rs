//! Connection state derived from a feed's observable status.

use serde::{Deserialize, Serialize};

/// Live-feed health as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// First subscription in progress, nothing received yet.
    Connecting,
    /// Receiving snapshots.
    Connected,
    /// Re-subscribing after a drop; earlier data is still shown.
    Reconnecting,
    /// Not subscribed.
    Disconnected,
    /// The feed stopped with an error.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Classify a feed. An error always wins, then loading, then data.
pub fn classify<E>(is_loading: bool, error: Option<&E>, has_data: bool) -> ConnectionState {
    if error.is_some() {
        ConnectionState::Error
    } else if is_loading && !has_data {
        ConnectionState::Connecting
    } else if is_loading {
        ConnectionState::Reconnecting
    } else if has_data {
        ConnectionState::Connected
    } else {
        ConnectionState::Disconnected
    }
}
