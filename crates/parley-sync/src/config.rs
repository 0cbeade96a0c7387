//! Sync-layer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Reconnect policy for live feeds.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Refetch a chat's messages this long after forwarding to the responder.
    /// Off by default; the reply normally arrives through the live feed.
    #[serde(default)]
    pub responder_refetch_after_ms: Option<u64>,
}

impl SyncConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_responder_refetch(mut self, after: Duration) -> Self {
        self.responder_refetch_after_ms = Some(after.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn responder_refetch_after(&self) -> Option<Duration> {
        self.responder_refetch_after_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.responder_refetch_after(), None);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"retry": {"base_delay_ms": 250}, "responder_refetch_after_ms": 3000}"#,
        )
        .unwrap();
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(
            config.responder_refetch_after(),
            Some(Duration::from_secs(3))
        );
    }
}
