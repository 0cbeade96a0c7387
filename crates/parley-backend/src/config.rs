//! Connection settings for the hosted backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Where and how to reach the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// GraphQL HTTP endpoint.
    pub graphql_url: String,
    /// WebSocket endpoint for live feeds. Derived from `graphql_url` when unset.
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Bearer token sent with every request and in `connection_init`.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl BackendConfig {
    /// Configuration for an explicit GraphQL endpoint.
    pub fn new(graphql_url: impl Into<String>) -> Self {
        Self {
            graphql_url: graphql_url.into(),
            ws_url: None,
            access_token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Configuration for an Nhost project.
    pub fn nhost(subdomain: &str, region: &str) -> Self {
        Self::new(format!(
            "https://{}.hasura.{}.nhost.run/v1/graphql",
            subdomain, region
        ))
    }

    /// Set an explicit WebSocket URL.
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    /// Set the bearer token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// The WebSocket URL live feeds connect to.
    pub fn live_url(&self) -> String {
        self.ws_url
            .clone()
            .unwrap_or_else(|| ws_url_for_graphql(&self.graphql_url))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Derive a WebSocket URL from a GraphQL HTTP URL.
///
/// Converts `https://host/v1/graphql` → `wss://host/v1/graphql`.
pub fn ws_url_for_graphql(graphql_url: &str) -> String {
    if let Some(rest) = graphql_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = graphql_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        graphql_url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nhost_url() {
        let config = BackendConfig::nhost("abc123def", "eu-central-1");
        assert_eq!(
            config.graphql_url,
            "https://abc123def.hasura.eu-central-1.nhost.run/v1/graphql"
        );
        assert_eq!(
            config.live_url(),
            "wss://abc123def.hasura.eu-central-1.nhost.run/v1/graphql"
        );
    }

    #[test]
    fn test_explicit_ws_url_wins() {
        let config = BackendConfig::new("http://localhost:8080/v1/graphql")
            .with_ws_url("ws://localhost:9090/feed");
        assert_eq!(config.live_url(), "ws://localhost:9090/feed");
    }

    #[test]
    fn test_ws_url_for_plain_http() {
        assert_eq!(
            ws_url_for_graphql("http://localhost:8080/v1/graphql"),
            "ws://localhost:8080/v1/graphql"
        );
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: BackendConfig =
            serde_json::from_str(r#"{"graphql_url": "https://x/v1/graphql"}"#).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.access_token, None);
    }
}
