//! GraphQL-over-HTTP client implementation.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use crate::graphql::{
    self, BumpTimestampData, ChatByPkData, ChatsData, CreateChatData, GraphqlRequest,
    GraphqlResponse, MessagesData, ResponderData, SendMessageData, UpdateChatData,
};
use crate::live::LiveFeedClient;
use crate::{
    BackendConfig, BackendError, Chat, ChatBackend, ChatId, ChatTimestamp, ChatWithMessages,
    FeedStream, Message, NewMessage, ResponderReply,
};

/// Client for a Hasura GraphQL endpoint.
///
/// Queries, mutations and the responder action go over HTTP; live feeds are
/// delegated to a [`LiveFeedClient`] sharing the same access token.
pub struct GraphqlClient {
    http: Client,
    config: BackendConfig,
    token: Arc<RwLock<Option<String>>>,
}

impl GraphqlClient {
    /// Create a new client for the given configuration.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;

        let token = Arc::new(RwLock::new(config.access_token.clone()));
        Ok(Self {
            http,
            config,
            token,
        })
    }

    /// The GraphQL endpoint this client talks to.
    pub fn graphql_url(&self) -> &str {
        &self.config.graphql_url
    }

    /// Replace the bearer token (e.g. after the auth provider refreshed it).
    pub async fn set_access_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    /// The live-feed client for this backend.
    pub fn live(&self) -> LiveFeedClient {
        LiveFeedClient::new(
            self.config.live_url(),
            Arc::clone(&self.token),
            self.config.connect_timeout(),
        )
    }

    /// Run one GraphQL operation and decode its `data`.
    async fn execute<V, T>(
        &self,
        operation_name: &str,
        query: &str,
        variables: V,
    ) -> Result<T, BackendError>
    where
        V: Serialize + Send,
        T: DeserializeOwned,
    {
        let mut request = self.http.post(&self.config.graphql_url).json(&GraphqlRequest {
            query,
            operation_name,
            variables,
        });

        if let Some(token) = self.token.read().await.as_deref() {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        debug!(operation = operation_name, "executing GraphQL operation");

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                BackendError::Transport(e.to_string())
            } else {
                BackendError::Http(e)
            }
        })?;

        self.handle_response(response).await
    }

    /// Handle an HTTP response, converting status codes and GraphQL errors.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(BackendError::RateLimited { retry_after_secs });
        }

        let text = response.text().await.map_err(|e| {
            BackendError::Transport(format!(
                "request failed ({}): failed to read response: {}",
                status, e
            ))
        })?;

        if !status.is_success() {
            // Hasura reports most failures as GraphQL errors even on non-2xx
            if let Ok(envelope) = serde_json::from_str::<GraphqlResponse<serde_json::Value>>(&text)
                && let Some(first) = envelope.errors.into_iter().next()
            {
                return Err(first.into());
            }

            let message = format!("request failed ({}): {}", status, text);
            return Err(match status.as_u16() {
                401 | 403 => BackendError::Permission(message),
                400 | 422 => BackendError::MalformedRequest(message),
                s if s >= 500 => BackendError::Transport(message),
                _ => BackendError::Unknown(message),
            });
        }

        let envelope: GraphqlResponse<T> = serde_json::from_str(&text)?;
        envelope.into_result()
    }
}

#[async_trait]
impl ChatBackend for GraphqlClient {
    async fn fetch_chats(&self) -> Result<Vec<Chat>, BackendError> {
        let data: ChatsData = self
            .execute("GetUserChats", graphql::GET_USER_CHATS, json!({}))
            .await?;
        Ok(data.into_chats())
    }

    async fn fetch_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, BackendError> {
        let data: MessagesData = self
            .execute(
                "GetChatMessages",
                graphql::GET_CHAT_MESSAGES,
                json!({ "chatId": chat_id }),
            )
            .await?;
        Ok(data.messages)
    }

    async fn fetch_chat_with_messages(
        &self,
        chat_id: &ChatId,
    ) -> Result<Option<ChatWithMessages>, BackendError> {
        let data: ChatByPkData = self
            .execute(
                "GetChatWithMessages",
                graphql::GET_CHAT_WITH_MESSAGES,
                json!({ "chatId": chat_id }),
            )
            .await?;
        Ok(data.chats_by_pk.map(ChatWithMessages::from))
    }

    async fn create_chat(&self, title: &str) -> Result<Chat, BackendError> {
        let data: CreateChatData = self
            .execute("CreateChat", graphql::CREATE_CHAT, json!({ "title": title }))
            .await?;
        Ok(Chat::from(data.insert_chats_one))
    }

    async fn update_chat_title(
        &self,
        chat_id: &ChatId,
        title: &str,
    ) -> Result<Chat, BackendError> {
        let data: UpdateChatData = self
            .execute(
                "UpdateChatTitle",
                graphql::UPDATE_CHAT_TITLE,
                json!({ "chatId": chat_id, "title": title }),
            )
            .await?;
        data.update_chats_by_pk
            .map(Chat::from)
            .ok_or_else(|| BackendError::NotFound(format!("chat {}", chat_id)))
    }

    async fn send_message(&self, message: NewMessage) -> Result<Message, BackendError> {
        let data: SendMessageData = self
            .execute(
                "SendMessage",
                graphql::SEND_MESSAGE,
                json!({
                    "chatId": message.chat_id,
                    "content": message.content,
                    "isBot": message.is_bot,
                }),
            )
            .await?;
        Ok(data.insert_messages_one)
    }

    async fn bump_chat_timestamp(&self, chat_id: &ChatId) -> Result<ChatTimestamp, BackendError> {
        let data: BumpTimestampData = self
            .execute(
                "UpdateChatTimestamp",
                graphql::UPDATE_CHAT_TIMESTAMP,
                json!({ "chatId": chat_id }),
            )
            .await?;
        data.update_chats_by_pk
            .ok_or_else(|| BackendError::NotFound(format!("chat {}", chat_id)))
    }

    async fn forward_to_responder(
        &self,
        chat_id: &ChatId,
        message: &str,
    ) -> Result<ResponderReply, BackendError> {
        let data: ResponderData = self
            .execute(
                "SendMessageWithAI",
                graphql::SEND_MESSAGE_WITH_AI,
                json!({ "chatId": chat_id, "message": message }),
            )
            .await?;
        Ok(data.send_message)
    }

    async fn subscribe_chats(&self) -> Result<FeedStream<Vec<Chat>>, BackendError> {
        self.live()
            .subscribe(
                "SubscribeToUserChats",
                graphql::SUBSCRIBE_TO_USER_CHATS,
                json!({}),
                ChatsData::into_chats,
            )
            .await
    }

    async fn subscribe_messages(
        &self,
        chat_id: &ChatId,
    ) -> Result<FeedStream<Vec<Message>>, BackendError> {
        self.live()
            .subscribe(
                "SubscribeToChatMessages",
                graphql::SUBSCRIBE_TO_CHAT_MESSAGES,
                json!({ "chatId": chat_id }),
                |data: MessagesData| data.messages,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GraphqlClient {
        GraphqlClient::new(BackendConfig::new(format!("{}/v1/graphql", server.uri()))).unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client =
            GraphqlClient::new(BackendConfig::new("https://example.com/v1/graphql")).unwrap();
        assert_eq!(client.graphql_url(), "https://example.com/v1/graphql");
    }

    #[tokio::test]
    async fn test_fetch_chats() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .and(body_partial_json(serde_json::json!({ "operationName": "GetUserChats" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "chats": [{
                        "id": "c1",
                        "title": "First",
                        "created_at": "2024-05-01T10:00:00+00:00",
                        "updated_at": "2024-05-01T12:00:00+00:00",
                        "messages_aggregate": { "aggregate": { "count": 2 } },
                        "messages": [{
                            "content": "latest",
                            "is_bot": true,
                            "created_at": "2024-05-01T12:00:00+00:00"
                        }]
                    }]
                }
            })))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server);
        let chats = client.fetch_chats().await.unwrap();

        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].id, ChatId::from("c1"));
        assert_eq!(chats[0].message_count, 2);
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .and(header("Authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "messages": [] }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server);
        client
            .set_access_token(Some("secret-token".to_string()))
            .await;
        let messages = client.fetch_messages(&ChatId::from("c1")).await.unwrap();

        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_send_message() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .and(body_partial_json(serde_json::json!({
                "operationName": "SendMessage",
                "variables": { "chatId": "c1", "content": "hello", "isBot": false }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "insert_messages_one": {
                        "id": "m1",
                        "chat_id": "c1",
                        "content": "hello",
                        "is_bot": false,
                        "created_at": "2024-05-01T12:00:00+00:00"
                    }
                }
            })))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server);
        let message = client
            .send_message(NewMessage {
                chat_id: ChatId::from("c1"),
                content: "hello".to_string(),
                is_bot: false,
            })
            .await
            .unwrap();

        assert_eq!(message.id.as_str(), "m1");
    }

    #[tokio::test]
    async fn test_graphql_permission_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errors": [{
                    "message": "field 'insert_chats_one' not found in type: 'mutation_root'",
                    "extensions": { "code": "validation-failed", "path": "$" }
                }]
            })))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server);
        let err = client.create_chat("New chat").await.unwrap_err();

        assert!(matches!(err, BackendError::Permission(_)));
    }

    #[tokio::test]
    async fn test_update_title_missing_row() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "update_chats_by_pk": null }
            })))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server);
        let err = client
            .update_chat_title(&ChatId::from("missing"), "Renamed")
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server);
        let err = client.fetch_chats().await.unwrap_err();

        assert!(matches!(
            err,
            BackendError::RateLimited {
                retry_after_secs: Some(7)
            }
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server);
        let err = client.fetch_chats().await.unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_responder_acknowledgement() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/graphql"))
            .and(body_partial_json(serde_json::json!({ "operationName": "SendMessageWithAI" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "sendMessage": {
                        "success": true,
                        "message": "queued",
                        "timestamp": "2024-05-01T12:00:01Z"
                    }
                }
            })))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server);
        let reply = client
            .forward_to_responder(&ChatId::from("c1"), "what's the weather?")
            .await
            .unwrap();

        assert!(reply.success);
        assert_eq!(reply.message.as_deref(), Some("queued"));
    }
}
