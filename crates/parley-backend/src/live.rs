//! Live-feed client speaking the `graphql-transport-ws` protocol.
//!
//! Each subscription gets its own socket: connect, `connection_init`, wait for
//! `connection_ack`, then `subscribe`. A background task pumps `next` frames
//! into a channel and answers server pings. Dropping the returned stream closes
//! the channel, which makes the task send `complete` and close the socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::graphql::{GraphqlError, GraphqlRequest, GraphqlResponse};
use crate::{BackendError, FeedStream};

/// Subprotocol negotiated with the server.
pub const SUBPROTOCOL: &str = "graphql-transport-ws";

/// Buffered snapshots per subscription before the pump waits on the consumer.
const CHANNEL_CAPACITY: usize = 16;

/// Only one operation runs per socket, so the id is fixed.
const SUBSCRIPTION_ID: &str = "1";

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Frames sent by the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame<'a, V> {
    ConnectionInit {
        payload: serde_json::Value,
    },
    Subscribe {
        id: &'a str,
        payload: GraphqlRequest<'a, V>,
    },
    Complete {
        id: &'a str,
    },
    Pong {},
}

impl ClientFrame<'static, ()> {
    fn connection_init(payload: serde_json::Value) -> Self {
        ClientFrame::ConnectionInit { payload }
    }

    fn pong() -> Self {
        ClientFrame::Pong {}
    }

    fn complete() -> Self {
        ClientFrame::Complete {
            id: SUBSCRIPTION_ID,
        }
    }
}

/// Frames received from the server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    ConnectionAck {},
    Ping {},
    Pong {},
    Next {
        id: String,
        payload: serde_json::Value,
    },
    Error {
        id: String,
        payload: Vec<GraphqlError>,
    },
    Complete {
        id: String,
    },
}

/// Client for GraphQL subscriptions over WebSocket.
#[derive(Clone)]
pub struct LiveFeedClient {
    url: String,
    token: Arc<RwLock<Option<String>>>,
    connect_timeout: Duration,
}

impl LiveFeedClient {
    pub fn new(
        url: impl Into<String>,
        token: Arc<RwLock<Option<String>>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            token,
            connect_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open a subscription and map each `data` payload through `map`.
    ///
    /// Resolves once the server has acknowledged the connection and the
    /// subscribe frame was sent.
    pub async fn subscribe<V, D, T, F>(
        &self,
        operation_name: &'static str,
        query: &'static str,
        variables: V,
        map: F,
    ) -> Result<FeedStream<T>, BackendError>
    where
        V: Serialize + Send + Sync,
        D: DeserializeOwned + 'static,
        T: Send + 'static,
        F: Fn(D) -> T + Send + 'static,
    {
        let mut socket = self.connect().await?;

        send_frame(
            &mut socket,
            &ClientFrame::Subscribe {
                id: SUBSCRIPTION_ID,
                payload: GraphqlRequest {
                    query,
                    operation_name,
                    variables,
                },
            },
        )
        .await?;

        debug!(operation = operation_name, "live feed subscribed");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(socket, tx, operation_name, map));

        Ok(ReceiverStream::new(rx).boxed())
    }

    /// Connect and complete the `connection_init` / `connection_ack` handshake.
    async fn connect(&self) -> Result<Socket, BackendError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| BackendError::MalformedRequest(format!("invalid feed url: {}", e)))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        info!(url = %self.url, "connecting to live feed");

        let (mut socket, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| BackendError::Transport("live feed connect timed out".to_string()))?
            .map_err(|e| BackendError::Transport(format!("connection failed: {}", e)))?;

        let payload = match self.token.read().await.as_deref() {
            Some(token) => serde_json::json!({
                "headers": { "Authorization": format!("Bearer {}", token) }
            }),
            None => serde_json::json!({}),
        };
        send_frame(&mut socket, &ClientFrame::connection_init(payload)).await?;

        let ack = tokio::time::timeout(self.connect_timeout, wait_for_ack(&mut socket)).await;
        match ack {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackendError::Transport(
                    "timed out waiting for connection_ack".to_string(),
                ));
            }
        }

        debug!("live feed connection acknowledged");
        Ok(socket)
    }
}

async fn send_frame<V: Serialize>(
    socket: &mut Socket,
    frame: &ClientFrame<'_, V>,
) -> Result<(), BackendError> {
    let text = serde_json::to_string(frame)?;
    socket
        .send(WsMessage::Text(text))
        .await
        .map_err(|e| BackendError::Transport(format!("send failed: {}", e)))
}

async fn wait_for_ack(socket: &mut Socket) -> Result<(), BackendError> {
    while let Some(msg) = socket.next().await {
        let msg = msg.map_err(|e| BackendError::Transport(format!("read failed: {}", e)))?;
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let frame = match serde_json::from_str::<ServerFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "unparseable frame before ack");
                continue;
            }
        };
        match frame {
            ServerFrame::ConnectionAck {} => return Ok(()),
            ServerFrame::Ping {} => send_frame(socket, &ClientFrame::pong()).await?,
            other => trace!(frame = ?other, "ignoring frame before ack"),
        }
    }
    Err(BackendError::Transport(
        "socket closed before connection_ack".to_string(),
    ))
}

/// Forward `next` payloads to `tx` until the server completes, the socket
/// fails, or the consumer goes away.
async fn pump<D, T, F>(
    mut socket: Socket,
    tx: mpsc::Sender<Result<T, BackendError>>,
    operation_name: &'static str,
    map: F,
) where
    D: DeserializeOwned + 'static,
    T: Send + 'static,
    F: Fn(D) -> T + Send + 'static,
{
    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(operation = operation_name, "live feed dropped, completing");
                let _ = send_frame(&mut socket, &ClientFrame::complete()).await;
                let _ = socket.close(None).await;
                return;
            }
            msg = socket.next() => {
                let text = match msg {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "no reason".to_string());
                        let _ = tx
                            .send(Err(BackendError::Transport(format!("socket closed: {}", reason))))
                            .await;
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(BackendError::Transport(format!("read failed: {}", e))))
                            .await;
                        return;
                    }
                    None => {
                        let _ = tx
                            .send(Err(BackendError::Transport("socket closed".to_string())))
                            .await;
                        return;
                    }
                };

                let frame = match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "unparseable live feed frame");
                        continue;
                    }
                };

                match frame {
                    ServerFrame::Next { id, payload } if id == SUBSCRIPTION_ID => {
                        let item = serde_json::from_value::<GraphqlResponse<D>>(payload)
                            .map_err(BackendError::from)
                            .and_then(GraphqlResponse::into_result)
                            .map(&map);
                        let failed = item.is_err();
                        if tx.send(item).await.is_err() || failed {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                    ServerFrame::Error { id, payload } if id == SUBSCRIPTION_ID => {
                        let err = payload
                            .into_iter()
                            .next()
                            .map(BackendError::from)
                            .unwrap_or_else(|| BackendError::Unknown(String::new()));
                        let _ = tx.send(Err(err)).await;
                        let _ = socket.close(None).await;
                        return;
                    }
                    ServerFrame::Complete { id } if id == SUBSCRIPTION_ID => {
                        debug!(operation = operation_name, "server completed live feed");
                        let _ = socket.close(None).await;
                        return;
                    }
                    ServerFrame::Ping {} => {
                        if send_frame(&mut socket, &ClientFrame::pong()).await.is_err() {
                            let _ = tx
                                .send(Err(BackendError::Transport("pong failed".to_string())))
                                .await;
                            return;
                        }
                    }
                    other => trace!(frame = ?other, "ignoring frame"),
                }
            }
        }
    }
}
