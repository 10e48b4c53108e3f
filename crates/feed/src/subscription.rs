//! Wallet balance feed over a graphql-transport-ws subscription
//!
//! The session speaks the `graphql-transport-ws` subprotocol by hand:
//! `connection_init` / `connection_ack`, a single `subscribe`, then a
//! stream of `next` payloads until `error` or `complete`.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use basestream_core::{ConnectionStatus, FeedError, FeedId, FeedResult, SubscriptionConfig};

use crate::decode::decode_wallet;
use crate::state::FeedEvent;
use crate::supervisor::{shutdown_flagged, Connector, SessionEnd};

const SUBPROTOCOL: &str = "graphql-transport-ws";
const SUBSCRIPTION_ID: &str = "1";
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-to-server protocol frames
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    ConnectionInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize)]
struct SubscribePayload {
    query: String,
}

/// Server-to-client protocol frames
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    ConnectionAck {
        #[serde(default)]
        #[allow(dead_code)]
        payload: Option<Value>,
    },
    Next {
        id: String,
        payload: Value,
    },
    Error {
        #[allow(dead_code)]
        id: String,
        payload: Value,
    },
    Complete {
        id: String,
    },
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        #[allow(dead_code)]
        payload: Option<Value>,
    },
}

/// The token-balance subscription document
///
/// The chain name is a GraphQL enum and stays unquoted; the wallet address
/// is an ordinary string argument.
fn subscription_query(chain_name: &str, wallet_address: &str) -> String {
    format!(
        "subscription {{ tokenBalancesForWalletAddress(chain_name: {chain_name}, \
         wallet_address: \"{wallet_address}\") {{ wallet_address last_block items {{ \
         balance quote_rate_usd quote_usd is_native balance_pretty metadata {{ \
         contract_name contract_address contract_decimals contract_ticker_symbol }} }} }} }}"
    )
}

/// One graphql-transport-ws session against the balance service
pub struct BalanceFeed {
    config: SubscriptionConfig,
}

impl BalanceFeed {
    pub fn new(config: SubscriptionConfig) -> Self {
        Self { config }
    }

    fn frame(message: &ClientMessage) -> FeedResult<Message> {
        let text = serde_json::to_string(message)
            .map_err(|e| FeedError::Transport(e.to_string()))?;
        Ok(Message::Text(text))
    }
}

#[async_trait::async_trait]
impl Connector for BalanceFeed {
    fn feed(&self) -> FeedId {
        FeedId::Balances
    }

    async fn run(
        &mut self,
        events: mpsc::Sender<FeedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> FeedResult<SessionEnd> {
        info!("Connecting to balance feed at {}", self.config.url);

        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| FeedError::ConnectFailed(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );

        let connect = connect_async(request);
        tokio::pin!(connect);
        let ws_stream = tokio::select! {
            result = &mut connect => {
                result.map_err(|e| FeedError::ConnectFailed(e.to_string()))?.0
            }
            _ = shutdown_flagged(&mut shutdown) => return Ok(SessionEnd::ShutDown),
        };

        let (mut write, mut read) = ws_stream.split();

        let init = Self::frame(&ClientMessage::ConnectionInit { payload: None })?;
        write
            .send(init)
            .await
            .map_err(|e| FeedError::Handshake(e.to_string()))?;

        // bounded wait for connection_ack
        let deadline = tokio::time::Instant::now() + ACK_TIMEOUT;
        loop {
            tokio::select! {
                _ = shutdown_flagged(&mut shutdown) => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::ShutDown);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(FeedError::Handshake(
                        "timed out waiting for connection_ack".to_string(),
                    ));
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                        Ok(ServerMessage::ConnectionAck { .. }) => break,
                        Ok(ServerMessage::Ping { payload }) => {
                            let pong = Self::frame(&ClientMessage::Pong { payload })?;
                            write
                                .send(pong)
                                .await
                                .map_err(|e| FeedError::Handshake(e.to_string()))?;
                        }
                        Ok(other) => debug!("Ignoring pre-ack frame: {:?}", other),
                        Err(e) => debug!("Unrecognized pre-ack frame: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        write
                            .send(Message::Pong(data))
                            .await
                            .map_err(|e| FeedError::Handshake(e.to_string()))?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(FeedError::Handshake(
                            "connection closed before connection_ack".to_string(),
                        ));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(FeedError::Handshake(e.to_string())),
                }
            }
        }

        info!("Balance feed handshake acknowledged");
        if events
            .send(FeedEvent::Status {
                feed: FeedId::Balances,
                status: ConnectionStatus::Connected,
                error: None,
            })
            .await
            .is_err()
        {
            return Ok(SessionEnd::ShutDown);
        }

        let subscribe = Self::frame(&ClientMessage::Subscribe {
            id: SUBSCRIPTION_ID.to_string(),
            payload: SubscribePayload {
                query: subscription_query(
                    &self.config.chain_name,
                    &self.config.wallet_address,
                ),
            },
        })?;
        write
            .send(subscribe)
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;
        info!(
            "Subscribed to token balances for {}",
            self.config.wallet_address
        );

        loop {
            tokio::select! {
                _ = shutdown_flagged(&mut shutdown) => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::ShutDown);
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                        Ok(ServerMessage::Next { id, payload }) => {
                            if id != SUBSCRIPTION_ID {
                                debug!("Dropping next frame for unknown id {}", id);
                                continue;
                            }
                            match decode_wallet(&payload) {
                                Ok(snapshot) => {
                                    if events.send(FeedEvent::Wallet(snapshot)).await.is_err() {
                                        return Ok(SessionEnd::ShutDown);
                                    }
                                }
                                Err(e) => {
                                    debug!("Balance payload dropped: {}", e);
                                    if events
                                        .send(FeedEvent::DecodeFailed {
                                            feed: FeedId::Balances,
                                            error: e,
                                        })
                                        .await
                                        .is_err()
                                    {
                                        return Ok(SessionEnd::ShutDown);
                                    }
                                }
                            }
                        }
                        Ok(ServerMessage::Error { payload, .. }) => {
                            return Err(FeedError::Subscription(payload.to_string()));
                        }
                        Ok(ServerMessage::Complete { id }) => {
                            if id != SUBSCRIPTION_ID {
                                debug!("Dropping complete frame for unknown id {}", id);
                                continue;
                            }
                            info!("Balance subscription completed by server");
                            return Ok(SessionEnd::Completed);
                        }
                        Ok(ServerMessage::Ping { payload }) => {
                            let pong = Self::frame(&ClientMessage::Pong { payload })?;
                            write
                                .send(pong)
                                .await
                                .map_err(|e| FeedError::Transport(e.to_string()))?;
                        }
                        Ok(_) => {}
                        Err(e) => debug!("Unrecognized subscription frame: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        write
                            .send(Message::Pong(data))
                            .await
                            .map_err(|e| FeedError::Transport(e.to_string()))?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!("Balance feed closed by server");
                        return Ok(SessionEnd::Completed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(FeedError::Transport(e.to_string())),
                    None => return Ok(SessionEnd::Completed),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::WebSocketStream;

    fn test_config(addr: std::net::SocketAddr) -> SubscriptionConfig {
        SubscriptionConfig {
            url: format!("ws://{addr}"),
            ..SubscriptionConfig::default()
        }
    }

    fn wallet_next_frame() -> String {
        json!({
            "id": "1",
            "type": "next",
            "payload": {
                "data": {
                    "tokenBalancesForWalletAddress": {
                        "wallet_address": "0x4200000000000000000000000000000000000011",
                        "last_block": "12345",
                        "items": [{
                            "balance": "1000000000000000000",
                            "balance_pretty": "1.0",
                            "is_native": true,
                            "quote_rate_usd": 2000.0,
                            "quote_usd": 2000.0,
                            "metadata": {
                                "contract_name": "Ether",
                                "contract_ticker_symbol": "ETH",
                                "contract_address": "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee",
                                "contract_decimals": 18
                            }
                        }]
                    }
                }
            }
        })
        .to_string()
    }

    /// Accept one client, echo the requested subprotocol, and answer the
    /// init/subscribe handshake like the real service
    async fn accept_and_ack(
        listener: TcpListener,
    ) -> (WebSocketStream<TcpStream>, Value) {
        let (stream, _) = listener.accept().await.unwrap();
        let negotiate = |request: &Request,
                         mut response: Response|
         -> Result<Response, ErrorResponse> {
            let proto = request
                .headers()
                .get("Sec-WebSocket-Protocol")
                .cloned()
                .unwrap();
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", proto);
            Ok(response)
        };
        let mut ws = accept_hdr_async(stream, negotiate).await.unwrap();

        let init = expect_text(&mut ws).await;
        assert_eq!(init["type"], "connection_init");
        ws.send(Message::Text(r#"{"type":"connection_ack"}"#.to_string()))
            .await
            .unwrap();

        let subscribe = expect_text(&mut ws).await;
        assert_eq!(subscribe["type"], "subscribe");
        (ws, subscribe)
    }

    async fn expect_text(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(data) => ws.send(Message::Pong(data)).await.unwrap(),
                other => panic!("unexpected frame from client: {other:?}"),
            }
        }
    }

    #[test]
    fn test_subscription_query_shape() {
        let query = subscription_query("BASE_SEPOLIA_FLASHBLOCKS", "0x42");
        assert!(query.contains("tokenBalancesForWalletAddress"));
        // enum argument stays unquoted, the address is quoted
        assert!(query.contains("chain_name: BASE_SEPOLIA_FLASHBLOCKS,"));
        assert!(query.contains("wallet_address: \"0x42\""));
        assert!(query.contains("contract_ticker_symbol"));
    }

    #[test]
    fn test_client_frames_serialize_without_empty_payload() {
        let init = serde_json::to_value(ClientMessage::ConnectionInit { payload: None }).unwrap();
        assert_eq!(init, json!({ "type": "connection_init" }));

        let pong = serde_json::to_value(ClientMessage::Pong {
            payload: Some(json!({ "seq": 1 })),
        })
        .unwrap();
        assert_eq!(pong, json!({ "type": "pong", "payload": { "seq": 1 } }));
    }

    #[test]
    fn test_server_frames_deserialize() {
        let ack: ServerMessage = serde_json::from_str(r#"{"type":"connection_ack"}"#).unwrap();
        assert!(matches!(ack, ServerMessage::ConnectionAck { .. }));

        let next: ServerMessage =
            serde_json::from_str(r#"{"type":"next","id":"1","payload":{}}"#).unwrap();
        match next {
            ServerMessage::Next { id, .. } => assert_eq!(id, "1"),
            other => panic!("expected next, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_subscribe_and_snapshot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut ws, subscribe) = accept_and_ack(listener).await;
            let query = subscribe["payload"]["query"].as_str().unwrap();
            assert!(query.contains("tokenBalancesForWalletAddress"));
            assert!(query.contains("chain_name: BASE_SEPOLIA_FLASHBLOCKS"));
            assert!(query.contains("\"0x4200000000000000000000000000000000000011\""));

            ws.send(Message::Text(wallet_next_frame())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"complete","id":"1"}"#.to_string()))
                .await
                .unwrap();
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut feed = BalanceFeed::new(test_config(addr));
        let session = tokio::spawn(async move { feed.run(events_tx, shutdown_rx).await });

        assert!(matches!(
            events_rx.recv().await.unwrap(),
            FeedEvent::Status {
                feed: FeedId::Balances,
                status: ConnectionStatus::Connected,
                ..
            }
        ));
        match events_rx.recv().await.unwrap() {
            FeedEvent::Wallet(snapshot) => {
                assert_eq!(snapshot.last_block, "12345");
                assert_eq!(snapshot.items.len(), 1);
                assert!(snapshot.items[0].is_native);
            }
            other => panic!("expected a wallet event, got {other:?}"),
        }

        let end = session.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Completed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_frame_fails_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut ws, _) = accept_and_ack(listener).await;
            ws.send(Message::Text(
                r#"{"type":"error","id":"1","payload":[{"message":"unauthorized"}]}"#.to_string(),
            ))
            .await
            .unwrap();
        });

        let (events_tx, _events_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut feed = BalanceFeed::new(test_config(addr));

        let outcome = feed.run(events_tx, shutdown_rx).await;
        match outcome {
            Err(FeedError::Subscription(message)) => assert!(message.contains("unauthorized")),
            other => panic!("expected a subscription error, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_ping_answered_with_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut ws, _) = accept_and_ack(listener).await;
            ws.send(Message::Text(r#"{"type":"ping"}"#.to_string()))
                .await
                .unwrap();
            let pong = expect_text(&mut ws).await;
            assert_eq!(pong["type"], "pong");
            ws.send(Message::Text(r#"{"type":"complete","id":"1"}"#.to_string()))
                .await
                .unwrap();
        });

        let (events_tx, _events_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut feed = BalanceFeed::new(test_config(addr));

        let end = feed.run(events_tx, shutdown_rx).await.unwrap();
        assert_eq!(end, SessionEnd::Completed);
        server.await.unwrap();
    }
}
