//! Raw block-header feed over plain WebSocket

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use basestream_core::{ConnectionStatus, FeedError, FeedId, FeedResult};

use crate::decode::{decode_block, decode_diff_record, parse_payload, text_from_binary};
use crate::state::FeedEvent;
use crate::supervisor::{shutdown_flagged, Connector, SessionEnd};

/// One plain WebSocket session against the raw block feed
///
/// No outbound handshake: the server starts pushing block payloads as soon
/// as the transport is open.
pub struct BlockFeed {
    url: String,
}

impl BlockFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Decode one payload and forward whatever it yields
    ///
    /// A message can carry a new block, a diff, or both; an undecodable one
    /// is dropped and reported. Returns false once the events channel is
    /// closed.
    async fn dispatch(&self, text: &str, events: &mpsc::Sender<FeedEvent>) -> bool {
        let payload = match parse_payload(text) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Raw feed message is not JSON: {}", e);
                return events
                    .send(FeedEvent::DecodeFailed {
                        feed: FeedId::Blocks,
                        error: e,
                    })
                    .await
                    .is_ok();
            }
        };

        match (decode_block(&payload), decode_diff_record(&payload)) {
            (Ok(block), Ok(record)) => {
                if events.send(FeedEvent::Block(block)).await.is_err() {
                    return false;
                }
                events.send(FeedEvent::Diff(record)).await.is_ok()
            }
            (Ok(block), Err(_)) => events.send(FeedEvent::Block(block)).await.is_ok(),
            (Err(_), Ok(record)) => events.send(FeedEvent::Diff(record)).await.is_ok(),
            (Err(e), Err(_)) => {
                debug!("Raw feed message dropped: {}", e);
                events
                    .send(FeedEvent::DecodeFailed {
                        feed: FeedId::Blocks,
                        error: e,
                    })
                    .await
                    .is_ok()
            }
        }
    }
}

#[async_trait::async_trait]
impl Connector for BlockFeed {
    fn feed(&self) -> FeedId {
        FeedId::Blocks
    }

    async fn run(
        &mut self,
        events: mpsc::Sender<FeedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> FeedResult<SessionEnd> {
        info!("Connecting to raw feed at {}", self.url);

        let connect = connect_async(&self.url);
        tokio::pin!(connect);
        let ws_stream = tokio::select! {
            result = &mut connect => {
                result.map_err(|e| FeedError::ConnectFailed(e.to_string()))?.0
            }
            _ = shutdown_flagged(&mut shutdown) => return Ok(SessionEnd::ShutDown),
        };

        info!("Connected to raw feed");
        if events
            .send(FeedEvent::Status {
                feed: FeedId::Blocks,
                status: ConnectionStatus::Connected,
                error: None,
            })
            .await
            .is_err()
        {
            return Ok(SessionEnd::ShutDown);
        }

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                _ = shutdown_flagged(&mut shutdown) => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::ShutDown);
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if !self.dispatch(&text, &events).await {
                            return Ok(SessionEnd::ShutDown);
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match text_from_binary(bytes) {
                        Ok(text) => {
                            if !self.dispatch(&text, &events).await {
                                return Ok(SessionEnd::ShutDown);
                            }
                        }
                        Err(e) => {
                            warn!("Raw feed sent a non-UTF-8 binary frame");
                            if events
                                .send(FeedEvent::DecodeFailed {
                                    feed: FeedId::Blocks,
                                    error: e,
                                })
                                .await
                                .is_err()
                            {
                                return Ok(SessionEnd::ShutDown);
                            }
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        write
                            .send(Message::Pong(data))
                            .await
                            .map_err(|e| FeedError::Transport(e.to_string()))?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Raw feed closed by server");
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
