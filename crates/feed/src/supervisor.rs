//! Fixed-delay reconnect supervision for one connection
//!
//! A supervisor owns one `Connector` and re-runs it after every session
//! error or normal completion, with a constant delay and no backoff, until
//! shutdown is flagged or the retry ceiling is reached.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use basestream_core::{ConnectionStatus, FeedError, FeedId, FeedResult, ReconnectConfig};

use crate::state::FeedEvent;

/// How a transport session ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server completed the stream normally
    Completed,
    /// The shutdown flag was observed
    ShutDown,
}

/// One transport session per call
#[async_trait::async_trait]
pub trait Connector: Send {
    fn feed(&self) -> FeedId;

    async fn run(
        &mut self,
        events: mpsc::Sender<FeedEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> FeedResult<SessionEnd>;
}

/// Rebuild schedule for a dropped session
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Fixed wait between attempts
    pub delay: Duration,
    /// Consecutive failed attempts tolerated before giving up
    pub retry_ceiling: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            retry_ceiling: 100,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            delay: config.delay(),
            retry_ceiling: config.retry_ceiling,
        }
    }
}

/// Resolves once the shutdown flag is set (or its sender is gone)
pub(crate) async fn shutdown_flagged(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Runs a connector as a session loop with fixed-delay restarts
pub struct Supervisor<C> {
    connector: C,
    policy: ReconnectPolicy,
    events: mpsc::Sender<FeedEvent>,
    shutdown: watch::Receiver<bool>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        policy: ReconnectPolicy,
        events: mpsc::Sender<FeedEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            policy,
            events,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let feed = self.connector.feed();
        let mut consecutive_failures: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                self.send_status(feed, ConnectionStatus::Disconnected, None)
                    .await;
                return;
            }

            self.send_status(feed, ConnectionStatus::Connecting, None)
                .await;

            match self
                .connector
                .run(self.events.clone(), self.shutdown.clone())
                .await
            {
                Ok(SessionEnd::ShutDown) => {
                    info!("Feed {} shut down", feed);
                    self.send_status(feed, ConnectionStatus::Disconnected, None)
                        .await;
                    return;
                }
                Ok(SessionEnd::Completed) => {
                    consecutive_failures = 0;
                    info!("Feed {} stream completed by server", feed);
                    self.send_status(feed, ConnectionStatus::Disconnected, None)
                        .await;
                }
                Err(e) => {
                    // only setup failures count toward the ceiling; a session
                    // that was established resets the count
                    if matches!(e, FeedError::ConnectFailed(_) | FeedError::Handshake(_)) {
                        consecutive_failures += 1;
                    } else {
                        consecutive_failures = 0;
                    }

                    error!("Feed {} error: {}", feed, e);
                    self.send_status(feed, ConnectionStatus::Error, Some(e.to_string()))
                        .await;

                    if consecutive_failures >= self.policy.retry_ceiling {
                        error!(
                            "Feed {} giving up after {} consecutive failed attempts",
                            feed, consecutive_failures
                        );
                        return;
                    }
                }
            }

            warn!("Feed {} reconnecting in {:?}", feed, self.policy.delay);
            if self.wait_for_retry().await {
                self.send_status(feed, ConnectionStatus::Disconnected, None)
                    .await;
                return;
            }
        }
    }

    /// Sleep out the fixed delay; true when shutdown was flagged meanwhile
    ///
    /// The flag is re-checked even when the timer wins the race, so an
    /// elapsed reconnect wait never starts a session after teardown.
    async fn wait_for_retry(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.policy.delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return *self.shutdown.borrow(),
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }

    async fn send_status(&self, feed: FeedId, status: ConnectionStatus, error: Option<String>) {
        let event = FeedEvent::Status {
            feed,
            status,
            error,
        };
        if self.events.send(event).await.is_err() {
            debug!("Events channel closed");
        }
    }
}
