//! Stream aggregator - wires the connections, the apply task, and the
//! snapshot broadcast together

use anyhow::Context;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use basestream_core::StreamConfig;

use crate::raw::BlockFeed;
use crate::state::{FeedEvent, StreamSnapshot, StreamState};
use crate::subscription::BalanceFeed;
use crate::supervisor::{shutdown_flagged, ReconnectPolicy, Supervisor};

/// Owns the two supervised connections and the single-writer apply task
///
/// All mutation flows through one `mpsc` channel into one task; consumers
/// only ever see immutable snapshots from the `watch` channel.
pub struct StreamAggregator {
    config: StreamConfig,
    events_tx: Option<mpsc::Sender<FeedEvent>>,
    events_rx: Option<mpsc::Receiver<FeedEvent>>,
    snapshot_tx: Option<watch::Sender<StreamSnapshot>>,
    snapshot_rx: watch::Receiver<StreamSnapshot>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    feed_handles: Vec<JoinHandle<()>>,
    apply_handle: Option<JoinHandle<()>>,
}

impl StreamAggregator {
    pub fn new(config: StreamConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(StreamSnapshot::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            events_tx: Some(events_tx),
            events_rx: Some(events_rx),
            snapshot_tx: Some(snapshot_tx),
            snapshot_rx,
            shutdown_tx,
            shutdown_rx,
            feed_handles: Vec::new(),
            apply_handle: None,
        }
    }

    /// Spawn the apply task and both supervised connections
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let mut events_rx = self
            .events_rx
            .take()
            .context("aggregator already started")?;
        let snapshot_tx = self
            .snapshot_tx
            .take()
            .context("aggregator already started")?;
        let events_tx = self
            .events_tx
            .as_ref()
            .context("aggregator already started")?
            .clone();

        info!("Starting stream aggregator");

        let mut state = StreamState::new(&self.config.history);
        self.apply_handle = Some(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                state.apply(event, Instant::now());
                let _ = snapshot_tx.send(state.snapshot());
            }
            debug!("Apply task drained");
        }));

        let policy = ReconnectPolicy::from(&self.config.reconnect);

        let blocks = Supervisor::new(
            BlockFeed::new(self.config.raw_feed.url.clone()),
            policy.clone(),
            events_tx.clone(),
            self.shutdown_rx.clone(),
        );
        self.feed_handles.push(tokio::spawn(blocks.run()));

        let balances = Supervisor::new(
            BalanceFeed::new(self.config.subscription.clone()),
            policy,
            events_tx,
            self.shutdown_rx.clone(),
        );
        self.feed_handles.push(tokio::spawn(balances.run()));

        Ok(())
    }

    /// Immediate snapshot stream; a new value on every applied event
    pub fn subscribe(&self) -> watch::Receiver<StreamSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Snapshot stream coalesced by the display-throttle delay
    ///
    /// Rapid bursts collapse into the newest snapshot; the state store
    /// itself is never throttled.
    pub fn subscribe_throttled(&self) -> watch::Receiver<StreamSnapshot> {
        spawn_throttled(
            self.snapshot_rx.clone(),
            self.config.display_throttle(),
            self.shutdown_rx.clone(),
        )
    }

    /// Flag shutdown, join the connections, then let the apply task drain
    pub async fn stop(&mut self) {
        info!("Stopping stream aggregator");
        let _ = self.shutdown_tx.send(true);

        for handle in self.feed_handles.drain(..) {
            let _ = handle.await;
        }

        // dropping the last event sender ends the apply loop
        self.events_tx = None;
        if let Some(handle) = self.apply_handle.take() {
            let _ = handle.await;
        }
    }
}

pub(crate) fn spawn_throttled(
    mut upstream: watch::Receiver<StreamSnapshot>,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> watch::Receiver<StreamSnapshot> {
    let (tx, rx) = watch::channel(upstream.borrow().clone());

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = upstream.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // wait out the window, then forward whatever is newest
                    tokio::time::sleep(delay).await;
                    let latest = upstream.borrow_and_update().clone();
                    if tx.send(latest).is_err() {
                        break;
                    }
                }
                _ = shutdown_flagged(&mut shutdown) => break,
            }
        }
        debug!("Throttled snapshot task closed");
    });

    rx
}
