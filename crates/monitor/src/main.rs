//! Basestream monitor
//!
//! Binary entry point: wires configuration, logging, and signal handling
//! around the stream aggregator and reports its snapshots through logs.

use tokio::signal;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use basestream_core::{ConnectionHealth, ConnectionStatus, FeedId, StreamConfig};
use basestream_feed::{StreamAggregator, StreamSnapshot};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting basestream monitor v{}", env!("CARGO_PKG_VERSION"));

    let config = StreamConfig::from_env();
    info!("Raw feed: {}", config.raw_feed.url);
    info!(
        "Balance feed: {} (wallet {})",
        config.subscription.url, config.subscription.wallet_address
    );

    let mut aggregator = StreamAggregator::new(config);
    aggregator.start().await?;

    let mut snapshots = WatchStream::new(aggregator.subscribe_throttled());

    // Setup shutdown channel
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C");
            }
            _ = terminate => {
                info!("Received termination signal");
            }
        }

        let _ = shutdown_tx.send(());
    });

    info!("Press Ctrl+C to shutdown");

    let mut reporter = SnapshotReporter::default();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            snapshot = snapshots.next() => match snapshot {
                Some(snapshot) => reporter.report(&snapshot),
                None => break,
            }
        }
    }

    aggregator.stop().await;
    info!("Monitor shutdown complete");
    Ok(())
}

/// Remembers what was last reported so only changes get logged
#[derive(Default)]
struct SnapshotReporter {
    last_block: Option<String>,
    last_wallet_block: Option<String>,
    blocks_status: Option<ConnectionStatus>,
    balances_status: Option<ConnectionStatus>,
}

impl SnapshotReporter {
    fn report(&mut self, snapshot: &StreamSnapshot) {
        if let Some(block) = &snapshot.block {
            if self.last_block.as_deref() != Some(block.number.as_str()) {
                self.last_block = Some(block.number.clone());
                match snapshot.block_refresh_ms {
                    Some(ms) => info!("Block {} {} ({} ms)", block.number, block.short_hash(), ms),
                    None => info!("Block {} {}", block.number, block.short_hash()),
                }
            }
        }

        if let Some(wallet) = &snapshot.wallet {
            if self.last_wallet_block.as_deref() != Some(wallet.last_block.as_str()) {
                self.last_wallet_block = Some(wallet.last_block.clone());
                let lag = if snapshot.wallet_lagging() {
                    " (lagging)"
                } else {
                    ""
                };
                info!(
                    "Wallet {} at block {}{} with {} tokens",
                    wallet.wallet_address,
                    snapshot.display_last_block().unwrap_or_default(),
                    lag,
                    wallet.items.len()
                );
            }
        }

        if self.blocks_status != Some(snapshot.blocks_health.status) {
            self.blocks_status = Some(snapshot.blocks_health.status);
            log_health(FeedId::Blocks, &snapshot.blocks_health);
        }
        if self.balances_status != Some(snapshot.balances_health.status) {
            self.balances_status = Some(snapshot.balances_health.status);
            log_health(FeedId::Balances, &snapshot.balances_health);
        }
    }
}

fn log_health(feed: FeedId, health: &ConnectionHealth) {
    match (health.status, &health.error) {
        (ConnectionStatus::Error, Some(message)) => {
            warn!("Feed {} is {}: {}", feed, health.status, message);
        }
        _ => info!("Feed {} is {}", feed, health.status),
    }
}
