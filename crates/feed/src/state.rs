//! Aggregated stream state and its published snapshot
//!
//! `StreamState` is owned by exactly one task; connections reach it only
//! through `FeedEvent`s, so no locks guard the fields. Readers see the
//! state through cloned `StreamSnapshot`s.

use serde::Serialize;
use std::time::Instant;

use basestream_core::{
    BlockEvent, ConnectionHealth, ConnectionStatus, DecodeError, DiffRecord, FeedId,
    HistoryConfig, RollingHistory, WalletSnapshot,
};

/// Everything a connection can report to the apply task
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Block(BlockEvent),
    Diff(DiffRecord),
    Wallet(WalletSnapshot),
    Status {
        feed: FeedId,
        status: ConnectionStatus,
        error: Option<String>,
    },
    DecodeFailed {
        feed: FeedId,
        error: DecodeError,
    },
}

/// Observability counters, never used for control flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamMetrics {
    pub events_applied: u64,
    pub decode_errors: u64,
    pub reconnections: u64,
}

/// The single mutation point for all stream data
#[derive(Debug)]
pub struct StreamState {
    block: Option<BlockEvent>,
    block_history: RollingHistory<BlockEvent>,
    diff_history: RollingHistory<DiffRecord>,
    wallet: Option<WalletSnapshot>,
    blocks_health: ConnectionHealth,
    balances_health: ConnectionHealth,
    block_refresh_ms: Option<u64>,
    wallet_refresh_ms: Option<u64>,
    last_block_at: Option<Instant>,
    last_wallet_at: Option<Instant>,
    metrics: StreamMetrics,
}

impl StreamState {
    pub fn new(history: &HistoryConfig) -> Self {
        Self {
            block: None,
            block_history: RollingHistory::new(history.block_capacity),
            diff_history: RollingHistory::new(history.diff_capacity),
            wallet: None,
            blocks_health: ConnectionHealth::default(),
            balances_health: ConnectionHealth::default(),
            block_refresh_ms: None,
            wallet_refresh_ms: None,
            last_block_at: None,
            last_wallet_at: None,
            metrics: StreamMetrics::default(),
        }
    }

    /// Apply one event at the given arrival time
    pub fn apply(&mut self, event: FeedEvent, now: Instant) {
        match event {
            FeedEvent::Block(block) => self.apply_block(block, now),
            FeedEvent::Diff(record) => self.apply_diff(record),
            FeedEvent::Wallet(snapshot) => self.apply_wallet(snapshot, now),
            FeedEvent::Status {
                feed,
                status,
                error,
            } => self.set_status(feed, status, error),
            FeedEvent::DecodeFailed { feed, error } => self.record_decode_failure(feed, &error),
        }
    }

    /// Accept a block only when its number differs from the current one
    pub fn apply_block(&mut self, block: BlockEvent, now: Instant) {
        let same_number = self
            .block
            .as_ref()
            .map(|current| current.number == block.number)
            .unwrap_or(false);
        if same_number {
            return;
        }

        if let Some(previous) = self.last_block_at {
            self.block_refresh_ms = Some(now.duration_since(previous).as_millis() as u64);
        }
        self.last_block_at = Some(now);

        self.block_history
            .push_dedup_by(block.clone(), |b| b.number.clone());
        self.block = Some(block);
        self.metrics.events_applied += 1;
    }

    /// Record a diff unconditionally
    pub fn apply_diff(&mut self, record: DiffRecord) {
        self.diff_history.push(record);
        self.metrics.events_applied += 1;
    }

    /// Replace the wallet snapshot wholesale
    pub fn apply_wallet(&mut self, snapshot: WalletSnapshot, now: Instant) {
        if let Some(previous) = self.last_wallet_at {
            self.wallet_refresh_ms = Some(now.duration_since(previous).as_millis() as u64);
        }
        self.last_wallet_at = Some(now);

        self.wallet = Some(snapshot);
        self.metrics.events_applied += 1;
    }

    /// Overwrite a connection's health
    ///
    /// The error message is replaced only when one is supplied, and cleared
    /// on a successful connect. Re-entering `Connecting` from any settled
    /// state counts as a reconnection.
    pub fn set_status(&mut self, feed: FeedId, status: ConnectionStatus, error: Option<String>) {
        let prior = self.health(feed).status;
        if status == ConnectionStatus::Connecting
            && prior != ConnectionStatus::Idle
            && prior != ConnectionStatus::Connecting
        {
            self.metrics.reconnections += 1;
        }

        let health = self.health_mut(feed);
        health.status = status;
        match status {
            ConnectionStatus::Connected => health.error = None,
            _ => {
                if let Some(message) = error {
                    health.error = Some(message);
                }
            }
        }
    }

    /// Count a dropped message and surface its reason without touching
    /// the connection status
    pub fn record_decode_failure(&mut self, feed: FeedId, error: &DecodeError) {
        self.metrics.decode_errors += 1;
        self.health_mut(feed).error = Some(error.to_string());
    }

    pub fn health(&self, feed: FeedId) -> &ConnectionHealth {
        match feed {
            FeedId::Blocks => &self.blocks_health,
            FeedId::Balances => &self.balances_health,
        }
    }

    fn health_mut(&mut self, feed: FeedId) -> &mut ConnectionHealth {
        match feed {
            FeedId::Blocks => &mut self.blocks_health,
            FeedId::Balances => &mut self.balances_health,
        }
    }

    pub fn metrics(&self) -> StreamMetrics {
        self.metrics
    }

    /// Consistent, cloneable view of the whole state
    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            block: self.block.clone(),
            block_history: self.block_history.to_vec(),
            diff_history: self.diff_history.to_vec(),
            wallet: self.wallet.clone(),
            blocks_health: self.blocks_health.clone(),
            balances_health: self.balances_health.clone(),
            block_refresh_ms: self.block_refresh_ms,
            wallet_refresh_ms: self.wallet_refresh_ms,
            metrics: self.metrics,
        }
    }
}

/// Immutable view published through the watch channel
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamSnapshot {
    pub block: Option<BlockEvent>,
    /// Newest first, deduped by block number
    pub block_history: Vec<BlockEvent>,
    /// Newest first
    pub diff_history: Vec<DiffRecord>,
    pub wallet: Option<WalletSnapshot>,
    pub blocks_health: ConnectionHealth,
    pub balances_health: ConnectionHealth,
    pub block_refresh_ms: Option<u64>,
    pub wallet_refresh_ms: Option<u64>,
    pub metrics: StreamMetrics,
}

impl StreamSnapshot {
    /// True when the balance service trails the raw feed's block height
    ///
    /// Display only; unparsable numbers read as not lagging.
    pub fn wallet_lagging(&self) -> bool {
        let wallet_block = self
            .wallet
            .as_ref()
            .and_then(|w| w.last_block.parse::<u64>().ok());
        let chain_block = self
            .block
            .as_ref()
            .and_then(|b| b.number.parse::<u64>().ok());
        match (wallet_block, chain_block) {
            (Some(wallet), Some(chain)) => wallet < chain,
            _ => false,
        }
    }

    /// Block number to show next to the wallet: the wallet's own
    /// `last_block`, or the raw feed's number when the wallet trails it
    pub fn display_last_block(&self) -> Option<String> {
        match (&self.wallet, &self.block) {
            (Some(wallet), Some(block)) => {
                if self.wallet_lagging() {
                    Some(block.number.clone())
                } else {
                    Some(wallet.last_block.clone())
                }
            }
            (Some(wallet), None) => Some(wallet.last_block.clone()),
            (None, Some(block)) => Some(block.number.clone()),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn block(number: &str) -> BlockEvent {
        BlockEvent {
            number: number.to_string(),
            hash: format!("0xhash{number}"),
            timestamp: "12:00:00".to_string(),
            payload_id: None,
        }
    }

    fn diff(block_number: &str) -> DiffRecord {
        DiffRecord {
            block_number: block_number.to_string(),
            diff: serde_json::json!({}),
            payload_id: None,
            timestamp: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn wallet(last_block: &str) -> WalletSnapshot {
        WalletSnapshot {
            wallet_address: "0x4200000000000000000000000000000000000011".to_string(),
            last_block: last_block.to_string(),
            items: vec![],
        }
    }

    fn state() -> StreamState {
        StreamState::new(&HistoryConfig::default())
    }

    #[test]
    fn test_block_latency_is_exact_interarrival() {
        let mut state = state();
        let t0 = Instant::now();

        state.apply_block(block("1"), t0);
        assert_eq!(state.snapshot().block_refresh_ms, None);

        state.apply_block(block("2"), t0 + Duration::from_millis(750));
        assert_eq!(state.snapshot().block_refresh_ms, Some(750));
    }

    #[test]
    fn test_repeated_block_number_is_ignored() {
        let mut state = state();
        let t0 = Instant::now();

        state.apply_block(block("1"), t0);
        state.apply_block(block("1"), t0 + Duration::from_millis(500));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.block_history.len(), 1);
        assert_eq!(snapshot.block_refresh_ms, None);
        assert_eq!(snapshot.metrics.events_applied, 1);
    }

    #[test]
    fn test_block_history_caps_at_capacity() {
        let mut state = state();
        let t0 = Instant::now();
        for n in 1..=8 {
            state.apply_block(block(&n.to_string()), t0 + Duration::from_millis(n));
        }

        let snapshot = state.snapshot();
        assert_eq!(snapshot.block_history.len(), 5);
        let numbers: Vec<&str> = snapshot
            .block_history
            .iter()
            .map(|b| b.number.as_str())
            .collect();
        assert_eq!(numbers, vec!["8", "7", "6", "5", "4"]);
    }

    #[test]
    fn test_block_history_has_no_duplicate_numbers() {
        let mut state = state();
        let t0 = Instant::now();
        state.apply_block(block("1"), t0);
        state.apply_block(block("2"), t0 + Duration::from_millis(1));
        // drop back to an old number, then forward again
        state.apply_block(block("1"), t0 + Duration::from_millis(2));

        let snapshot = state.snapshot();
        let numbers: Vec<&str> = snapshot
            .block_history
            .iter()
            .map(|b| b.number.as_str())
            .collect();
        assert_eq!(numbers, vec!["1", "2"]);
    }

    #[test]
    fn test_diff_history_caps_without_dedup() {
        let mut state = state();
        for _ in 0..25 {
            state.apply_diff(diff("42"));
        }
        assert_eq!(state.snapshot().diff_history.len(), 20);
    }

    #[test]
    fn test_wallet_replaced_wholesale() {
        let mut state = state();
        let t0 = Instant::now();

        let mut first = wallet("10");
        first.items.push(basestream_core::TokenBalance {
            balance: "1".to_string(),
            balance_pretty: "1".to_string(),
            is_native: true,
            quote_rate_usd: None,
            quote_usd: None,
            metadata: basestream_core::TokenMetadata {
                contract_name: "Ether".to_string(),
                contract_ticker_symbol: "ETH".to_string(),
                contract_address: "0xee".to_string(),
                contract_decimals: 18,
            },
        });
        state.apply_wallet(first, t0);

        let second = wallet("11");
        state.apply_wallet(second.clone(), t0 + Duration::from_millis(200));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.wallet, Some(second));
        assert_eq!(snapshot.wallet_refresh_ms, Some(200));
    }

    #[test]
    fn test_status_error_then_reconnect_counts() {
        let mut state = state();

        state.set_status(FeedId::Blocks, ConnectionStatus::Connecting, None);
        assert_eq!(state.metrics().reconnections, 0);

        state.set_status(
            FeedId::Blocks,
            ConnectionStatus::Error,
            Some("boom".to_string()),
        );
        assert_eq!(state.health(FeedId::Blocks).error.as_deref(), Some("boom"));

        state.set_status(FeedId::Blocks, ConnectionStatus::Connecting, None);
        assert_eq!(state.metrics().reconnections, 1);
        // message survives until the next successful connect
        assert_eq!(state.health(FeedId::Blocks).error.as_deref(), Some("boom"));

        state.set_status(FeedId::Blocks, ConnectionStatus::Connected, None);
        assert_eq!(state.health(FeedId::Blocks).error, None);
    }

    #[test]
    fn test_wallet_survives_reconnect_cycle() {
        let mut state = state();
        state.apply_wallet(wallet("10"), Instant::now());

        state.set_status(
            FeedId::Balances,
            ConnectionStatus::Error,
            Some("stream error".to_string()),
        );
        state.set_status(FeedId::Balances, ConnectionStatus::Connecting, None);
        state.set_status(FeedId::Balances, ConnectionStatus::Connected, None);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.wallet, Some(wallet("10")));
        assert_eq!(snapshot.balances_health.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.metrics.reconnections, 1);
    }

    #[test]
    fn test_feeds_have_independent_health() {
        let mut state = state();
        state.set_status(FeedId::Blocks, ConnectionStatus::Connected, None);
        state.set_status(
            FeedId::Balances,
            ConnectionStatus::Error,
            Some("down".to_string()),
        );

        let snapshot = state.snapshot();
        assert_eq!(snapshot.blocks_health.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.balances_health.status, ConnectionStatus::Error);
    }

    #[test]
    fn test_decode_failure_leaves_status_and_block_alone() {
        let mut state = state();
        let t0 = Instant::now();
        state.set_status(FeedId::Blocks, ConnectionStatus::Connected, None);
        state.apply_block(block("1"), t0);

        state.record_decode_failure(FeedId::Blocks, &DecodeError::MissingField("diff"));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.blocks_health.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.block, Some(block("1")));
        assert_eq!(snapshot.metrics.decode_errors, 1);
        assert!(snapshot.blocks_health.error.is_some());
    }

    #[test]
    fn test_wallet_lagging_and_display_block() {
        let mut state = state();
        let t0 = Instant::now();

        state.apply_wallet(wallet("10"), t0);
        state.apply_block(block("12"), t0);
        let snapshot = state.snapshot();
        assert!(snapshot.wallet_lagging());
        assert_eq!(snapshot.display_last_block(), Some("12".to_string()));

        state.apply_wallet(wallet("12"), t0 + Duration::from_millis(1));
        let snapshot = state.snapshot();
        assert!(!snapshot.wallet_lagging());
        assert_eq!(snapshot.display_last_block(), Some("12".to_string()));
    }

    #[test]
    fn test_lagging_is_false_without_both_sides() {
        let mut state = state();
        assert!(!state.snapshot().wallet_lagging());
        assert_eq!(state.snapshot().display_last_block(), None);

        state.apply_wallet(wallet("10"), Instant::now());
        assert!(!state.snapshot().wallet_lagging());
        assert_eq!(
            state.snapshot().display_last_block(),
            Some("10".to_string())
        );
    }
}
