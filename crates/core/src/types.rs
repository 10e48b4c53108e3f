//! Core type definitions

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The two upstream connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedId {
    Blocks,
    Balances,
}

impl FeedId {
    pub fn name(&self) -> &'static str {
        match self {
            FeedId::Blocks => "blocks",
            FeedId::Balances => "balances",
        }
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl ConnectionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Status plus the last error message for one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub error: Option<String>,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            error: None,
        }
    }
}

/// A decoded block header from the raw feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    /// Block number in decimal string form
    pub number: String,
    pub hash: String,
    /// Local time of day the block was produced (or received)
    pub timestamp: String,
    pub payload_id: Option<String>,
}

impl BlockEvent {
    /// Log-friendly hash: first 10 and last 8 characters
    pub fn short_hash(&self) -> String {
        let len = self.hash.chars().count();
        if len <= 18 {
            return self.hash.clone();
        }
        let head: String = self.hash.chars().take(10).collect();
        let tail: String = self.hash.chars().skip(len - 8).collect();
        format!("{}...{}", head, tail)
    }
}

/// One raw-feed diff section, recorded for every message that carries one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub block_number: String,
    pub diff: Value,
    pub payload_id: Option<String>,
    /// RFC 3339 UTC arrival time
    pub timestamp: String,
}

/// Full token-balance snapshot for the watched wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub wallet_address: String,
    pub last_block: String,
    pub items: Vec<TokenBalance>,
}

/// A single token position within a wallet snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub balance: String,
    pub balance_pretty: String,
    pub is_native: bool,
    /// Absent for tokens the upstream service cannot price
    #[serde(default)]
    pub quote_rate_usd: Option<f64>,
    #[serde(default)]
    pub quote_usd: Option<f64>,
    pub metadata: TokenMetadata,
}

/// Contract identity for a token position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub contract_name: String,
    pub contract_ticker_symbol: String,
    pub contract_address: String,
    pub contract_decimals: u8,
}
