//! Configuration types

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Raw block feed endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFeedConfig {
    pub url: String,
}

impl Default for RawFeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://sepolia.flashblocks.base.org/ws".to_string(),
        }
    }
}

/// GraphQL subscription endpoint and query parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub url: String,
    pub wallet_address: String,
    pub chain_name: String,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            url: "wss://gr-staging-test.streaming.covalenthq.com/graphql".to_string(),
            wallet_address: "0x4200000000000000000000000000000000000011".to_string(),
            chain_name: "BASE_SEPOLIA_FLASHBLOCKS".to_string(),
        }
    }
}

/// Reconnect policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Fixed delay between attempts, no backoff
    pub delay_ms: u64,
    /// Consecutive failed attempts before the supervisor gives up
    pub retry_ceiling: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            retry_ceiling: 100,
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Rolling history capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub block_capacity: usize,
    pub diff_capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            block_capacity: 5,
            diff_capacity: 20,
        }
    }
}

/// Complete aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub raw_feed: RawFeedConfig,
    pub subscription: SubscriptionConfig,
    pub reconnect: ReconnectConfig,
    pub history: HistoryConfig,
    /// Coalescing window for throttled snapshot consumers
    pub display_throttle_ms: u64,
    /// Bound of the event channel between connections and the apply task
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            raw_feed: RawFeedConfig::default(),
            subscription: SubscriptionConfig::default(),
            reconnect: ReconnectConfig::default(),
            history: HistoryConfig::default(),
            display_throttle_ms: 100,
            channel_capacity: 1024,
        }
    }
}

impl StreamConfig {
    /// Load configuration with environment overrides applied over the defaults
    ///
    /// Absent or unparsable values fall back to the default for that key; the
    /// event channel capacity is clamped to at least one slot.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    ///
    /// `from_env` passes the process environment; tests pass literal maps.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            raw_feed: RawFeedConfig {
                url: lookup_string(&lookup, "BASESTREAM_RAW_FEED_URL", defaults.raw_feed.url),
            },
            subscription: SubscriptionConfig {
                url: lookup_string(
                    &lookup,
                    "BASESTREAM_SUBSCRIPTION_URL",
                    defaults.subscription.url,
                ),
                wallet_address: lookup_string(
                    &lookup,
                    "BASESTREAM_WALLET_ADDRESS",
                    defaults.subscription.wallet_address,
                ),
                chain_name: lookup_string(
                    &lookup,
                    "BASESTREAM_CHAIN_NAME",
                    defaults.subscription.chain_name,
                ),
            },
            reconnect: ReconnectConfig {
                delay_ms: lookup_parse(
                    &lookup,
                    "BASESTREAM_RECONNECT_DELAY_MS",
                    defaults.reconnect.delay_ms,
                ),
                retry_ceiling: lookup_parse(
                    &lookup,
                    "BASESTREAM_RETRY_CEILING",
                    defaults.reconnect.retry_ceiling,
                ),
            },
            history: HistoryConfig {
                block_capacity: lookup_parse(
                    &lookup,
                    "BASESTREAM_BLOCK_HISTORY",
                    defaults.history.block_capacity,
                ),
                diff_capacity: lookup_parse(
                    &lookup,
                    "BASESTREAM_DIFF_HISTORY",
                    defaults.history.diff_capacity,
                ),
            },
            display_throttle_ms: lookup_parse(
                &lookup,
                "BASESTREAM_DISPLAY_THROTTLE_MS",
                defaults.display_throttle_ms,
            ),
            // a zero-capacity event channel cannot be constructed
            channel_capacity: lookup_parse(
                &lookup,
                "BASESTREAM_CHANNEL_CAPACITY",
                defaults.channel_capacity,
            )
            .max(1),
        }
    }

    pub fn display_throttle(&self) -> Duration {
        Duration::from_millis(self.display_throttle_ms)
    }
}

fn lookup_string(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: String,
) -> String {
    lookup(key).unwrap_or(default)
}

fn lookup_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
