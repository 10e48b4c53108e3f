//! Live blockchain stream aggregation
//!
//! Features:
//! - Raw block-header feed over plain WebSocket
//! - Wallet token-balance feed over a graphql-transport-ws subscription
//! - Single-writer state store with watch-based snapshot broadcast
//! - Fixed-delay automatic reconnection with a retry ceiling
//! - Per-connection health and inter-arrival latency metrics

pub mod aggregator;
pub mod decode;
pub mod raw;
pub mod state;
pub mod subscription;
pub mod supervisor;

pub use aggregator::StreamAggregator;
pub use raw::BlockFeed;
pub use state::{FeedEvent, StreamSnapshot, StreamState};
pub use subscription::BalanceFeed;
pub use supervisor::{Connector, ReconnectPolicy, SessionEnd, Supervisor};
