//! Core types and utilities for the basestream aggregator
//!
//! This crate provides shared types used across all components:
//! - Domain events for the two upstream feeds (blocks, balances)
//! - The bounded rolling-history container
//! - Connection status and health
//! - Configuration and error taxonomy

pub mod config;
pub mod errors;
pub mod history;
pub mod types;

pub use config::*;
pub use errors::*;
pub use history::*;
pub use types::*;
