//! Error types

use thiserror::Error;

/// Message decode errors
///
/// Decode failures drop the offending message; they never terminate the
/// connection that received it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(String),

    #[error("Binary frame is not valid UTF-8")]
    Utf8,

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid hex in {field}: {value}")]
    InvalidHex { field: &'static str, value: String },
}

/// Connection-level errors
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket connection failed: {0}")]
    ConnectFailed(String),

    #[error("Subscription handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Subscription error: {0}")]
    Subscription(String),
}

/// Result type aliases
pub type DecodeResult<T> = Result<T, DecodeError>;
pub type FeedResult<T> = Result<T, FeedError>;
