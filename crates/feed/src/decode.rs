//! Pure decoders for inbound feed payloads
//!
//! Decoders validate the loosely-typed upstream JSON and return typed
//! events. They never panic; a malformed message costs one `DecodeError`
//! and nothing else.

use chrono::{Local, TimeZone, Utc};
use serde_json::Value;

use basestream_core::{BlockEvent, DecodeError, DecodeResult, DiffRecord, WalletSnapshot};

/// Parse one text frame into JSON
pub fn parse_payload(text: &str) -> DecodeResult<Value> {
    serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))
}

/// Turn a binary frame into text before JSON parsing
pub fn text_from_binary(bytes: Vec<u8>) -> DecodeResult<String> {
    String::from_utf8(bytes).map_err(|_| DecodeError::Utf8)
}

/// Decode a raw-feed message into a block header
///
/// Requires all three of `base`, `diff`, and `metadata`. The block number
/// arrives as a hex string and is carried on in decimal form.
pub fn decode_block(payload: &Value) -> DecodeResult<BlockEvent> {
    let base = payload
        .get("base")
        .ok_or(DecodeError::MissingField("base"))?;
    let diff = payload
        .get("diff")
        .ok_or(DecodeError::MissingField("diff"))?;
    if payload.get("metadata").is_none() {
        return Err(DecodeError::MissingField("metadata"));
    }

    let number_hex = base
        .get("block_number")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("base.block_number"))?;
    let number = parse_hex("base.block_number", number_hex)?;

    let hash = diff
        .get("block_hash")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("diff.block_hash"))?;

    let timestamp = match base.get("timestamp").and_then(Value::as_str) {
        Some(raw) => local_time_of_day(parse_hex("base.timestamp", raw)?),
        None => Local::now().format("%H:%M:%S").to_string(),
    };

    Ok(BlockEvent {
        number: number.to_string(),
        hash: hash.to_string(),
        timestamp,
        payload_id: payload_id(payload),
    })
}

/// Decode a raw-feed message into a diff record
///
/// Only `diff` and `metadata` are required, so diffs are captured even for
/// messages that repeat the current block number.
pub fn decode_diff_record(payload: &Value) -> DecodeResult<DiffRecord> {
    let diff = payload
        .get("diff")
        .ok_or(DecodeError::MissingField("diff"))?;
    let metadata = payload
        .get("metadata")
        .ok_or(DecodeError::MissingField("metadata"))?;

    let block_number = match metadata.get("block_number") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    Ok(DiffRecord {
        block_number,
        diff: diff.clone(),
        payload_id: payload_id(payload),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Decode a subscription `next` payload into a wallet snapshot
pub fn decode_wallet(payload: &Value) -> DecodeResult<WalletSnapshot> {
    let data = payload
        .get("data")
        .ok_or(DecodeError::MissingField("data"))?;
    let balances = data
        .get("tokenBalancesForWalletAddress")
        .ok_or(DecodeError::MissingField("data.tokenBalancesForWalletAddress"))?;

    serde_json::from_value(balances.clone()).map_err(|e| DecodeError::Json(e.to_string()))
}

fn payload_id(payload: &Value) -> Option<String> {
    payload
        .get("payload_id")
        .and_then(Value::as_str)
        .map(String::from)
}

fn parse_hex(field: &'static str, raw: &str) -> DecodeResult<u64> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u64::from_str_radix(digits, 16).map_err(|_| DecodeError::InvalidHex {
        field,
        value: raw.to_string(),
    })
}

/// Render Unix seconds as local time of day, falling back to the current
/// wall clock when the value is out of range
fn local_time_of_day(secs: u64) -> String {
    let parsed = i64::try_from(secs)
        .ok()
        .and_then(|s| Local.timestamp_opt(s, 0).single());
    match parsed {
        Some(at) => at.format("%H:%M:%S").to_string(),
        None => Local::now().format("%H:%M:%S").to_string(),
    }
}
