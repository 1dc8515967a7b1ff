//! Text codec for structured payloads and timestamps.
//!
//! Job arguments, results, notes, parent lists, worker status, and worker
//! inboxes are stored as canonical JSON text; everything goes through
//! `serde_json` on the way in and out, so only well-formed data reaches the
//! database. Timestamps are stored as fixed-width UTC text so the store can
//! compare them lexicographically, with offset arithmetic done in Rust.

use crate::error::{QueueError, Result};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

/// Storage format for timestamps. Fixed width (millisecond precision, zero
/// padded) keeps lexicographic order identical to chronological order.
const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Encode an instant as canonical timestamp text.
pub(crate) fn stamp(instant: DateTime<Utc>) -> String {
    instant.format(STAMP_FORMAT).to_string()
}

/// Decode canonical timestamp text back to an instant.
pub(crate) fn parse_stamp(text: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, STAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| QueueError::Timestamp(text.to_string()))
}

/// Shift an instant forward by a wall-clock duration.
pub(crate) fn forward(from: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    from + chrono::Duration::milliseconds(by.as_millis() as i64)
}

/// Shift an instant backward by a wall-clock duration.
pub(crate) fn rewind(from: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    from - chrono::Duration::milliseconds(by.as_millis() as i64)
}

/// Encode a payload as JSON text.
pub(crate) fn encode(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Encode a string map (notes, worker status) as a JSON object.
pub(crate) fn encode_map(map: &Map<String, Value>) -> Result<String> {
    Ok(serde_json::to_string(map)?)
}

/// Decode a JSON payload.
pub(crate) fn decode(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a JSON object into a string map.
pub(crate) fn decode_map(text: &str) -> Result<Map<String, Value>> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a JSON array of job or worker ids.
pub(crate) fn decode_ids(text: &str) -> Result<Vec<i64>> {
    Ok(serde_json::from_str(text)?)
}

/// Reject note keys that would collide with JSON path syntax.
pub(crate) fn validate_note_key(key: &str) -> Result<()> {
    if key.contains(['.', '[', ']']) {
        return Err(QueueError::InvalidNoteKey(key.to_string()));
    }
    Ok(())
}
