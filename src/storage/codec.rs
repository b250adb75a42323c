//! Point encoding for shard stores
//!
//! Key format: `[SERIES][0x00][TIMESTAMP ^ SIGN_BIT as u64 big-endian]`.
//! Flipping the sign bit makes byte order match signed numeric order, so a
//! series' points sit contiguously and ascend by timestamp. Series names may
//! not contain NUL, which keeps `cpu` from ever prefixing `cpu2`'s range.
//!
//! Value format: bincode of `(written_at, fields)`. `written_at` is the
//! coordinator's wall clock in nanoseconds, stamped once per client write, so
//! replicas that received writes in different orders agree on the winner.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SEPARATOR: u8 = 0x00;
const SIGN_BIT: u64 = 1 << 63;
const TIMESTAMP_LEN: usize = 8;

/// A single field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    /// Convert a JSON scalar
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(FieldValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(FieldValue::Int)
                .or_else(|| n.as_f64().map(FieldValue::Float)),
            serde_json::Value::String(s) => Some(FieldValue::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Float(f) => serde_json::json!(f),
            FieldValue::Int(i) => serde_json::json!(i),
            FieldValue::Bool(b) => serde_json::json!(b),
            FieldValue::Str(s) => serde_json::json!(s),
        }
    }
}

/// Field name → value, ordered for stable encoding
pub type Fields = BTreeMap<String, FieldValue>;

/// One timestamped observation of a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub series: String,
    pub timestamp: i64,
    pub fields: Fields,
}

impl SeriesPoint {
    pub fn new(series: impl Into<String>, timestamp: i64, fields: Fields) -> Self {
        Self {
            series: series.into(),
            timestamp,
            fields,
        }
    }

    /// Convenience for single-field points
    pub fn with_field(
        series: impl Into<String>,
        timestamp: i64,
        name: impl Into<String>,
        value: FieldValue,
    ) -> Self {
        let mut fields = Fields::new();
        fields.insert(name.into(), value);
        Self::new(series, timestamp, fields)
    }
}

/// A point as stored, with the version that decides last-write-wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedPoint {
    pub point: SeriesPoint,
    pub written_at: u64,
}

impl VersionedPoint {
    /// Whether this version replaces `other` for the same key
    pub fn supersedes(&self, other: &VersionedPoint) -> bool {
        self.written_at >= other.written_at
    }
}

/// Validate a series name (non-empty, no NUL)
pub fn validate_series(series: &str) -> Result<()> {
    if series.is_empty() {
        return Err(Error::InvalidRequest("series name cannot be empty".into()));
    }
    if series.as_bytes().contains(&SEPARATOR) {
        return Err(Error::InvalidRequest(
            "series name contains a NUL byte".into(),
        ));
    }
    Ok(())
}

/// Encode the store key for a series point
pub fn encode_key(series: &str, timestamp: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(series.len() + 1 + TIMESTAMP_LEN);
    key.extend_from_slice(series.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(&((timestamp as u64) ^ SIGN_BIT).to_be_bytes());
    key
}

/// Decode a store key into (series, timestamp)
pub fn decode_key(key: &[u8]) -> Result<(String, i64)> {
    if key.len() < TIMESTAMP_LEN + 1 {
        return Err(Error::Corrupted(format!("key too short: {} bytes", key.len())));
    }
    let split = key.len() - TIMESTAMP_LEN;
    if key[split - 1] != SEPARATOR {
        return Err(Error::Corrupted("missing series separator".into()));
    }
    let series = std::str::from_utf8(&key[..split - 1])
        .map_err(|_| Error::Corrupted("series name is not UTF-8".into()))?
        .to_string();
    let mut ts = [0u8; TIMESTAMP_LEN];
    ts.copy_from_slice(&key[split..]);
    let timestamp = (u64::from_be_bytes(ts) ^ SIGN_BIT) as i64;
    Ok((series, timestamp))
}

pub fn encode_value(fields: &Fields, written_at: u64) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(written_at, fields))?)
}

/// Decode a stored value into (written_at, fields)
pub fn decode_value(bytes: &[u8]) -> Result<(u64, Fields)> {
    bincode::deserialize(bytes).map_err(|e| Error::Corrupted(format!("bad field map: {}", e)))
}
