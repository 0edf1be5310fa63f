//! Compact on-disk encodings: zstd-compressed JSON blobs and millisecond timestamps

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::errors::{PipelineError, PipelineResult};

pub fn compress_json<T: Serialize + ?Sized>(value: &T, level: i32) -> PipelineResult<Vec<u8>> {
    let raw = serde_json::to_vec(value)?;
    zstd::encode_all(&raw[..], level)
        .map_err(|e| PipelineError::Serialization(format!("zstd encode failed: {e}")))
}

pub fn decompress_json<T: DeserializeOwned>(data: &[u8]) -> PipelineResult<T> {
    let raw = zstd::decode_all(data)
        .map_err(|e| PipelineError::Serialization(format!("zstd decode failed: {e}")))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Current time at the precision the store keeps
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(millis: i64) -> PipelineResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| PipelineError::Serialization(format!("timestamp {millis} out of range")))
}
