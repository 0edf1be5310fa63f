//! Error taxonomy for the collection and aggregation pipeline
//!
//! Listing-level failures never abort a batch, batch-level failures abort only
//! their task, and storage failures abort only the enclosing transaction.

use thiserror::Error;

use crate::domain::snapshot::BucketKey;
use crate::domain::system::OperatingTier;

/// Failure reported by the external fetcher for a single call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Worth retrying within the same batch
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The whole page or source is unreachable
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("fetch timed out after {0} ms")]
    Timeout(u64),
}

impl FetchError {
    pub fn is_page_level(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_))
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("storage I/O error: {0}")]
    StorageIo(String),

    /// Deferral signal from the governor, never surfaced as a failed tick
    #[error("resource denied in tier {0}")]
    ResourceDenied(OperatingTier),

    #[error("corrupt snapshot for bucket {0}")]
    CorruptSnapshot(BucketKey),

    #[error("invalid listing record: {0}")]
    InvalidRecord(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid task transition: {0}")]
    InvalidTransition(String),
}

impl PipelineError {
    /// Whether the scheduler hook should treat this as a failed tick
    pub fn is_failed_tick(&self) -> bool {
        !matches!(self, Self::ResourceDenied(_) | Self::Cancelled)
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(msg) => Self::TransientFetch(msg),
            FetchError::Timeout(ms) => Self::TransientFetch(format!("timed out after {ms} ms")),
            FetchError::SourceUnavailable(msg) => Self::SourceUnavailable(msg),
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageIo(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::StorageIo(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
