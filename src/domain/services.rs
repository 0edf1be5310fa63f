//! Collaborator contracts
//!
//! The core never parses marketplace pages or talks to the OS directly; both
//! arrive through these traits so tests can substitute deterministic fakes.

use async_trait::async_trait;

use crate::domain::errors::FetchError;
use crate::domain::listing::RawListing;
use crate::domain::system::SystemState;

/// Result of one fetcher call
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    /// The record at the requested token, or why it could not be read
    pub record: Result<RawListing, FetchError>,
    /// Token of the following record; `None` means the source is exhausted
    pub next_page_token: Option<String>,
}

impl FetchResponse {
    pub fn listing(raw: RawListing, next_page_token: Option<String>) -> Self {
        Self {
            record: Ok(raw),
            next_page_token,
        }
    }

    pub fn failure(error: FetchError, next_page_token: Option<String>) -> Self {
        Self {
            record: Err(error),
            next_page_token,
        }
    }
}

/// Hands back one raw listing per page token
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// An `Err` means the page itself could not be reached; a per-listing
    /// problem is reported inside [`FetchResponse::record`] so the collector can
    /// skip past it.
    async fn fetch(&self, page_token: &str) -> Result<FetchResponse, FetchError>;
}

/// Produces live [`SystemState`] samples
#[async_trait]
pub trait SystemSampler: Send + Sync {
    async fn sample(&self) -> anyhow::Result<SystemState>;
}
