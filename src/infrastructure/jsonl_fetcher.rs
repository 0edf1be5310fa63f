//! Fetcher over a JSON Lines export of the external page parser
//!
//! One raw listing object per line. The page token is the byte offset of the
//! line, so a sweep can resume from any committed cursor without re-reading
//! the file from the start.

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::trace;

use crate::domain::errors::FetchError;
use crate::domain::listing::RawListing;
use crate::domain::services::{FetchResponse, Fetcher};

pub struct JsonLinesFetcher {
    path: PathBuf,
}

impl JsonLinesFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Fetcher for JsonLinesFetcher {
    async fn fetch(&self, page_token: &str) -> Result<FetchResponse, FetchError> {
        let offset: u64 = page_token
            .parse()
            .map_err(|_| FetchError::SourceUnavailable(format!("invalid page token '{page_token}'")))?;

        let mut file = File::open(&self.path)
            .await
            .map_err(|e| FetchError::SourceUnavailable(format!("{}: {e}", self.path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?
            .len();
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let mut reader = BufReader::new(file);
        let mut position = offset;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| FetchError::Transient(e.to_string()))?;
            position += read as u64;
            if read == 0 || !line.trim_ascii().is_empty() {
                break;
            }
        }

        let next_page_token = (position < len).then(|| position.to_string());
        if line.trim_ascii().is_empty() {
            return Ok(FetchResponse::failure(
                FetchError::Transient("no record at end of source".to_string()),
                None,
            ));
        }

        trace!(offset, next = ?next_page_token, "Read listing line");
        // A bad line fails its own record only; the next token still moves past it
        let record = std::str::from_utf8(&line)
            .map_err(|e| FetchError::Transient(format!("record at offset {offset} is not UTF-8: {e}")))
            .and_then(|text| {
                serde_json::from_str::<RawListing>(text.trim())
                    .map_err(|e| FetchError::Transient(format!("malformed record at offset {offset}: {e}")))
            });
        Ok(FetchResponse {
            record,
            next_page_token,
        })
    }
}
