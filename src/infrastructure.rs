//! Infrastructure layer: storage, durable queue, system sampling, configuration and logging

pub mod codec;
pub mod config;
pub mod database_connection;
pub mod jsonl_fetcher;
pub mod listing_store;
pub mod logging;
pub mod retry_manager;
pub mod system_sampler;
pub mod work_queue;

pub use config::PipelineConfig;
pub use database_connection::DatabaseConnection;
pub use jsonl_fetcher::JsonLinesFetcher;
pub use listing_store::{ContributionFilter, ListingFilter, ListingStore, Page, PruneOutcome, UpsertOutcome};
pub use logging::{init_logging, init_logging_with_config, get_log_directory};
pub use system_sampler::{IdleSource, PowerSource, SysinfoSampler};
pub use work_queue::WorkQueue;
