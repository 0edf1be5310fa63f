//! 파이프라인 도메인 상수들
//!
//! Defaults shared by configuration, storage and the runner binary.

/// Governor thresholds
pub mod resource {
    pub const CPU_THRESHOLD_REDUCED: f32 = 60.0;
    pub const CPU_THRESHOLD_MINIMAL: f32 = 80.0;
    pub const CPU_THRESHOLD_PAUSED: f32 = 90.0;
    pub const MEM_FLOOR_BYTES: u64 = 256 * 1024 * 1024;
    pub const SAMPLE_TIMEOUT_MS: u64 = 2_000;
    /// Batch size in tier `reduced` is `batch_size / divisor`, never below 1
    pub const REDUCED_BATCH_DIVISOR: usize = 4;
}

/// Collector limits
pub mod collector {
    pub const DEFAULT_BATCH_SIZE: usize = 50;
    pub const FETCH_TIMEOUT_MS: u64 = 15_000;
    pub const LISTING_RETRY_ATTEMPTS: u32 = 2;
    pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 5;
    pub const FETCH_RATE_PER_MINUTE: u32 = 120;
    pub const SWEEP_INTERVAL_HOURS: u64 = 24;
    /// Page token a fresh sweep starts from
    pub const SWEEP_START_TOKEN: &str = "0";
}

/// Work queue retry policy
pub mod queue {
    pub const MAX_ATTEMPTS: u32 = 5;
    pub const BACKOFF_BASE_SECONDS: u64 = 30;
    pub const BACKOFF_CAP_SECONDS: u64 = 3_600;
    pub const LIVENESS_TIMEOUT_SECONDS: u64 = 600;
    pub const FINISHED_TASK_RETENTION_DAYS: u32 = 7;
}

/// Listing store footprint
pub mod store {
    pub const DATABASE_FILE_NAME: &str = "car_market.db";
    pub const RETENTION_DAYS: u32 = 90;
    pub const COMPRESSION_LEVEL: i32 = 3;
    pub const MAX_SIZE_MB: u64 = 500;
    pub const VACUUM_THRESHOLD: f64 = 0.2;
}

/// Aggregation and query caching
pub mod aggregator {
    pub const CACHE_CAPACITY: usize = 64;
    pub const CACHE_TTL_MINUTES: u64 = 60;
    pub const REBUILD_PAGE_SIZE: usize = 500;
}

/// Keys of the `pipeline_meta` table
pub mod meta_keys {
    pub const SNAPSHOT_VERSION: &str = "snapshot_version";
    pub const SWEEP_STARTED_AT: &str = "sweep_started_at";
    pub const SWEEP_COMPLETED_AT: &str = "sweep_completed_at";
    pub const LAST_SNAPSHOT_AT: &str = "last_snapshot_at";
    /// Rebuild scopes that were deferred and still need to run
    pub const PENDING_REBUILDS: &str = "pending_rebuilds";
}
