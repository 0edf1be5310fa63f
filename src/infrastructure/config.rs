//! Pipeline configuration
//!
//! Values are layered: compiled defaults, then an optional TOML/JSON file,
//! then `CARMARKET_*` environment variables (`__` separates nested keys, e.g.
//! `CARMARKET_GOVERNOR__CPU_THRESHOLD_PAUSED=85`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::constants::{aggregator, collector, queue, resource, store};
use crate::domain::errors::PipelineError;
use crate::domain::system::PerformanceProfile;

pub const APP_DIR_NAME: &str = "car-market-pipeline";
pub const ENV_PREFIX: &str = "CARMARKET";

/// 전체 파이프라인 설정
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub governor: GovernorConfig,
    pub collector: CollectorConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub aggregator: AggregatorConfig,
    pub logging: LoggingConfig,
}

/// Thresholds mapping a system sample onto an operating tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub cpu_threshold_reduced: f32,
    pub cpu_threshold_minimal: f32,
    pub cpu_threshold_paused: f32,
    pub mem_floor_bytes: u64,
    /// Intensive work waits until the user has been idle this long
    pub idle_seconds_required: u64,
    pub allow_on_battery: bool,
    pub sample_timeout_ms: u64,
    pub reduced_batch_divisor: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub batch_size: usize,
    pub fetch_timeout_ms: u64,
    /// Extra attempts for a listing that failed transiently
    pub listing_retry_attempts: u32,
    pub consecutive_failure_threshold: u32,
    pub fetch_rate_per_minute: u32,
    pub sweep_interval_hours: u64,
    pub start_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_cap_seconds: u64,
    /// Upper bound of random jitter added to each backoff; 0 disables it
    pub backoff_jitter_ms: u64,
    pub liveness_timeout_seconds: u64,
    pub finished_task_retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Falls back to the per-user data directory when unset
    pub database_path: Option<PathBuf>,
    pub retention_days: u32,
    pub compression_level: i32,
    pub max_size_mb: u64,
    /// Probability that a maintenance pass vacuums even below `max_size_mb`
    pub vacuum_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub cache_capacity: usize,
    pub cache_ttl_minutes: u64,
    pub rebuild_page_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// "daily" rotates at midnight, anything else writes a single file
    pub rolling: String,
    pub max_files: u32,
    pub auto_cleanup_logs: bool,
    /// Defaults to `logs/` next to the executable
    pub log_dir: Option<PathBuf>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_reduced: resource::CPU_THRESHOLD_REDUCED,
            cpu_threshold_minimal: resource::CPU_THRESHOLD_MINIMAL,
            cpu_threshold_paused: resource::CPU_THRESHOLD_PAUSED,
            mem_floor_bytes: resource::MEM_FLOOR_BYTES,
            idle_seconds_required: 0,
            allow_on_battery: false,
            sample_timeout_ms: resource::SAMPLE_TIMEOUT_MS,
            reduced_batch_divisor: resource::REDUCED_BATCH_DIVISOR,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: collector::DEFAULT_BATCH_SIZE,
            fetch_timeout_ms: collector::FETCH_TIMEOUT_MS,
            listing_retry_attempts: collector::LISTING_RETRY_ATTEMPTS,
            consecutive_failure_threshold: collector::CONSECUTIVE_FAILURE_THRESHOLD,
            fetch_rate_per_minute: collector::FETCH_RATE_PER_MINUTE,
            sweep_interval_hours: collector::SWEEP_INTERVAL_HOURS,
            start_token: collector::SWEEP_START_TOKEN.to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: queue::MAX_ATTEMPTS,
            backoff_base_seconds: queue::BACKOFF_BASE_SECONDS,
            backoff_cap_seconds: queue::BACKOFF_CAP_SECONDS,
            backoff_jitter_ms: 0,
            liveness_timeout_seconds: queue::LIVENESS_TIMEOUT_SECONDS,
            finished_task_retention_days: queue::FINISHED_TASK_RETENTION_DAYS,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            retention_days: store::RETENTION_DAYS,
            compression_level: store::COMPRESSION_LEVEL,
            max_size_mb: store::MAX_SIZE_MB,
            vacuum_threshold: store::VACUUM_THRESHOLD,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            cache_capacity: aggregator::CACHE_CAPACITY,
            cache_ttl_minutes: aggregator::CACHE_TTL_MINUTES,
            rebuild_page_size: aggregator::REBUILD_PAGE_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            rolling: "daily".to_string(),
            max_files: 7,
            auto_cleanup_logs: true,
            log_dir: None,
        }
    }
}

impl GovernorConfig {
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }
}

impl CollectorConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn sweep_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.sweep_interval_hours as i64)
    }
}

impl QueueConfig {
    pub fn liveness_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_timeout_seconds as i64)
    }
}

impl AggregatorConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_minutes * 60)
    }
}

impl StoreConfig {
    /// Explicit path, or `<data_local_dir>/car-market-pipeline/car_market.db`
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_local_dir().context("Failed to resolve local data directory")?;
        Ok(data_dir.join(APP_DIR_NAME).join(store::DATABASE_FILE_NAME))
    }
}

impl PipelineConfig {
    /// Default location of the configuration file
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to resolve config directory")?;
        Ok(config_dir.join(APP_DIR_NAME).join("pipeline.toml"))
    }

    /// Load defaults, then `path` (or the default file when present), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                info!("Loading pipeline configuration from {}", path.display());
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                let default_path = Self::default_config_path()?;
                debug!("Looking for optional configuration at {}", default_path.display());
                builder = builder.add_source(config::File::from(default_path).required(false));
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble pipeline configuration")?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize pipeline configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), PipelineError> {
        let g = &self.governor;
        if !(g.cpu_threshold_reduced <= g.cpu_threshold_minimal
            && g.cpu_threshold_minimal <= g.cpu_threshold_paused)
        {
            return Err(invalid(
                "cpu thresholds must satisfy reduced <= minimal <= paused",
            ));
        }
        if g.reduced_batch_divisor == 0 {
            return Err(invalid("reduced_batch_divisor must be greater than 0"));
        }
        if self.collector.batch_size == 0 {
            return Err(invalid("batch_size must be greater than 0"));
        }
        if self.collector.fetch_rate_per_minute == 0 {
            return Err(invalid("fetch_rate_per_minute must be greater than 0"));
        }
        if self.collector.consecutive_failure_threshold == 0 {
            return Err(invalid("consecutive_failure_threshold must be greater than 0"));
        }
        if self.queue.max_attempts == 0 {
            return Err(invalid("max_attempts must be greater than 0"));
        }
        if self.queue.backoff_cap_seconds < self.queue.backoff_base_seconds {
            return Err(invalid("backoff_cap_seconds cannot be below backoff_base_seconds"));
        }
        if self.queue.liveness_timeout_seconds == 0 {
            return Err(invalid("liveness_timeout_seconds must be greater than 0"));
        }
        if !(-7..=22).contains(&self.store.compression_level) {
            return Err(invalid("compression_level must be within -7..=22"));
        }
        if !(0.0..=1.0).contains(&self.store.vacuum_threshold) {
            return Err(invalid("vacuum_threshold must be within 0.0..=1.0"));
        }
        if self.aggregator.cache_capacity == 0 || self.aggregator.rebuild_page_size == 0 {
            return Err(invalid("cache_capacity and rebuild_page_size must be greater than 0"));
        }
        Ok(())
    }

    /// Scale work sizes down for weak hardware
    #[must_use]
    pub fn tuned_for(mut self, profile: PerformanceProfile) -> Self {
        match profile {
            PerformanceProfile::Low => {
                self.collector.batch_size = self.collector.batch_size.min(20);
                self.aggregator.cache_capacity = self.aggregator.cache_capacity.min(16);
                self.aggregator.rebuild_page_size = self.aggregator.rebuild_page_size.min(200);
            }
            PerformanceProfile::Medium => {
                self.aggregator.rebuild_page_size = self.aggregator.rebuild_page_size.min(500);
            }
            PerformanceProfile::High => {}
        }
        self
    }
}

fn invalid(message: &str) -> PipelineError {
    PipelineError::Config(message.to_string())
}
