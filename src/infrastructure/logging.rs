//! Tracing subscriber setup for the pipeline and its runner
//!
//! - Console output and/or a file under `logs/` next to the executable
//! - Daily rolling or a single log file
//! - Optional JSON formatting for the file layer
//! - `RUST_LOG` overrides the configured level

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use lazy_static::lazy_static;
use tracing::{info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use crate::infrastructure::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "pipeline.log";

// Keeps the non-blocking writers flushing for the lifetime of the process
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

/// `logs/` beside the running binary, or beside the working directory as a fallback
pub fn get_log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    exe_dir.join("logs")
}

/// Install the subscriber with `LoggingConfig::default()`
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Build the level filter, keeping sqlx quiet unless TRACE was asked for
fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| anyhow!("Invalid log level '{}': {}", config.level, e))?;

    if !config.level.to_lowercase().contains("trace") {
        for directive in [
            "sqlx::query=warn",
            "sqlx::sqlite=warn",
            "tokio=info",
            "runtime=warn",
        ] {
            filter = filter.add_directive(directive.parse()?);
        }
        filter = filter.add_directive(format!("car_market_pipeline={}", config.level).parse()?);
    }

    Ok(filter)
}

/// Install the global subscriber; fails if neither console nor file output is enabled
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    if !config.file_output && !config.console_output {
        return Err(anyhow!("No logging output configured"));
    }

    let log_dir = config.log_dir.clone().unwrap_or_else(get_log_directory);
    let env_filter = build_env_filter(config)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.file_output {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;

        if config.auto_cleanup_logs {
            cleanup_old_logs(&log_dir, config.max_files)?;
        }

        let file_appender = if config.rolling.eq_ignore_ascii_case("daily") {
            rolling::daily(&log_dir, LOG_FILE_PREFIX)
        } else {
            rolling::never(&log_dir, LOG_FILE_PREFIX)
        };
        let (file_writer, file_guard) = non_blocking(file_appender);
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("Log guard registry poisoned"))?
            .push(file_guard);

        if config.json_format {
            layers.push(
                fmt::Layer::new()
                    .json()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_current_span(true)
                    .with_ansi(false)
                    .boxed(),
            );
        } else {
            layers.push(
                fmt::Layer::new()
                    .with_writer(file_writer)
                    .with_target(false)
                    .with_ansi(false)
                    .boxed(),
            );
        }
    }

    if config.console_output {
        layers.push(
            fmt::Layer::new()
                .with_writer(std::io::stdout)
                .with_target(false)
                .boxed(),
        );
    }

    Registry::default()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    info!("Pipeline logging ready");
    info!("Log directory: {:?}", log_dir);
    info!("Log level: {}", config.level);
    info!("JSON format: {}", config.json_format);
    info!("File output: {} (rolling: {})", config.file_output, config.rolling);

    Ok(())
}

/// Startup banner with build and platform details
pub fn log_system_info() {
    info!("=== Car Market Pipeline ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
}

/// Remove the oldest log files so that at most `max_files` remain
fn cleanup_old_logs(log_dir: &Path, max_files: u32) -> Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let mut log_files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if path.is_file() && is_log {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(max_files as usize) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove old log file {:?}: {}", path, e);
        } else {
            removed += 1;
        }
    }
    Ok(removed)
}
