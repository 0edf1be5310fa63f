//! System load values consumed by the resource governor

use std::fmt;

use serde::{Deserialize, Serialize};

/// One sample of live system load
///
/// Produced by an injectable [`SystemSampler`](crate::domain::services::SystemSampler)
/// and threaded through governor calls instead of being read from globals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub cpu_percent: f32,
    pub mem_available_bytes: u64,
    pub on_battery: bool,
    pub idle_seconds: u64,
}

impl SystemState {
    /// An unloaded machine on mains power that has been idle for an hour
    pub const fn relaxed() -> Self {
        Self {
            cpu_percent: 5.0,
            mem_available_bytes: 8 * 1024 * 1024 * 1024,
            on_battery: false,
            idle_seconds: 3600,
        }
    }
}

/// Throttling level derived from a [`SystemState`]; never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingTier {
    Paused,
    Minimal,
    Reduced,
    Full,
}

impl OperatingTier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Minimal => "minimal",
            Self::Reduced => "reduced",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for OperatingTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work asking the governor for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Scrape,
    Aggregate,
}

/// Coarse hardware class used to pick conservative defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceProfile {
    Low,
    Medium,
    High,
}

const GIB: u64 = 1024 * 1024 * 1024;

impl PerformanceProfile {
    pub fn estimate(total_memory_bytes: u64, cores: usize) -> Self {
        if total_memory_bytes >= 8 * GIB && cores >= 4 {
            Self::High
        } else if total_memory_bytes >= 4 * GIB && cores >= 2 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Queryable capability snapshot of the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCapabilities {
    pub total_memory_bytes: u64,
    pub cpu_cores: usize,
    pub os_name: Option<String>,
    pub profile: PerformanceProfile,
}
