//! Live system load sampling through `sysinfo`
//!
//! CPU usage is a delta between two refreshes, so the sampler keeps one
//! `System` alive across calls. Power source and user idle time are
//! platform-specific and come from pluggable sources.

use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sysinfo::System;
use tracing::debug;

use crate::domain::services::SystemSampler;
use crate::domain::system::{PerformanceProfile, SystemCapabilities, SystemState};

/// Reports whether the machine currently runs on battery
pub trait PowerSource: Send + Sync {
    fn on_battery(&self) -> bool;
}

/// Reports seconds since the last user input
pub trait IdleSource: Send + Sync {
    fn idle_seconds(&self) -> u64;
}

/// Assumes mains power
#[derive(Debug, Clone, Copy, Default)]
pub struct AcPower;

impl PowerSource for AcPower {
    fn on_battery(&self) -> bool {
        false
    }
}

/// Reports a fixed idle time; the default of zero suits hosts without idle detection
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedIdle(pub u64);

impl IdleSource for FixedIdle {
    fn idle_seconds(&self) -> u64 {
        self.0
    }
}

struct SamplerState {
    system: System,
    primed: bool,
}

pub struct SysinfoSampler {
    state: Arc<Mutex<SamplerState>>,
    power: Arc<dyn PowerSource>,
    idle: Arc<dyn IdleSource>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self::with_sources(Arc::new(AcPower), Arc::new(FixedIdle::default()))
    }

    pub fn with_sources(power: Arc<dyn PowerSource>, idle: Arc<dyn IdleSource>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SamplerState {
                system: System::new(),
                primed: false,
            })),
            power,
            idle,
        }
    }

    /// Total memory, core count and the derived performance profile
    pub async fn capabilities(&self) -> anyhow::Result<SystemCapabilities> {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let mut guard = state.lock().map_err(|_| anyhow!("sampler state poisoned"))?;
            let sys = &mut guard.system;
            sys.refresh_memory();
            sys.refresh_cpu_usage();

            let total_memory_bytes = sys.total_memory();
            let cpu_cores = match sys.cpus().len() {
                0 => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
                n => n,
            };
            Ok(SystemCapabilities {
                total_memory_bytes,
                cpu_cores,
                os_name: System::long_os_version(),
                profile: PerformanceProfile::estimate(total_memory_bytes, cpu_cores),
            })
        })
        .await
        .context("capability sampling task failed")?
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemSampler for SysinfoSampler {
    async fn sample(&self) -> anyhow::Result<SystemState> {
        let state = Arc::clone(&self.state);
        let (cpu_percent, mem_available_bytes) = tokio::task::spawn_blocking(move || {
            let mut guard = state.lock().map_err(|_| anyhow!("sampler state poisoned"))?;
            if !guard.primed {
                guard.system.refresh_cpu_usage();
                std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
                guard.primed = true;
            }
            guard.system.refresh_cpu_usage();
            guard.system.refresh_memory();
            if guard.system.total_memory() == 0 {
                return Err(anyhow!("memory statistics unavailable"));
            }
            Ok::<_, anyhow::Error>((guard.system.global_cpu_usage(), guard.system.available_memory()))
        })
        .await
        .context("system sampling task failed")??;

        let sample = SystemState {
            cpu_percent,
            mem_available_bytes,
            on_battery: self.power.on_battery(),
            idle_seconds: self.idle.idle_seconds(),
        };
        debug!(?sample, "Sampled system load");
        Ok(sample)
    }
}
