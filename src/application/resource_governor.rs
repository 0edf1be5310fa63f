//! Resource governor
//!
//! Maps a live [`SystemState`] onto an [`OperatingTier`] and answers admission
//! questions. Sampling never fails the caller: an error or a timeout degrades
//! to tier `reduced`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::services::SystemSampler;
use crate::domain::system::{OperatingTier, SystemState, WorkKind};
use crate::infrastructure::config::GovernorConfig;

/// Tier reported when no trustworthy sample is available
pub const FALLBACK_TIER: OperatingTier = OperatingTier::Reduced;

/// Pure tier derivation
pub fn tier(state: &SystemState, policy: &GovernorConfig) -> OperatingTier {
    if state.on_battery && !policy.allow_on_battery {
        return OperatingTier::Paused;
    }
    if state.idle_seconds < policy.idle_seconds_required {
        return OperatingTier::Paused;
    }
    if state.cpu_percent > policy.cpu_threshold_paused {
        return OperatingTier::Paused;
    }
    if state.cpu_percent > policy.cpu_threshold_minimal {
        return OperatingTier::Minimal;
    }
    if state.cpu_percent > policy.cpu_threshold_reduced || state.mem_available_bytes < policy.mem_floor_bytes {
        return OperatingTier::Reduced;
    }
    OperatingTier::Full
}

/// Whether `tier` lets `kind` run at all
pub fn admits(tier: OperatingTier, kind: WorkKind) -> bool {
    match tier {
        OperatingTier::Paused => false,
        OperatingTier::Minimal => kind == WorkKind::Aggregate,
        OperatingTier::Reduced | OperatingTier::Full => true,
    }
}

/// Admission decision with the batch size the caller may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    pub tier: OperatingTier,
    pub batch_size: usize,
}

impl Admission {
    pub fn decide(tier: OperatingTier, kind: WorkKind, requested: usize, divisor: usize) -> Self {
        let admitted = admits(tier, kind);
        let batch_size = match tier {
            OperatingTier::Full => requested,
            _ if !admitted => 0,
            _ => (requested / divisor.max(1)).max(1),
        };
        Self {
            admitted,
            tier,
            batch_size,
        }
    }
}

pub struct ResourceGovernor {
    sampler: Arc<dyn SystemSampler>,
    policy: GovernorConfig,
}

impl ResourceGovernor {
    pub fn new(sampler: Arc<dyn SystemSampler>, policy: GovernorConfig) -> Self {
        Self { sampler, policy }
    }

    pub fn policy(&self) -> &GovernorConfig {
        &self.policy
    }

    /// Sample within the configured timeout; `None` when unavailable
    pub async fn sample(&self) -> Option<SystemState> {
        match tokio::time::timeout(self.policy.sample_timeout(), self.sampler.sample()).await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(err)) => {
                warn!("System sampling failed, assuming tier {}: {:#}", FALLBACK_TIER, err);
                None
            }
            Err(_) => {
                warn!(
                    "System sampling timed out after {} ms, assuming tier {}",
                    self.policy.sample_timeout_ms, FALLBACK_TIER
                );
                None
            }
        }
    }

    pub async fn current_tier(&self) -> OperatingTier {
        let tier = self
            .sample()
            .await
            .map_or(FALLBACK_TIER, |state| tier(&state, &self.policy));
        debug!(%tier, "Current operating tier");
        tier
    }

    pub async fn admit(&self, kind: WorkKind) -> bool {
        admits(self.current_tier().await, kind)
    }

    pub async fn admission(&self, kind: WorkKind, requested_batch: usize) -> Admission {
        let tier = self.current_tier().await;
        Admission::decide(tier, kind, requested_batch, self.policy.reduced_batch_divisor)
    }

    /// Intensive ticks are worth starting only in tiers `full` and `reduced`
    pub async fn is_idle_safe_to_run(&self) -> bool {
        matches!(self.current_tier().await, OperatingTier::Full | OperatingTier::Reduced)
    }
}
