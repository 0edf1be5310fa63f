//! Application layer: governor, collector, aggregator and the pipeline facade
//!
//! Everything here is driven by `tick()` calls from the scheduler hook and
//! holds no work state of its own beyond caches; the durable queue is the
//! source of truth.

pub mod aggregator;
pub mod collector;
pub mod pipeline;
pub mod query_cache;
pub mod resource_governor;

pub use aggregator::{
    AggregatorTick, AppliedBatch, BucketState, DimensionList, DimensionQuery, DimensionVolume, ProgressiveAggregator,
    RebuildDeferral, RebuildOutcome, RebuildScope, TrendPoint, TrendQuery, TrendResult, VolumeQuery, VolumeRanking,
};
pub use collector::{BatchCommit, BatchRun, CollectorTick, IncrementalCollector};
pub use pipeline::{MaintenanceReport, Pipeline, PipelineHealth, PipelineTick};
pub use query_cache::{QueryCache, Versioned};
pub use resource_governor::{Admission, ResourceGovernor};
