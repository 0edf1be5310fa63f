//! Domain module - entities, value objects and collaborator contracts
//!
//! Nothing here touches storage or the runtime; infrastructure and application
//! layers build on these types.

pub mod constants;
pub mod errors;
pub mod listing;
pub mod services;
pub mod snapshot;
pub mod system;
pub mod task;

pub use errors::{FetchError, PipelineError, PipelineResult};
pub use listing::{Listing, ListingStatus, RawListing};
pub use services::{FetchResponse, Fetcher, SystemSampler};
pub use snapshot::{AggregateSnapshot, BucketKey, Contribution, Metric, MetricStats};
pub use system::{OperatingTier, PerformanceProfile, SystemCapabilities, SystemState, WorkKind};
pub use task::{NewTask, QueueStats, Task, TaskId, TaskKind, TaskState};
