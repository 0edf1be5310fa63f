//! Car Market Pipeline - resource-aware listing collection and trend aggregation
//!
//! Collects vehicle listings in small governed batches, keeps them in a local
//! SQLite store and maintains progressive per-model price and mileage
//! statistics without ever rescanning the full history during normal work.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{Pipeline, PipelineHealth, PipelineTick};
pub use domain::{PipelineError, PipelineResult};
pub use infrastructure::PipelineConfig;
