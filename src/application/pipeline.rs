//! Pipeline facade
//!
//! Wires the store, queue, governor, collector and aggregator together and is
//! the one surface the scheduler hook and the display layer talk to.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::aggregator::{
    AggregatorTick, DimensionList, DimensionQuery, ProgressiveAggregator, RebuildOutcome, RebuildScope, TrendQuery,
    TrendResult, VolumeQuery, VolumeRanking,
};
use crate::application::collector::{CollectorTick, IncrementalCollector};
use crate::application::resource_governor::ResourceGovernor;
use crate::domain::constants::meta_keys;
use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::listing::{Listing, normalize_label};
use crate::domain::services::{Fetcher, SystemSampler};
use crate::domain::snapshot::{AggregateSnapshot, BucketKey};
use crate::domain::system::OperatingTier;
use crate::domain::task::{NewTask, TaskId, TaskKind};
use crate::infrastructure::codec::now;
use crate::infrastructure::config::PipelineConfig;
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::listing_store::{ListingFilter, ListingStore, Page, set_meta_time_in};
use crate::infrastructure::work_queue::{WorkQueue, enqueue_in, has_outstanding_in};

/// Outcome of one scheduler tick
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineTick {
    /// Scrape task seeded for a new sweep, if one was due
    pub sweep_started: Option<TaskId>,
    pub collector: CollectorTick,
    pub aggregator: AggregatorTick,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub listings_pruned: u64,
    pub makes_rebuilt: usize,
    /// Makes whose rebuild was deferred and stays scheduled
    pub makes_deferred: usize,
    pub tasks_purged: u64,
    pub vacuumed: bool,
}

/// What Display shows next to the numbers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineHealth {
    pub tier: OperatingTier,
    pub snapshot_version: i64,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    /// Tasks that exhausted their attempts
    pub stuck_tasks: u64,
    pub pending_tasks: u64,
    pub in_flight_tasks: u64,
    pub healthy: bool,
}

pub struct Pipeline {
    config: PipelineConfig,
    db: DatabaseConnection,
    store: ListingStore,
    queue: WorkQueue,
    governor: Arc<ResourceGovernor>,
    collector: IncrementalCollector,
    aggregator: ProgressiveAggregator,
    cancellation_token: CancellationToken,
}

impl Pipeline {
    /// Open the database at the configured location and assemble the pipeline
    pub async fn open(
        config: PipelineConfig,
        fetcher: Arc<dyn Fetcher>,
        sampler: Arc<dyn SystemSampler>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let path = config
            .store
            .resolved_database_path()
            .map_err(|e| PipelineError::Config(format!("{e:#}")))?;
        Self::open_at(&path, config, fetcher, sampler).await
    }

    pub async fn open_at(
        path: &Path,
        config: PipelineConfig,
        fetcher: Arc<dyn Fetcher>,
        sampler: Arc<dyn SystemSampler>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let db = DatabaseConnection::open(path).await?;
        let store = ListingStore::new(db.clone(), config.store.compression_level);
        let queue = WorkQueue::new(db.clone(), &config.queue);
        let governor = Arc::new(ResourceGovernor::new(sampler, config.governor.clone()));
        let cancellation_token = CancellationToken::new();

        let collector = IncrementalCollector::new(
            store.clone(),
            queue.clone(),
            Arc::clone(&governor),
            fetcher,
            config.collector.clone(),
        )
        .with_cancellation(cancellation_token.clone());
        let aggregator = ProgressiveAggregator::new(
            store.clone(),
            queue.clone(),
            Arc::clone(&governor),
            config.aggregator.clone(),
        )
        .with_cancellation(cancellation_token.clone());

        info!("Pipeline opened at {}", path.display());
        Ok(Self {
            config,
            db,
            store,
            queue,
            governor,
            collector,
            aggregator,
            cancellation_token,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn collector(&self) -> &IncrementalCollector {
        &self.collector
    }

    pub fn aggregator(&self) -> &ProgressiveAggregator {
        &self.aggregator
    }

    /// Stop new work at the next batch boundary
    pub fn cancel(&self) {
        info!("Pipeline cancellation requested");
        self.cancellation_token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub async fn is_idle_safe_to_run(&self) -> bool {
        self.governor.is_idle_safe_to_run().await
    }

    pub async fn current_tier(&self) -> OperatingTier {
        self.governor.current_tier().await
    }

    /// Seed a sweep if one is due, then run one collector and one aggregator unit
    pub async fn tick(&self) -> PipelineResult<PipelineTick> {
        if self.cancellation_token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let sweep_started = self.seed_sweep_if_due().await?;
        let collector = self.collector.tick().await?;
        let aggregator = self.aggregator.tick().await?;
        debug!(?collector, ?aggregator, "Pipeline tick finished");
        Ok(PipelineTick {
            sweep_started,
            collector,
            aggregator,
        })
    }

    async fn seed_sweep_if_due(&self) -> PipelineResult<Option<TaskId>> {
        let at = now();
        let interval = self.config.collector.sweep_interval();
        let last_started = self.store.get_meta_time(meta_keys::SWEEP_STARTED_AT).await?;
        if last_started.is_some_and(|started| at - started < interval) {
            return Ok(None);
        }
        self.start_sweep(at).await
    }

    /// Start a sweep now unless one is already running
    pub async fn schedule_sweep_now(&self) -> PipelineResult<Option<TaskId>> {
        self.start_sweep(now()).await
    }

    async fn start_sweep(&self, at: DateTime<Utc>) -> PipelineResult<Option<TaskId>> {
        let mut tx = self.db.begin_write().await?;
        if has_outstanding_in(tx.conn(), TaskKind::ScrapePage).await? {
            return Ok(None);
        }
        let task = NewTask::scrape_page(self.config.collector.start_token.clone());
        let id = enqueue_in(tx.conn(), &task, at).await?;
        set_meta_time_in(tx.conn(), meta_keys::SWEEP_STARTED_AT, at).await?;
        tx.commit().await?;
        info!(task_id = id, "Sweep started");
        Ok(Some(id))
    }

    /// Retention prune with rebuild of the affected makes, task purge and an occasional VACUUM
    pub async fn maintenance(&self) -> PipelineResult<MaintenanceReport> {
        let at = now();
        let mut report = MaintenanceReport::default();

        let retention = chrono::Duration::days(i64::from(self.config.store.retention_days));
        let pruned = self.store.prune(at - retention).await?;
        report.listings_pruned = pruned.removed;
        for make in pruned.affected_makes {
            let scope = RebuildScope::Make(make);
            self.aggregator.schedule_rebuild(scope.clone()).await?;
            match self.aggregator.rebuild(scope).await? {
                RebuildOutcome::Completed { .. } => report.makes_rebuilt += 1,
                RebuildOutcome::Deferred(_) => report.makes_deferred += 1,
            }
        }

        let finished_retention = chrono::Duration::days(i64::from(self.config.queue.finished_task_retention_days));
        report.tasks_purged = self.queue.purge_finished(at - finished_retention).await?;

        let version = self.store.snapshot_version().await?;
        let dropped = self.aggregator.purge_caches(version).await;
        if dropped > 0 {
            debug!("Dropped {} expired query cache entries", dropped);
        }

        if self.governor.current_tier().await == OperatingTier::Full {
            let size_mb = self.db.file_size_bytes().await / (1024 * 1024);
            let oversized = size_mb > self.config.store.max_size_mb;
            if oversized || fastrand::f64() < self.config.store.vacuum_threshold {
                info!(size_mb, oversized, "Vacuuming database");
                self.db.vacuum().await?;
                report.vacuumed = true;
            }
        }

        info!(?report, "Maintenance finished");
        Ok(report)
    }

    pub async fn health(&self) -> PipelineResult<PipelineHealth> {
        let tier = self.governor.current_tier().await;
        let stats = self.queue.stats().await?;
        let health = PipelineHealth {
            tier,
            snapshot_version: self.store.snapshot_version().await?,
            last_snapshot_at: self.store.get_meta_time(meta_keys::LAST_SNAPSHOT_AT).await?,
            stuck_tasks: stats.failed,
            pending_tasks: stats.pending,
            in_flight_tasks: stats.in_flight,
            healthy: tier != OperatingTier::Paused && stats.failed == 0,
        };
        if !health.healthy {
            warn!(?health, "Pipeline unhealthy");
        }
        Ok(health)
    }

    pub async fn snapshot_version(&self) -> PipelineResult<i64> {
        self.store.snapshot_version().await
    }

    pub async fn query_listings(&self, filter: &ListingFilter, page: Page) -> PipelineResult<Vec<Listing>> {
        self.store.query(filter, page).await
    }

    pub async fn read_snapshot(&self, key: &BucketKey) -> PipelineResult<Option<AggregateSnapshot>> {
        self.aggregator.read_snapshot(key).await
    }

    pub async fn trend(&self, query: &TrendQuery) -> PipelineResult<Arc<TrendResult>> {
        self.aggregator.trend(query).await
    }

    /// Most active makes and models over a window range
    pub async fn popular_makes_models(&self, query: &VolumeQuery) -> PipelineResult<Arc<VolumeRanking>> {
        self.aggregator.volume_ranking(query).await
    }

    pub async fn makes(&self) -> PipelineResult<Arc<DimensionList>> {
        self.aggregator.dimension_list(&DimensionQuery::Makes).await
    }

    /// Model labels of `make`; the make is normalized the way listings are
    pub async fn models_for_make(&self, make: &str) -> PipelineResult<Arc<DimensionList>> {
        let make = normalize_label(Some(make));
        self.aggregator.dimension_list(&DimensionQuery::Models(make)).await
    }

    /// Oldest and newest model year on record, optionally for one make or model
    pub async fn year_range(&self, make: Option<&str>, model: Option<&str>) -> PipelineResult<Option<(i32, i32)>> {
        let filter = ListingFilter {
            make: make.map(|m| normalize_label(Some(m))),
            model: model.map(|m| normalize_label(Some(m))),
            ..ListingFilter::default()
        };
        self.store.year_range(&filter).await
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}
