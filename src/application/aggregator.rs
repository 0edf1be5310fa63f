//! Progressive aggregator
//!
//! Folds each committed batch of changed listings into per-bucket running
//! statistics. The snapshot writes, the aggregate task's `done` transition and
//! the global version bump share one write transaction, so a batch is counted
//! exactly once no matter how often its task is retried.
//!
//! The same transaction records one contribution row per changed listing.
//! `rebuild` walks those rows in governor-sized pages, skipping listings that
//! retention has removed, and replaces the snapshots of its scope wholesale.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::application::query_cache::{QueryCache, Versioned};
use crate::application::resource_governor::ResourceGovernor;
use crate::domain::constants::meta_keys;
use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::listing::Listing;
use crate::domain::snapshot::{AggregateSnapshot, BucketKey, Contribution, Metric, MetricStats, fold_contributions};
use crate::domain::system::{OperatingTier, WorkKind};
use crate::domain::task::{Task, TaskId, TaskKind, TaskState};
use crate::infrastructure::codec::{decompress_json, now};
use crate::infrastructure::config::AggregatorConfig;
use crate::infrastructure::listing_store::{
    ContributionFilter, ListingStore, bump_snapshot_version_in, delete_snapshot_in, get_meta_in, read_snapshot_in,
    record_contributions_in, set_meta_in, write_snapshot_in,
};
use crate::infrastructure::work_queue::{WorkQueue, commit_in, has_outstanding_in};

/// Idle bucket workers are dropped once the cache grows past this many entries
const WORKER_CACHE_LIMIT: usize = 4_096;

/// Lifecycle of one bucket inside this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Stale,
    Computing,
    Fresh,
}

type BucketWorker = Arc<Mutex<BucketState>>;

/// Portion of the snapshot table a rebuild recomputes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "target", rename_all = "snake_case")]
pub enum RebuildScope {
    All,
    /// Every bucket of one make, model buckets and the roll-up alike
    Make(String),
    Bucket(BucketKey),
}

impl RebuildScope {
    pub fn contains(&self, key: &BucketKey) -> bool {
        match self {
            Self::All => true,
            Self::Make(make) => key.make() == make,
            Self::Bucket(bucket) => bucket == key,
        }
    }

    /// Narrowest contribution filter that still covers every bucket of the scope
    fn contribution_filter(&self) -> ContributionFilter {
        match self {
            Self::All => ContributionFilter::default(),
            Self::Make(make) => ContributionFilter {
                make: Some(make.clone()),
                ..ContributionFilter::default()
            },
            Self::Bucket(key) => ContributionFilter {
                make: Some(key.make().to_string()),
                model: key.model().map(str::to_string),
                window: Some(key.window.clone()),
            },
        }
    }

    /// Whether `self` already covers `other`
    fn covers(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::All, _) => true,
            (Self::Make(make), Self::Bucket(key)) => key.make() == make,
            _ => self == other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildDeferral {
    Governor(OperatingTier),
    /// Aggregate tasks are still queued; they must land before a rebuild
    PendingAggregation,
    /// Snapshots changed while the scope was being scanned
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildOutcome {
    Completed {
        buckets_written: usize,
        buckets_removed: usize,
        snapshot_version: i64,
    },
    /// The scope stays scheduled and is retried by a later tick
    Deferred(RebuildDeferral),
}

/// Result of folding one aggregate task
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedBatch {
    pub task_id: TaskId,
    pub snapshots: Vec<AggregateSnapshot>,
    /// Buckets that failed verification and were scheduled for rebuild instead
    pub corrupt: Vec<BucketKey>,
    pub snapshot_version: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorTick {
    Deferred { tier: OperatingTier },
    Idle,
    Applied(AppliedBatch),
    Failed {
        task_id: TaskId,
        error: String,
        state: TaskState,
    },
    Rebuilt {
        scope: RebuildScope,
        outcome: RebuildOutcome,
    },
}

/// Trend over a range of ISO-week windows, both ends inclusive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrendQuery {
    pub metric: Metric,
    pub dimension: String,
    pub from_window: String,
    pub to_window: String,
}

impl TrendQuery {
    pub fn new(
        metric: Metric,
        dimension: impl Into<String>,
        from_window: impl Into<String>,
        to_window: impl Into<String>,
    ) -> Self {
        Self {
            metric,
            dimension: dimension.into(),
            from_window: from_window.into(),
            to_window: to_window.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub window: String,
    pub stats: MetricStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    pub points: Vec<TrendPoint>,
    /// Global snapshot version the points were read at
    pub snapshot_version: i64,
}

impl Versioned for TrendResult {
    fn snapshot_version(&self) -> i64 {
        self.snapshot_version
    }
}

/// Most active makes and models over a window range, both ends inclusive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeQuery {
    pub from_window: String,
    pub to_window: String,
    pub limit: usize,
}

impl VolumeQuery {
    pub fn new(from_window: impl Into<String>, to_window: impl Into<String>, limit: usize) -> Self {
        Self {
            from_window: from_window.into(),
            to_window: to_window.into(),
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionVolume {
    pub make: String,
    /// `None` for a make roll-up
    pub model: Option<String>,
    /// Contributions aggregated into the dimension over the range
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRanking {
    pub makes: Vec<DimensionVolume>,
    pub models: Vec<DimensionVolume>,
    pub snapshot_version: i64,
}

impl Versioned for VolumeRanking {
    fn snapshot_version(&self) -> i64 {
        self.snapshot_version
    }
}

/// Dimension labels Display can offer for selection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "list", content = "make", rename_all = "snake_case")]
pub enum DimensionQuery {
    Makes,
    Models(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionList {
    pub labels: Vec<String>,
    pub snapshot_version: i64,
}

impl Versioned for DimensionList {
    fn snapshot_version(&self) -> i64 {
        self.snapshot_version
    }
}

pub struct ProgressiveAggregator {
    store: ListingStore,
    queue: WorkQueue,
    governor: Arc<ResourceGovernor>,
    config: AggregatorConfig,
    trends: QueryCache<TrendQuery, TrendResult>,
    volumes: QueryCache<VolumeQuery, VolumeRanking>,
    dimensions: QueryCache<DimensionQuery, DimensionList>,
    workers: Mutex<HashMap<BucketKey, BucketWorker>>,
    cancellation_token: CancellationToken,
}

impl ProgressiveAggregator {
    pub fn new(store: ListingStore, queue: WorkQueue, governor: Arc<ResourceGovernor>, config: AggregatorConfig) -> Self {
        let (capacity, ttl) = (config.cache_capacity, config.cache_ttl());
        Self {
            store,
            queue,
            governor,
            config,
            trends: QueryCache::new(capacity, ttl),
            volumes: QueryCache::new(capacity, ttl),
            dimensions: QueryCache::new(capacity, ttl),
            workers: Mutex::new(HashMap::new()),
            cancellation_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Drop cached query results that can no longer be served
    pub async fn purge_caches(&self, current_version: i64) -> usize {
        self.trends.purge_expired(current_version).await
            + self.volumes.purge_expired(current_version).await
            + self.dimensions.purge_expired(current_version).await
    }

    /// Run one unit of aggregation work: a queued batch first, then a pending rebuild
    pub async fn tick(&self) -> PipelineResult<AggregatorTick> {
        let span = info_span!("aggregator_tick", task_id = tracing::field::Empty);
        self.tick_inner().instrument(span).await
    }

    async fn tick_inner(&self) -> PipelineResult<AggregatorTick> {
        if self.cancellation_token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let admission = self.governor.admission(WorkKind::Aggregate, self.config.rebuild_page_size).await;
        if !admission.admitted {
            debug!(tier = %admission.tier, "Aggregation deferred by governor");
            return Ok(AggregatorTick::Deferred { tier: admission.tier });
        }

        if let Some(task) = self.queue.claim(TaskKind::AggregateBatch).await? {
            tracing::Span::current().record("task_id", task.id);
            return match self.apply_batch(&task).await {
                Ok(applied) => Ok(AggregatorTick::Applied(applied)),
                Err(err) => {
                    let message = err.to_string();
                    warn!("Aggregate batch failed: {}", message);
                    let state = self.queue.fail(task.id, &message).await?;
                    if matches!(err, PipelineError::StorageIo(_)) {
                        return Err(err);
                    }
                    Ok(AggregatorTick::Failed {
                        task_id: task.id,
                        error: message,
                        state,
                    })
                }
            };
        }

        if let Some(scope) = self.pending_rebuilds().await?.into_iter().next() {
            let outcome = self.rebuild(scope.clone()).await?;
            return Ok(AggregatorTick::Rebuilt { scope, outcome });
        }

        Ok(AggregatorTick::Idle)
    }

    /// Merge the changed listings carried by a claimed aggregate task
    pub async fn apply_batch(&self, task: &Task) -> PipelineResult<AppliedBatch> {
        if task.kind != TaskKind::AggregateBatch {
            return Err(PipelineError::InvalidTransition(format!(
                "task {} is a {} task",
                task.id, task.kind
            )));
        }
        let payload = task.payload.as_deref().ok_or_else(|| {
            PipelineError::InvalidTransition(format!("task {} carries no payload", task.id))
        })?;
        let listings: Vec<Listing> = decompress_json(payload)?;
        let contributions: Vec<Contribution> = listings.iter().map(Contribution::of).collect();
        let delta = fold_contributions(&contributions);

        let mut guards = self.lock_buckets(delta.keys()).await;
        let result = self.write_batch(task.id, &contributions, &delta).await;
        let corrupt = result.as_ref().map_or(&[][..], |applied| applied.corrupt.as_slice());
        release_buckets(&mut guards, result.is_ok(), corrupt);

        let applied = result?;
        debug!(
            buckets = applied.snapshots.len(),
            corrupt = applied.corrupt.len(),
            version = applied.snapshot_version,
            "Applied aggregate batch"
        );
        Ok(applied)
    }

    async fn write_batch(
        &self,
        task_id: TaskId,
        contributions: &[Contribution],
        delta: &BTreeMap<BucketKey, MetricStats>,
    ) -> PipelineResult<AppliedBatch> {
        let at = now();
        let mut tx = self.store.db().begin_write().await?;

        let mut snapshots = Vec::with_capacity(delta.len());
        let mut corrupt = Vec::new();
        for (key, stats) in delta {
            let prior = match read_snapshot_in(tx.conn(), key).await {
                Ok(prior) => prior,
                Err(PipelineError::CorruptSnapshot(key)) => {
                    warn!(bucket = %key, "Skipping corrupt bucket, scheduling rebuild");
                    corrupt.push(key);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let (mut merged, prior_version) = prior.map_or((MetricStats::default(), 0), |s| (s.stats, s.version));
            merged.merge(stats);
            let mut snapshot = AggregateSnapshot::new(key.clone(), merged, Some(task_id));
            snapshot.version = prior_version;
            snapshots.push(write_snapshot_in(tx.conn(), &snapshot).await?);
        }

        // Fails for a task that is no longer in flight, rolling back the merge above
        commit_in(tx.conn(), task_id, at).await?;
        record_contributions_in(tx.conn(), task_id, contributions, at).await?;
        let snapshot_version = bump_snapshot_version_in(tx.conn(), at).await?;
        if !corrupt.is_empty() {
            let scopes: Vec<RebuildScope> = corrupt.iter().cloned().map(RebuildScope::Bucket).collect();
            add_pending_in(tx.conn(), &scopes).await?;
        }
        tx.commit().await?;

        Ok(AppliedBatch {
            task_id,
            snapshots,
            corrupt,
            snapshot_version,
        })
    }

    /// Persist `scope` so a later tick rebuilds it
    pub async fn schedule_rebuild(&self, scope: RebuildScope) -> PipelineResult<()> {
        let mut tx = self.store.db().begin_write().await?;
        add_pending_in(tx.conn(), std::slice::from_ref(&scope)).await?;
        tx.commit().await?;
        info!(?scope, "Rebuild scheduled");
        Ok(())
    }

    pub async fn pending_rebuilds(&self) -> PipelineResult<Vec<RebuildScope>> {
        let mut conn = self.store.db().pool().acquire().await?;
        load_pending_in(&mut conn).await
    }

    /// Recompute every bucket of `scope` from the recorded contributions of listings still stored
    pub async fn rebuild(&self, scope: RebuildScope) -> PipelineResult<RebuildOutcome> {
        let span = info_span!("rebuild", scope = ?scope);
        self.rebuild_inner(scope).instrument(span).await
    }

    async fn rebuild_inner(&self, scope: RebuildScope) -> PipelineResult<RebuildOutcome> {
        if self.queue.has_outstanding(TaskKind::AggregateBatch).await? {
            return self.defer_rebuild(scope, RebuildDeferral::PendingAggregation).await;
        }
        let start_version = self.store.snapshot_version().await?;

        let filter = scope.contribution_filter();
        let mut computed: BTreeMap<BucketKey, MetricStats> = BTreeMap::new();
        let mut after: Option<i64> = None;
        let mut scanned = 0usize;
        loop {
            if self.cancellation_token.is_cancelled() {
                self.schedule_rebuild(scope).await?;
                return Err(PipelineError::Cancelled);
            }
            let admission = self.governor.admission(WorkKind::Aggregate, self.config.rebuild_page_size).await;
            if !admission.admitted {
                return self.defer_rebuild(scope, RebuildDeferral::Governor(admission.tier)).await;
            }

            let page = self.store.scan_contributions(&filter, after, admission.batch_size).await?;
            scanned += page.len();
            for (key, stats) in fold_contributions(page.iter().map(|(_, contribution)| contribution)) {
                if scope.contains(&key) {
                    computed.entry(key).or_default().merge(&stats);
                }
            }
            if page.len() < admission.batch_size {
                break;
            }
            after = page.last().map(|(id, _)| *id);
        }

        let existing = match &scope {
            RebuildScope::All => self.store.snapshot_keys().await?,
            RebuildScope::Make(make) => self.store.snapshot_keys_for_make(make).await?,
            RebuildScope::Bucket(key) => vec![key.clone()],
        };
        let keys: BTreeSet<BucketKey> = existing.into_iter().chain(computed.keys().cloned()).collect();

        let mut guards = self.lock_buckets(keys.iter()).await;
        let result = self.write_rebuild(&scope, &keys, &computed, start_version).await;
        release_buckets(&mut guards, matches!(result, Ok(RebuildOutcome::Completed { .. })), &[]);

        if let Ok(RebuildOutcome::Completed {
            buckets_written,
            buckets_removed,
            snapshot_version,
        }) = &result
        {
            info!(
                scanned,
                buckets_written, buckets_removed, snapshot_version, "Rebuild completed"
            );
        }
        result
    }

    async fn write_rebuild(
        &self,
        scope: &RebuildScope,
        keys: &BTreeSet<BucketKey>,
        computed: &BTreeMap<BucketKey, MetricStats>,
        start_version: i64,
    ) -> PipelineResult<RebuildOutcome> {
        let at = now();
        let mut tx = self.store.db().begin_write().await?;

        let current_version = get_meta_in(tx.conn(), meta_keys::SNAPSHOT_VERSION)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let deferral = if has_outstanding_in(tx.conn(), TaskKind::AggregateBatch).await? {
            Some(RebuildDeferral::PendingAggregation)
        } else if current_version != start_version {
            Some(RebuildDeferral::Superseded)
        } else {
            None
        };
        if let Some(deferral) = deferral {
            add_pending_in(tx.conn(), std::slice::from_ref(scope)).await?;
            tx.commit().await?;
            debug!(?deferral, "Rebuild deferred before write");
            return Ok(RebuildOutcome::Deferred(deferral));
        }

        let mut buckets_written = 0;
        let mut buckets_removed = 0;
        for key in keys {
            let Some(stats) = computed.get(key) else {
                if delete_snapshot_in(tx.conn(), key).await? {
                    buckets_removed += 1;
                }
                continue;
            };
            let (prior_version, last_task_id) = match read_snapshot_in(tx.conn(), key).await {
                Ok(Some(prior)) => (prior.version, prior.last_task_id),
                Ok(None) | Err(PipelineError::CorruptSnapshot(_)) => (0, None),
                Err(err) => return Err(err),
            };
            let mut snapshot = AggregateSnapshot::new(key.clone(), *stats, last_task_id);
            snapshot.version = prior_version;
            write_snapshot_in(tx.conn(), &snapshot).await?;
            buckets_written += 1;
        }

        let snapshot_version = bump_snapshot_version_in(tx.conn(), at).await?;
        remove_pending_in(tx.conn(), scope).await?;
        tx.commit().await?;

        Ok(RebuildOutcome::Completed {
            buckets_written,
            buckets_removed,
            snapshot_version,
        })
    }

    async fn defer_rebuild(&self, scope: RebuildScope, deferral: RebuildDeferral) -> PipelineResult<RebuildOutcome> {
        debug!(?deferral, "Rebuild deferred");
        self.schedule_rebuild(scope).await?;
        Ok(RebuildOutcome::Deferred(deferral))
    }

    /// Read one bucket; a corrupt bucket is rebuilt before it is returned
    pub async fn read_snapshot(&self, key: &BucketKey) -> PipelineResult<Option<AggregateSnapshot>> {
        match self.store.read_snapshot(key).await {
            Err(PipelineError::CorruptSnapshot(_)) => {
                warn!(bucket = %key, "Corrupt snapshot on read, rebuilding bucket");
                match self.rebuild(RebuildScope::Bucket(key.clone())).await? {
                    RebuildOutcome::Completed { .. } => self.store.read_snapshot(key).await,
                    RebuildOutcome::Deferred(_) => Err(PipelineError::CorruptSnapshot(key.clone())),
                }
            }
            other => other,
        }
    }

    /// Trend points for a window range, served from the cache while still current
    ///
    /// Corrupt buckets are left out and scheduled for rebuild; such a partial
    /// result is not cached.
    pub async fn trend(&self, query: &TrendQuery) -> PipelineResult<Arc<TrendResult>> {
        let version = self.store.snapshot_version().await?;
        if let Some(hit) = self.trends.get(query, version).await {
            return Ok(hit);
        }

        let range = self
            .store
            .snapshots_in_range(query.metric, &query.dimension, &query.from_window, &query.to_window)
            .await?;
        let complete = range.corrupt.is_empty();
        for key in range.corrupt {
            self.schedule_rebuild(RebuildScope::Bucket(key)).await?;
        }

        let result = Arc::new(TrendResult {
            points: range
                .snapshots
                .into_iter()
                .map(|snapshot| TrendPoint {
                    window: snapshot.key.window,
                    stats: snapshot.stats,
                })
                .collect(),
            snapshot_version: version,
        });
        if complete {
            self.trends.put(query.clone(), Arc::clone(&result)).await;
        }
        Ok(result)
    }

    /// Makes and models ranked by how many contributions they received over the range
    ///
    /// A bucket's volume is its largest count across metrics, so a listing
    /// without a price still counts through its mileage.
    pub async fn volume_ranking(&self, query: &VolumeQuery) -> PipelineResult<Arc<VolumeRanking>> {
        let version = self.store.snapshot_version().await?;
        if let Some(hit) = self.volumes.get(query, version).await {
            return Ok(hit);
        }

        let range = self.store.snapshots_in_windows(&query.from_window, &query.to_window).await?;
        let complete = range.corrupt.is_empty();
        for key in range.corrupt {
            self.schedule_rebuild(RebuildScope::Bucket(key)).await?;
        }

        let mut per_window: BTreeMap<(String, String), u64> = BTreeMap::new();
        for snapshot in range.snapshots {
            let count = per_window.entry((snapshot.key.dimension, snapshot.key.window)).or_default();
            *count = (*count).max(snapshot.stats.count);
        }
        let mut per_dimension: BTreeMap<String, u64> = BTreeMap::new();
        for ((dimension, _), count) in per_window {
            *per_dimension.entry(dimension).or_default() += count;
        }

        let mut makes = Vec::new();
        let mut models = Vec::new();
        for (dimension, count) in per_dimension {
            let Some((make, model)) = dimension.split_once('/') else {
                continue;
            };
            let volume = DimensionVolume {
                make: make.to_string(),
                model: (model != "*").then(|| model.to_string()),
                count,
            };
            if volume.model.is_some() {
                models.push(volume);
            } else {
                makes.push(volume);
            }
        }
        for ranked in [&mut makes, &mut models] {
            // Stable sort keeps label order among equal counts
            ranked.sort_by(|a, b| b.count.cmp(&a.count));
            ranked.truncate(query.limit);
        }

        let result = Arc::new(VolumeRanking {
            makes,
            models,
            snapshot_version: version,
        });
        if complete {
            self.volumes.put(query.clone(), Arc::clone(&result)).await;
        }
        Ok(result)
    }

    /// Make labels, or the model labels of one make, that have snapshots
    pub async fn dimension_list(&self, query: &DimensionQuery) -> PipelineResult<Arc<DimensionList>> {
        let version = self.store.snapshot_version().await?;
        if let Some(hit) = self.dimensions.get(query, version).await {
            return Ok(hit);
        }

        let labels = match query {
            DimensionQuery::Makes => self
                .store
                .dimensions()
                .await?
                .into_iter()
                .filter_map(|dimension| dimension.strip_suffix("/*").map(str::to_string))
                .collect(),
            DimensionQuery::Models(make) => self
                .store
                .dimensions_for_make(make)
                .await?
                .into_iter()
                .filter_map(|dimension| {
                    dimension
                        .split_once('/')
                        .map(|(_, model)| model.to_string())
                        .filter(|model| model != "*")
                })
                .collect(),
        };

        let result = Arc::new(DimensionList {
            labels,
            snapshot_version: version,
        });
        self.dimensions.put(query.clone(), Arc::clone(&result)).await;
        Ok(result)
    }

    /// In-process state of a bucket, `None` if no worker has touched it yet
    pub async fn bucket_state(&self, key: &BucketKey) -> Option<BucketState> {
        let worker = self.workers.lock().await.get(key).cloned()?;
        Some(worker.try_lock().map_or(BucketState::Computing, |state| *state))
    }

    /// Lock the workers of `keys` in key order, marking each bucket `computing`
    async fn lock_buckets<'a, I>(&self, keys: I) -> Vec<(BucketKey, OwnedMutexGuard<BucketState>)>
    where
        I: IntoIterator<Item = &'a BucketKey>,
    {
        let workers: Vec<(BucketKey, BucketWorker)> = {
            let mut map = self.workers.lock().await;
            if map.len() > WORKER_CACHE_LIMIT {
                map.retain(|_, worker| Arc::strong_count(worker) > 1);
            }
            keys.into_iter()
                .map(|key| {
                    let worker = map
                        .entry(key.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(BucketState::Stale)));
                    (key.clone(), Arc::clone(worker))
                })
                .collect()
        };

        let mut guards = Vec::with_capacity(workers.len());
        for (key, worker) in workers {
            let mut guard = worker.lock_owned().await;
            *guard = BucketState::Computing;
            guards.push((key, guard));
        }
        guards
    }
}

/// Buckets written successfully become `fresh`; the rest stay `stale`
fn release_buckets(guards: &mut [(BucketKey, OwnedMutexGuard<BucketState>)], succeeded: bool, corrupt: &[BucketKey]) {
    for (key, guard) in guards.iter_mut() {
        **guard = if succeeded && !corrupt.contains(key) {
            BucketState::Fresh
        } else {
            BucketState::Stale
        };
    }
}

async fn load_pending_in(conn: &mut SqliteConnection) -> PipelineResult<Vec<RebuildScope>> {
    match get_meta_in(conn, meta_keys::PENDING_REBUILDS).await? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(Vec::new()),
    }
}

async fn store_pending_in(conn: &mut SqliteConnection, scopes: &[RebuildScope]) -> PipelineResult<()> {
    set_meta_in(conn, meta_keys::PENDING_REBUILDS, &serde_json::to_string(scopes)?).await
}

async fn add_pending_in(conn: &mut SqliteConnection, scopes: &[RebuildScope]) -> PipelineResult<()> {
    let mut pending = load_pending_in(conn).await?;
    for scope in scopes {
        if pending.iter().any(|existing| existing.covers(scope)) {
            continue;
        }
        pending.retain(|existing| !scope.covers(existing));
        pending.push(scope.clone());
    }
    store_pending_in(conn, &pending).await
}

async fn remove_pending_in(conn: &mut SqliteConnection, scope: &RebuildScope) -> PipelineResult<()> {
    let mut pending = load_pending_in(conn).await?;
    let before = pending.len();
    pending.retain(|existing| !scope.covers(existing));
    if pending.len() != before {
        store_pending_in(conn, &pending).await?;
    }
    Ok(())
}
