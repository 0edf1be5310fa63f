//! Incremental collector
//!
//! One `tick` claims one `scrape_page` task, pulls at most one batch of
//! listings through the fetcher and commits the upserts, the task transition,
//! the follow-up scrape task and the aggregate task in a single write
//! transaction. A crash anywhere before that commit leaves the task claimed
//! and it is re-queued by the liveness timeout.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::application::resource_governor::ResourceGovernor;
use crate::domain::constants::meta_keys;
use crate::domain::errors::{FetchError, PipelineError, PipelineResult};
use crate::domain::listing::Listing;
use crate::domain::services::{FetchResponse, Fetcher};
use crate::domain::system::{OperatingTier, WorkKind};
use crate::domain::task::{NewTask, Task, TaskId, TaskKind, TaskState};
use crate::infrastructure::codec::{compress_json, now};
use crate::infrastructure::config::CollectorConfig;
use crate::infrastructure::listing_store::{ListingStore, UpsertOutcome, set_meta_time_in, upsert_in};
use crate::infrastructure::work_queue::{WorkQueue, commit_in, enqueue_in};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Listings read by one bounded [`IncrementalCollector::run`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRun {
    /// Token to resume from; `None` once the source is exhausted
    pub next_cursor: Option<String>,
    pub listings: Vec<Listing>,
    pub exhausted: bool,
    /// Records that failed even after in-batch retries
    pub skipped: u32,
}

/// What a committed batch changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCommit {
    pub task_id: TaskId,
    pub inserted: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub skipped: u32,
    pub next_task: Option<TaskId>,
    /// Aggregate task carrying the changed listings, if anything changed
    pub aggregate_task: Option<TaskId>,
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorTick {
    /// The governor refused new fetches; no task was claimed
    Deferred { tier: OperatingTier },
    /// No eligible scrape task
    Idle,
    Committed(BatchCommit),
    /// The batch failed and the task went back to the queue (or failed for good)
    Failed {
        task_id: TaskId,
        error: String,
        state: TaskState,
    },
}

pub struct IncrementalCollector {
    store: ListingStore,
    queue: WorkQueue,
    governor: Arc<ResourceGovernor>,
    fetcher: Arc<dyn Fetcher>,
    config: CollectorConfig,
    rate_limiter: DirectRateLimiter,
    cancellation_token: CancellationToken,
}

impl IncrementalCollector {
    pub fn new(
        store: ListingStore,
        queue: WorkQueue,
        governor: Arc<ResourceGovernor>,
        fetcher: Arc<dyn Fetcher>,
        config: CollectorConfig,
    ) -> Self {
        let per_minute = NonZeroU32::new(config.fetch_rate_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            store,
            queue,
            governor,
            fetcher,
            config,
            rate_limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with the rest of the pipeline
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Run one unit of collection work
    pub async fn tick(&self) -> PipelineResult<CollectorTick> {
        let span = info_span!("collector_tick", task_id = tracing::field::Empty);
        self.tick_inner().instrument(span).await
    }

    async fn tick_inner(&self) -> PipelineResult<CollectorTick> {
        if self.cancellation_token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let admission = self.governor.admission(WorkKind::Scrape, self.config.batch_size).await;
        if !admission.admitted {
            debug!(tier = %admission.tier, "Scrape deferred by governor");
            return Ok(CollectorTick::Deferred { tier: admission.tier });
        }

        let Some(task) = self.queue.claim(TaskKind::ScrapePage).await? else {
            return Ok(CollectorTick::Idle);
        };
        tracing::Span::current().record("task_id", task.id);

        let run = match self.run(&task.cursor, admission.batch_size).await {
            Ok(run) => run,
            Err(err) => {
                let message = err.to_string();
                warn!(cursor = %task.cursor, "Batch failed: {}", message);
                let state = self.queue.fail(task.id, &message).await?;
                return Ok(CollectorTick::Failed {
                    task_id: task.id,
                    error: message,
                    state,
                });
            }
        };

        match self.commit_batch(&task, &run).await {
            Ok(commit) => {
                info!(
                    inserted = commit.inserted,
                    updated = commit.updated,
                    unchanged = commit.unchanged,
                    skipped = commit.skipped,
                    exhausted = commit.exhausted,
                    "Batch committed"
                );
                Ok(CollectorTick::Committed(commit))
            }
            Err(err) => {
                warn!("Batch commit rolled back: {}", err);
                if let Err(fail_err) = self.queue.fail(task.id, &err.to_string()).await {
                    warn!("Could not record failure of task {}: {}", task.id, fail_err);
                }
                Err(err)
            }
        }
    }

    /// Read up to `batch_size` records starting at `cursor`
    ///
    /// Failed records are retried in place and then skipped. A page-level
    /// failure, or too many failed records in a row, fails the whole batch.
    pub async fn run(&self, cursor: &str, batch_size: usize) -> PipelineResult<BatchRun> {
        let seen_at = now();
        let mut run = BatchRun {
            next_cursor: Some(cursor.to_string()),
            ..BatchRun::default()
        };
        let mut consecutive_failures = 0u32;
        let mut consumed = 0usize;

        while consumed < batch_size.max(1) {
            let Some(token) = run.next_cursor.clone() else {
                break;
            };
            let response = self.fetch_record(&token).await?;
            consumed += 1;
            run.next_cursor = response.next_page_token;

            let listing = response
                .record
                .map_err(PipelineError::from)
                .and_then(|raw| Listing::from_raw(raw, seen_at));
            match listing {
                Ok(listing) => {
                    consecutive_failures = 0;
                    run.listings.push(listing);
                }
                Err(err) => {
                    consecutive_failures += 1;
                    run.skipped += 1;
                    warn!(token = %token, "Skipping listing: {}", err);
                    if consecutive_failures >= self.config.consecutive_failure_threshold {
                        return Err(PipelineError::SourceUnavailable(format!(
                            "{consecutive_failures} consecutive listing failures ending at token {token}"
                        )));
                    }
                }
            }
        }

        run.exhausted = run.next_cursor.is_none();
        Ok(run)
    }

    /// One record, retrying transient failures up to `listing_retry_attempts` times
    async fn fetch_record(&self, token: &str) -> PipelineResult<FetchResponse> {
        let mut attempt = 0u32;
        loop {
            self.rate_limiter.until_ready().await;
            let result = match tokio::time::timeout(self.config.fetch_timeout(), self.fetcher.fetch(token)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(self.config.fetch_timeout_ms)),
            };

            let retryable = match &result {
                Err(err) if err.is_page_level() => return Err(PipelineError::from(err.clone())),
                Err(_) => true,
                Ok(response) => response.record.is_err(),
            };
            if !retryable || attempt >= self.config.listing_retry_attempts {
                return result.map_err(PipelineError::from);
            }

            attempt += 1;
            debug!(token, attempt, "Retrying fetch");
        }
    }

    async fn commit_batch(&self, task: &Task, run: &BatchRun) -> PipelineResult<BatchCommit> {
        let level = self.store.compression_level();
        let at = now();
        let mut tx = self.store.db().begin_write().await?;

        let mut commit = BatchCommit {
            task_id: task.id,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            skipped: run.skipped,
            next_task: None,
            aggregate_task: None,
            exhausted: run.exhausted,
        };
        let mut changed = Vec::new();
        for listing in &run.listings {
            let upserted = upsert_in(tx.conn(), listing, level).await?;
            match upserted.outcome {
                UpsertOutcome::Inserted => commit.inserted += 1,
                UpsertOutcome::Updated => commit.updated += 1,
                UpsertOutcome::Unchanged => commit.unchanged += 1,
            }
            if upserted.outcome.is_change() {
                changed.push(upserted.stored);
            }
        }

        commit_in(tx.conn(), task.id, at).await?;

        match &run.next_cursor {
            Some(cursor) => {
                commit.next_task = Some(enqueue_in(tx.conn(), &NewTask::scrape_page(cursor.clone()), at).await?);
            }
            None => set_meta_time_in(tx.conn(), meta_keys::SWEEP_COMPLETED_AT, at).await?,
        }

        if !changed.is_empty() {
            let payload = compress_json(&changed, level)?;
            let aggregate = NewTask::aggregate_batch(task.id, task.cursor.clone(), payload);
            commit.aggregate_task = Some(enqueue_in(tx.conn(), &aggregate, at).await?);
        }

        tx.commit().await?;
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::listing::RawListing;
    use crate::domain::services::SystemSampler;
    use crate::domain::system::SystemState;
    use crate::infrastructure::config::{GovernorConfig, QueueConfig};
    use crate::infrastructure::database_connection::DatabaseConnection;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serves `count` records with tokens "0".."count-1"; failures are keyed by token
    struct PagedFetcher {
        count: usize,
        calls: AtomicUsize,
        failures: Mutex<HashMap<String, Vec<FetchError>>>,
        record_failures: Mutex<HashMap<String, u32>>,
    }

    impl PagedFetcher {
        fn new(count: usize) -> Self {
            Self {
                count,
                calls: AtomicUsize::new(0),
                failures: Mutex::new(HashMap::new()),
                record_failures: Mutex::new(HashMap::new()),
            }
        }

        fn fail_call(self, token: &str, errors: Vec<FetchError>) -> Self {
            self.failures.lock().unwrap().insert(token.to_string(), errors);
            self
        }

        fn fail_record(self, token: &str, times: u32) -> Self {
            self.record_failures.lock().unwrap().insert(token.to_string(), times);
            self
        }
    }

    #[async_trait]
    impl Fetcher for PagedFetcher {
        async fn fetch(&self, page_token: &str) -> Result<FetchResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(errors) = self.failures.lock().unwrap().get_mut(page_token) {
                if !errors.is_empty() {
                    return Err(errors.remove(0));
                }
            }
            let index: usize = page_token.parse().unwrap();
            let next = (index + 1 < self.count).then(|| (index + 1).to_string());
            if let Some(remaining) = self.record_failures.lock().unwrap().get_mut(page_token) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(FetchResponse::failure(FetchError::Transient("flaky".into()), next));
                }
            }
            let raw = RawListing {
                id: format!("car-{index}"),
                title: format!("Car {index}"),
                price: Some(10_000 + index as i64 * 100),
                make: Some("Toyota".into()),
                model: Some("Camry".into()),
                ..RawListing::default()
            };
            Ok(FetchResponse::listing(raw, next))
        }
    }

    struct Fixed(SystemState);

    #[async_trait]
    impl SystemSampler for Fixed {
        async fn sample(&self) -> anyhow::Result<SystemState> {
            Ok(self.0)
        }
    }

    struct Harness {
        _dir: TempDir,
        queue: WorkQueue,
        store: ListingStore,
        fetcher: Arc<PagedFetcher>,
        collector: IncrementalCollector,
    }

    async fn harness(fetcher: PagedFetcher, state: SystemState, batch_size: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConnection::open(&dir.path().join("collector.db")).await.unwrap();
        let queue = WorkQueue::new(db.clone(), &QueueConfig::default());
        let store = ListingStore::new(db, 3);
        let governor = Arc::new(ResourceGovernor::new(Arc::new(Fixed(state)), GovernorConfig::default()));
        let fetcher = Arc::new(fetcher);
        let config = CollectorConfig {
            batch_size,
            fetch_rate_per_minute: 60_000,
            ..CollectorConfig::default()
        };
        let collector = IncrementalCollector::new(store.clone(), queue.clone(), governor, fetcher.clone(), config);
        Harness {
            _dir: dir,
            queue,
            store,
            fetcher,
            collector,
        }
    }

    #[tokio::test]
    async fn commits_batch_and_chains_next_page() {
        let h = harness(PagedFetcher::new(5), SystemState::relaxed(), 3).await;
        let first = h.queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();

        let CollectorTick::Committed(commit) = h.collector.tick().await.unwrap() else {
            panic!("expected a committed batch");
        };
        assert_eq!(commit.task_id, first);
        assert_eq!(commit.inserted, 3);
        assert!(!commit.exhausted);
        let next = h.queue.get(commit.next_task.unwrap()).await.unwrap().unwrap();
        assert_eq!(next.cursor, "3");
        let aggregate = h.queue.get(commit.aggregate_task.unwrap()).await.unwrap().unwrap();
        assert_eq!(aggregate.parent_id, Some(first));
        assert_eq!(h.queue.get(first).await.unwrap().unwrap().state, TaskState::Done);

        let CollectorTick::Committed(last) = h.collector.tick().await.unwrap() else {
            panic!("expected a committed batch");
        };
        assert_eq!(last.inserted, 2);
        assert!(last.exhausted);
        assert!(last.next_task.is_none());
        assert!(h.store.get_meta_time(meta_keys::SWEEP_COMPLETED_AT).await.unwrap().is_some());
        assert_eq!(h.collector.tick().await.unwrap(), CollectorTick::Idle);
    }

    #[tokio::test]
    async fn paused_tier_defers_without_claiming_or_fetching() {
        let busy = SystemState {
            cpu_percent: 99.0,
            ..SystemState::relaxed()
        };
        let h = harness(PagedFetcher::new(5), busy, 3).await;
        let id = h.queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();

        assert_eq!(
            h.collector.tick().await.unwrap(),
            CollectorTick::Deferred {
                tier: OperatingTier::Paused
            }
        );
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.queue.get(id).await.unwrap().unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn unchanged_listings_are_not_forwarded() {
        let h = harness(PagedFetcher::new(2), SystemState::relaxed(), 10).await;
        h.queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();
        h.collector.tick().await.unwrap();

        h.queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();
        let CollectorTick::Committed(again) = h.collector.tick().await.unwrap() else {
            panic!("expected a committed batch");
        };
        assert_eq!(again.unchanged, 2);
        assert!(again.aggregate_task.is_none());
    }

    #[tokio::test]
    async fn flaky_record_is_retried_then_skipped() {
        let fetcher = PagedFetcher::new(3).fail_record("0", 1).fail_record("1", 10);
        let h = harness(fetcher, SystemState::relaxed(), 10).await;

        let run = h.collector.run("0", 10).await.unwrap();
        let ids: Vec<_> = run.listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, ["car-0", "car-2"]);
        assert_eq!(run.skipped, 1);
        assert!(run.exhausted);
        // token 0: 2 calls, token 1: 3 calls, token 2: 1 call
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn unreachable_page_fails_the_task_with_backoff() {
        let fetcher = PagedFetcher::new(3).fail_call("0", vec![FetchError::SourceUnavailable("503".into())]);
        let h = harness(fetcher, SystemState::relaxed(), 10).await;
        let id = h.queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();

        let CollectorTick::Failed { task_id, state, .. } = h.collector.tick().await.unwrap() else {
            panic!("expected a failed batch");
        };
        assert_eq!(task_id, id);
        assert_eq!(state, TaskState::Pending);
        let task = h.queue.get(id).await.unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        assert!(task.not_before > now());
        assert_eq!(h.store.count(&Default::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn consecutive_failures_abort_the_batch() {
        let mut fetcher = PagedFetcher::new(10);
        for token in 0..5 {
            fetcher = fetcher.fail_record(&token.to_string(), 10);
        }
        let h = harness(fetcher, SystemState::relaxed(), 10).await;
        let result = h.collector.run("0", 10).await;
        assert!(matches!(result, Err(PipelineError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn cancelled_collector_does_nothing() {
        let h = harness(PagedFetcher::new(3), SystemState::relaxed(), 3).await;
        let token = CancellationToken::new();
        let collector = h.collector.with_cancellation(token.clone());
        h.queue.enqueue(&NewTask::scrape_page("0")).await.unwrap();
        token.cancel();

        assert!(matches!(collector.tick().await, Err(PipelineError::Cancelled)));
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
