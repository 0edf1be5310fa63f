//! Shared fakes for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use car_market_pipeline::application::Pipeline;
use car_market_pipeline::domain::{
    FetchError, FetchResponse, Fetcher, Listing, NewTask, RawListing, SystemSampler, SystemState, TaskId, TaskKind,
};
use car_market_pipeline::infrastructure::codec::compress_json;
use car_market_pipeline::infrastructure::PipelineConfig;
use tempfile::TempDir;

/// Serves a mutable list of raw records; the page token is the record index
pub struct ScriptedFetcher {
    records: Mutex<Vec<RawListing>>,
    failures: Mutex<HashMap<String, Vec<FetchError>>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(records: Vec<RawListing>) -> Self {
        Self {
            records: Mutex::new(records),
            failures: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_records(&self, records: Vec<RawListing>) {
        *self.records.lock().unwrap() = records;
    }

    /// The next calls for `token` fail with `errors`, in order
    pub fn fail_token(&self, token: &str, errors: Vec<FetchError>) {
        self.failures.lock().unwrap().insert(token.to_string(), errors);
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, page_token: &str) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(errors) = self.failures.lock().unwrap().get_mut(page_token) {
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }

        let records = self.records.lock().unwrap();
        let index: usize = page_token
            .parse()
            .map_err(|_| FetchError::SourceUnavailable(format!("bad token {page_token}")))?;
        let record = records
            .get(index)
            .cloned()
            .ok_or_else(|| FetchError::SourceUnavailable(format!("no record at {index}")))?;
        let next = (index + 1 < records.len()).then(|| (index + 1).to_string());
        Ok(FetchResponse::listing(record, next))
    }
}

/// Sampler whose reading can be changed mid-test
pub struct FixedSampler {
    state: Mutex<SystemState>,
}

impl FixedSampler {
    pub fn relaxed() -> Self {
        Self::with(SystemState::relaxed())
    }

    pub fn with(state: SystemState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn set_cpu(&self, cpu_percent: f32) {
        self.state.lock().unwrap().cpu_percent = cpu_percent;
    }
}

#[async_trait]
impl SystemSampler for FixedSampler {
    async fn sample(&self) -> anyhow::Result<SystemState> {
        Ok(*self.state.lock().unwrap())
    }
}

pub fn car(id: &str, make: &str, model: &str, price: i64, mileage: i64) -> RawListing {
    RawListing {
        id: id.to_string(),
        title: format!("{make} {model}"),
        price: Some(price),
        mileage: Some(mileage),
        year: Some(2019),
        make: Some(make.to_string()),
        model: Some(model.to_string()),
        location: Some("Seoul".to_string()),
        url: Some(format!("https://market.example/{id}")),
        ..RawListing::default()
    }
}

/// Test configuration: database inside `dir`, no file logging, no throttling by rate
pub fn test_config(dir: &Path, batch_size: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.store.database_path = Some(dir.join("pipeline.db"));
    config.collector.batch_size = batch_size;
    config.collector.fetch_rate_per_minute = 60_000;
    config.collector.fetch_timeout_ms = 2_000;
    config.logging.file_output = false;
    config
}

pub struct TestPipeline {
    pub dir: TempDir,
    pub fetcher: Arc<ScriptedFetcher>,
    pub sampler: Arc<FixedSampler>,
    pub pipeline: Pipeline,
}

pub async fn open(records: Vec<RawListing>, batch_size: usize) -> TestPipeline {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), batch_size);
    open_with(dir, config, records).await
}

pub async fn open_with(dir: TempDir, config: PipelineConfig, records: Vec<RawListing>) -> TestPipeline {
    let fetcher = Arc::new(ScriptedFetcher::new(records));
    let sampler = Arc::new(FixedSampler::relaxed());
    let pipeline = Pipeline::open(config, fetcher.clone(), sampler.clone()).await.unwrap();
    TestPipeline {
        dir,
        fetcher,
        sampler,
        pipeline,
    }
}

/// Tick until both workers report idle, with an upper bound
pub async fn drain(pipeline: &Pipeline) -> usize {
    use car_market_pipeline::application::{AggregatorTick, CollectorTick};

    for ticks in 1..=200 {
        let tick = pipeline.tick().await.unwrap();
        if tick.collector == CollectorTick::Idle && tick.aggregator == AggregatorTick::Idle {
            return ticks;
        }
    }
    panic!("pipeline did not settle within 200 ticks");
}

/// Store `listings` and fold them through a real aggregate task, as a sweep would
pub async fn aggregate(pipeline: &Pipeline, listings: &[Listing]) -> TaskId {
    use car_market_pipeline::application::AggregatorTick;

    for listing in listings {
        pipeline.store().upsert(listing).await.unwrap();
    }
    let queue = pipeline.queue();
    let parent = queue.enqueue(&NewTask::scrape_page("seed")).await.unwrap();
    queue.claim(TaskKind::ScrapePage).await.unwrap().unwrap();
    queue.commit(parent).await.unwrap();
    let payload = compress_json(listings, 3).unwrap();
    let id = queue.enqueue(&NewTask::aggregate_batch(parent, "seed", payload)).await.unwrap();

    let AggregatorTick::Applied(applied) = pipeline.aggregator().tick().await.unwrap() else {
        panic!("expected the seeded batch to be applied");
    };
    assert_eq!(applied.task_id, id);
    id
}
