//! Scheduler hook for the car market pipeline
//!
//! Replays a JSON Lines export of the external page parser through one
//! pipeline tick, or keeps ticking on an interval until Ctrl-C.
//!
//! Usage: pipeline_tick <export.jsonl> [--config <path>] [--loop <seconds>] [--maintenance]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use car_market_pipeline::application::Pipeline;
use car_market_pipeline::infrastructure::logging::{init_logging_with_config, log_system_info};
use car_market_pipeline::infrastructure::{JsonLinesFetcher, PipelineConfig, SysinfoSampler};

struct Args {
    export: PathBuf,
    config: Option<PathBuf>,
    loop_seconds: Option<u64>,
    maintenance: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut export = None;
    let mut config = None;
    let mut loop_seconds = None;
    let mut maintenance = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            "--loop" => {
                let seconds = args.next().context("--loop needs a number of seconds")?;
                loop_seconds = Some(seconds.parse().with_context(|| format!("invalid --loop value '{seconds}'"))?);
            }
            "--maintenance" => maintenance = true,
            other if other.starts_with("--") => bail!("unknown option '{other}'"),
            other => export = Some(PathBuf::from(other)),
        }
    }

    Ok(Args {
        export: export.context("usage: pipeline_tick <export.jsonl> [--config <path>] [--loop <seconds>] [--maintenance]")?,
        config,
        loop_seconds,
        maintenance,
    })
}

fn main() -> Result<()> {
    let args = parse_args()?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let config = PipelineConfig::load(args.config.as_deref())?;
    init_logging_with_config(&config.logging)?;
    log_system_info();

    let sampler = Arc::new(SysinfoSampler::new());
    let config = match sampler.capabilities().await {
        Ok(capabilities) => {
            info!(
                profile = ?capabilities.profile,
                cores = capabilities.cpu_cores,
                total_memory_mb = capabilities.total_memory_bytes / (1024 * 1024),
                "Detected system capabilities"
            );
            config.tuned_for(capabilities.profile)
        }
        Err(e) => {
            warn!("Could not read system capabilities, keeping configured sizes: {:#}", e);
            config
        }
    };

    let fetcher = Arc::new(JsonLinesFetcher::new(&args.export));
    let pipeline = Pipeline::open(config, fetcher, sampler)
        .await
        .context("Failed to open pipeline")?;

    match args.loop_seconds {
        None => {
            run_once(&pipeline, args.maintenance).await;
        }
        Some(seconds) => {
            let mut interval = tokio::time::interval(Duration::from_secs(seconds.max(1)));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Ctrl-C received, stopping after the current batch");
                        pipeline.cancel();
                        break;
                    }
                    _ = interval.tick() => {
                        run_once(&pipeline, args.maintenance).await;
                    }
                }
            }
        }
    }

    let health = pipeline.health().await?;
    info!(
        tier = %health.tier,
        snapshot_version = health.snapshot_version,
        pending = health.pending_tasks,
        stuck = health.stuck_tasks,
        healthy = health.healthy,
        "Pipeline health"
    );
    pipeline.close().await;
    Ok(())
}

async fn run_once(pipeline: &Pipeline, maintenance: bool) {
    if !pipeline.is_idle_safe_to_run().await {
        info!("System busy, skipping tick");
        return;
    }

    match pipeline.tick().await {
        Ok(tick) => info!(
            sweep_started = ?tick.sweep_started,
            collector = ?tick.collector,
            aggregator = ?tick.aggregator,
            "Tick finished"
        ),
        Err(e) if e.is_failed_tick() => error!("Tick failed: {}", e),
        Err(e) => info!("Tick skipped: {}", e),
    }

    if maintenance {
        if let Err(e) = pipeline.maintenance().await {
            error!("Maintenance failed: {}", e);
        }
    }
}
