#[macro_use]
extern crate log;

use anyhow::{bail, Context};
use clap::Parser as _;
use tracebench::config::TelemetryConfig;
use tracebench::pipeline::{BenchmarkPipeline, PipelineOptions};
use tracebench::scenario::TraceCapability;
use tracebench_core::prelude::{CancelledError, Executor};
use tracebench_model::{BuildInfo, HistoricalStore};

mod cli;

const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    env_logger::try_init()?;

    let args = cli::CliArgs::try_parse()?;
    info!("{CRATE_NAME} {CRATE_VERSION}");
    info!("Using build directory: {}", args.build_dir.display());
    info!("Using historical store: {}", args.store.display());

    let config = match &args.config {
        Some(path) => TelemetryConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => TelemetryConfig::default(),
    };

    let target = match args.target.clone() {
        Some(target) => target,
        None => config
            .executable_in(&args.build_dir)
            .context("No --target given and no executable artifact is configured")?,
    };
    info!("Using target: {}", target.display());

    let capability = TraceCapability::detect();
    debug!("Trace capability: {capability:?}");

    let executor = Executor::with_ctrl_c().context("Failed to start process runtime")?;

    let store = HistoricalStore::open(&args.store);
    if let Some(baseline) = &args.baseline {
        if store.seed_from(baseline)? {
            info!("Initialised historical store from {}", baseline.display());
        }
    }

    let options = PipelineOptions {
        build_dir: args.build_dir,
        target,
        build: BuildInfo {
            commit: args.commit,
            label: args.label,
        },
        trace_summary: args.trace_summary,
        memory_report: args.memory_report,
        skip_exec_time: args.skip_exec_time,
    };
    let run = match BenchmarkPipeline::new(&config, &executor, capability, &store).run(&options) {
        Ok(run) => run,
        Err(e) if e.is::<CancelledError>() => bail!("{e}, no run was recorded"),
        Err(e) => return Err(e),
    };

    if let Some(recent) = &args.recent {
        let written = store.write_recent(recent, args.recent_count)?;
        info!("Wrote {written} recent runs to {}", recent.display());
    }

    info!("Benchmark run recorded at {}", run.created_at());

    Ok(())
}
