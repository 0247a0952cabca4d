//! One benchmark invocation, from build outputs to a record in the historical store.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tracebench_core::prelude::{CancelledError, Executor};
use tracebench_model::{
    BenchmarkRun, BuildInfo, HistoricalStore, MemoryUsage, ScenarioFailureReason, ScenarioRecord,
    TraceSummary,
};

use crate::aggregator::{BenchmarkRecordAggregator, RunInputs};
use crate::artifacts::ArtifactSizeCollector;
use crate::config::TelemetryConfig;
use crate::parse::{MemoryReportParser, TraceSummaryParser};
use crate::scenario::{ScenarioFailure, ScenarioRunner, ScenarioTrace, TraceCapability};

/// Inputs of one invocation that do not come from the config file
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub build_dir: PathBuf,
    /// Executable the scenarios run against
    pub target: PathBuf,
    pub build: BuildInfo,
    /// Previously captured trace summary to use instead of tracing the primary scenario
    pub trace_summary: Option<PathBuf>,
    /// Previously captured memory report to use instead of measuring the primary scenario
    pub memory_report: Option<PathBuf>,
    pub skip_exec_time: bool,
}

/// Measures a build and appends the resulting run to the store.
///
/// A shutdown request at any point makes [BenchmarkPipeline::run] return a [CancelledError]
/// without writing to the store.
pub struct BenchmarkPipeline<'a> {
    config: &'a TelemetryConfig,
    executor: &'a Executor,
    runner: ScenarioRunner<'a>,
    store: &'a HistoricalStore,
}

impl<'a> BenchmarkPipeline<'a> {
    pub fn new(
        config: &'a TelemetryConfig,
        executor: &'a Executor,
        capability: TraceCapability,
        store: &'a HistoricalStore,
    ) -> Self {
        Self {
            config,
            executor,
            runner: ScenarioRunner::new(config, executor, capability),
            store,
        }
    }
}

impl BenchmarkPipeline<'_> {
    pub fn run(&self, options: &PipelineOptions) -> anyhow::Result<BenchmarkRun> {
        let artifacts =
            ArtifactSizeCollector::new(&self.config.artifacts).collect(&options.build_dir)?;
        log::debug!("Measured {} build artifacts", artifacts.len());
        self.ensure_running()?;

        let memory = self.read_memory(options)?;
        log::info!("Peak resident memory: {} bytes", memory.max_resident_bytes);
        self.ensure_running()?;

        let supplied_trace = options
            .trace_summary
            .as_deref()
            .map(read_trace_file)
            .transpose()?;

        let mut traces = self.runner.trace_all(&options.target);
        if traces.iter().any(|trace| trace.record.is_cancelled()) {
            return Err(CancelledError::default().into());
        }
        self.ensure_running()?;

        let trace = match supplied_trace {
            Some(trace) => trace,
            None => self.primary_trace(&mut traces)?,
        };
        log::debug!("Using {} traced operations", trace.operations().len());

        let scenarios = traces
            .into_iter()
            .map(|trace| trace.record)
            .collect::<Vec<_>>();
        let failed = scenarios.iter().filter(|s| s.is_failed()).count();
        if failed > 0 {
            log::warn!("{failed} of {} scenarios failed", scenarios.len());
        }

        let exec_time = if options.skip_exec_time {
            log::debug!("Skipping execution time benchmark");
            Default::default()
        } else {
            match self.runner.measure_exec_time(&options.target) {
                Ok(exec_time) => exec_time.unwrap_or_default(),
                Err(failure) => {
                    self.ensure_measured(&failure)?;
                    log::warn!("Execution time benchmark failed: {failure}");
                    Default::default()
                }
            }
        };
        self.ensure_running()?;

        let inputs = RunInputs {
            build: options.build.clone(),
            trace,
            memory,
            artifacts,
            scenarios,
            exec_time,
        };

        BenchmarkRecordAggregator::new(self.store, &self.config.artifacts)
            .append(inputs)
            .context("Run was measured but not recorded")
    }

    /// Parse the given memory report, or measure the primary scenario.
    fn read_memory(&self, options: &PipelineOptions) -> anyhow::Result<MemoryUsage> {
        let text = match &options.memory_report {
            Some(path) => {
                log::debug!("Reading memory report from {}", path.display());
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read memory report {}", path.display()))?
            }
            None => {
                let scenario = self.config.primary().context("No scenario to measure")?;
                log::debug!("Measuring memory of scenario '{}'", scenario.name);
                match self.runner.measure_memory(&options.target, scenario) {
                    Ok(text) => text,
                    Err(failure) => {
                        self.ensure_measured(&failure)?;
                        return Err(failure.into());
                    }
                }
            }
        };

        Ok(MemoryReportParser::parse(&text)?)
    }

    /// Take the primary scenario's trace out of the scenario traces.
    ///
    /// Without trace support the run records no operations.
    fn primary_trace(&self, traces: &mut [ScenarioTrace]) -> anyhow::Result<TraceSummary> {
        if self.runner.capability() == TraceCapability::Unsupported {
            log::info!(
                "Execution tracing is not supported on this platform, recording no operations"
            );
            return Ok(TraceSummary::default());
        }

        let primary = self.config.primary().context("No scenario to trace")?;
        let trace = traces
            .iter_mut()
            .find(|trace| trace.record.scenario_name() == primary.name)
            .with_context(|| format!("Primary scenario '{}' was not run", primary.name))?;

        match trace.summary.take() {
            Some(summary) => Ok(summary),
            None => bail!(
                "Primary scenario '{}' could not be traced: {}",
                primary.name,
                failure_reason(trace)
            ),
        }
    }

    fn ensure_running(&self) -> Result<(), CancelledError> {
        if self.executor.shutdown_handle().is_shutdown() {
            Err(CancelledError::default())
        } else {
            Ok(())
        }
    }

    /// A tool that was killed by a shutdown request reports a cancelled failure.
    fn ensure_measured(&self, failure: &ScenarioFailure) -> Result<(), CancelledError> {
        if failure.reason == ScenarioFailureReason::Cancelled {
            return Err(CancelledError::default());
        }
        self.ensure_running()
    }
}

fn read_trace_file(path: &Path) -> anyhow::Result<TraceSummary> {
    log::debug!("Reading trace summary from {}", path.display());
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read trace summary {}", path.display()))?;

    Ok(TraceSummaryParser::parse(&text)?)
}

fn failure_reason(trace: &ScenarioTrace) -> String {
    match &trace.record {
        ScenarioRecord::Failed { reason, .. } => reason.to_string(),
        ScenarioRecord::Completed(_) => "no trace was kept".to_string(),
    }
}
