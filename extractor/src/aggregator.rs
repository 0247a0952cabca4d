use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use tracebench_model::{
    ArtifactSizes, BenchmarkRun, BuildInfo, ExecTimeStats, HistoricalStore, MemoryUsage,
    ScenarioRecord, StoreWriteError, TraceSummary,
};

use crate::config::ArtifactSpec;

const CREATED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Everything measured during one benchmark invocation
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub build: BuildInfo,
    /// Trace statistics of the primary scenario, empty when tracing is unavailable
    pub trace: TraceSummary,
    pub memory: MemoryUsage,
    pub artifacts: ArtifactSizes,
    pub scenarios: Vec<ScenarioRecord>,
    pub exec_time: BTreeMap<String, ExecTimeStats>,
}

/// The measured parts do not fit together into a record
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("Artifact '{0}' is required but was not measured")]
    MissingArtifact(String),
    #[error("Operation statistics are present but there is no total row")]
    MissingTotal,
    #[error("Scenario '{0}' was measured more than once")]
    DuplicateScenario(String),
    #[error("Total row reports {reported} calls but the operations sum to {summed}")]
    Inconsistent { reported: u64, summed: u64 },
    #[error("The operations' call counts do not fit in 64 bits")]
    CallCountOverflow,
    #[error(transparent)]
    Store(#[from] StoreWriteError),
}

/// Combines the parsed measurements of a run into one [BenchmarkRun] and records it.
pub struct BenchmarkRecordAggregator<'a> {
    store: &'a HistoricalStore,
    required_artifacts: Vec<String>,
}

impl<'a> BenchmarkRecordAggregator<'a> {
    pub fn new(store: &'a HistoricalStore, required_artifacts: &[ArtifactSpec]) -> Self {
        Self {
            store,
            required_artifacts: required_artifacts
                .iter()
                .map(|spec| spec.name.clone())
                .collect(),
        }
    }
}

impl BenchmarkRecordAggregator<'_> {
    /// Validate the inputs and assemble a record stamped with `created_at`.
    pub fn build(
        &self,
        created_at: DateTime<Utc>,
        inputs: RunInputs,
    ) -> Result<BenchmarkRun, AggregateError> {
        self.validate(&inputs)?;

        inputs
            .artifacts
            .iter()
            .filter(|(_, size)| *size == 0)
            .for_each(|(name, _)| log::warn!("Recording zero size for artifact '{name}'"));

        Ok(BenchmarkRun::new(
            created_at.format(CREATED_AT_FORMAT).to_string(),
            inputs.build,
            inputs.trace,
            inputs.memory,
            inputs.artifacts,
            inputs.scenarios,
            inputs.exec_time,
        ))
    }

    /// Build a record stamped with the current time and append it to the store.
    ///
    /// Nothing is written if validation fails.
    pub fn append(&self, inputs: RunInputs) -> Result<BenchmarkRun, AggregateError> {
        let run = self.build(Utc::now(), inputs)?;
        self.store.append(&run)?;
        log::info!(
            "Recorded benchmark run with fingerprint {} in {}",
            run.fingerprint(),
            self.store.path().display()
        );

        Ok(run)
    }

    fn validate(&self, inputs: &RunInputs) -> Result<(), AggregateError> {
        if let Some(missing) = self
            .required_artifacts
            .iter()
            .find(|name| !inputs.artifacts.contains(name))
        {
            return Err(AggregateError::MissingArtifact(missing.clone()));
        }

        if let Some(name) = inputs
            .scenarios
            .iter()
            .map(ScenarioRecord::scenario_name)
            .duplicates()
            .next()
        {
            return Err(AggregateError::DuplicateScenario(name.to_string()));
        }

        let summed = inputs
            .trace
            .calls_excluding_total()
            .ok_or(AggregateError::CallCountOverflow)?;
        match inputs.trace.total() {
            None if !inputs.trace.operations().is_empty() => Err(AggregateError::MissingTotal),
            Some(total) if total.calls != summed => Err(AggregateError::Inconsistent {
                reported: total.calls,
                summed,
            }),
            _ => Ok(()),
        }
    }
}
