use serde::{Deserialize, Serialize};
use sha3::Digest;
use std::collections::BTreeMap;
use std::fmt;

mod store;

pub use store::{HistoricalStore, StoreIter, StoreReadError, StoreWriteError};

/// Reserved operation name of the trailing row in a trace summary.
pub const TOTAL_KEY: &str = "total";

/// One row of an execution-trace summary, usually one kind of system call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationStat {
    /// The operation name as printed by the trace tool
    pub name: String,
    /// Number of times the operation was called
    pub calls: u64,
    /// Number of calls that returned an error
    pub errors: u64,
    /// Share of the total traced time spent in this operation, between 0 and 100
    pub time_percent: f64,
    /// Total time spent in this operation, in seconds
    pub total_time_seconds: f64,
    /// Average time per call, in microseconds
    ///
    /// Trace tools commonly leave this column blank on the total row.
    pub usec_per_call: Option<f64>,
}

impl OperationStat {
    /// Whether this is the summary total row rather than a real operation.
    pub fn is_total(&self) -> bool {
        self.name == TOTAL_KEY
    }
}

/// Per-operation statistics of one trace summary, plus its total row if one was printed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TraceSummary {
    operations: BTreeMap<String, OperationStat>,
    total: Option<OperationStat>,
}

impl TraceSummary {
    pub fn new(operations: BTreeMap<String, OperationStat>, total: Option<OperationStat>) -> Self {
        Self { operations, total }
    }

    /// Look up an operation by name. The reserved name `total` resolves to the total row.
    pub fn get(&self, name: &str) -> Option<&OperationStat> {
        if name == TOTAL_KEY {
            self.total.as_ref()
        } else {
            self.operations.get(name)
        }
    }

    pub fn operations(&self) -> &BTreeMap<String, OperationStat> {
        &self.operations
    }

    pub fn total(&self) -> Option<&OperationStat> {
        self.total.as_ref()
    }

    /// Sum of calls over every row except the total row.
    ///
    /// Returns [None] if the sum does not fit in a `u64`.
    pub fn calls_excluding_total(&self) -> Option<u64> {
        self.operations
            .values()
            .try_fold(0u64, |sum, op| sum.checked_add(op.calls))
    }

    pub fn into_parts(self) -> (BTreeMap<String, OperationStat>, Option<OperationStat>) {
        (self.operations, self.total)
    }
}

/// Peak memory of a process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryUsage {
    pub max_resident_bytes: u64,
}

impl MemoryUsage {
    /// Convert a kilobyte figure as reported by resource-usage tools.
    ///
    /// Returns [None] if the byte count does not fit in a `u64`.
    pub fn from_kilobytes(kilobytes: u64) -> Option<Self> {
        kilobytes.checked_mul(1024).map(|max_resident_bytes| Self {
            max_resident_bytes,
        })
    }
}

/// The kinds of build output whose size is tracked
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Executable,
    ScriptBundle,
    SourceMap,
    SnapshotBlob,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Executable => write!(f, "executable"),
            ArtifactKind::ScriptBundle => write!(f, "script bundle"),
            ArtifactKind::SourceMap => write!(f, "source map"),
            ArtifactKind::SnapshotBlob => write!(f, "snapshot blob"),
        }
    }
}

/// Byte size of each tracked build artifact, keyed by artifact name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct ArtifactSizes(BTreeMap<String, u64>);

impl ArtifactSizes {
    pub fn get(&self, name: &str) -> Option<u64> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(name, size)| (name.as_str(), *size))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, u64)> for ArtifactSizes {
    fn from_iter<T: IntoIterator<Item = (String, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Behavioural counts of one successfully traced scenario
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScenarioMetrics {
    pub scenario_name: String,
    /// Threads observed, the main thread plus every thread-creating call
    pub thread_count: u64,
    /// Total number of traced operations
    pub syscall_count: u64,
}

/// Why a scenario did not produce metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioFailureReason {
    /// The traced program, or the trace tool, exited unsuccessfully
    NonZeroExit { code: Option<i32> },
    /// The scenario did not finish within the configured timeout
    TimedOut { after_secs: u64 },
    /// The trace tool could not be found
    ToolUnavailable { tool: String },
    /// The process could not be started or its output could not be read
    Spawn { message: String },
    /// The captured trace could not be parsed
    Parse { message: String },
    /// An operator aborted the benchmark
    Cancelled,
}

impl fmt::Display for ScenarioFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioFailureReason::NonZeroExit { code: Some(code) } => {
                write!(f, "exited with status {code}")
            }
            ScenarioFailureReason::NonZeroExit { code: None } => {
                write!(f, "terminated by a signal")
            }
            ScenarioFailureReason::TimedOut { after_secs } => {
                write!(f, "timed out after {after_secs}s")
            }
            ScenarioFailureReason::ToolUnavailable { tool } => {
                write!(f, "tool '{tool}' is not available")
            }
            ScenarioFailureReason::Spawn { message } => write!(f, "failed to run: {message}"),
            ScenarioFailureReason::Parse { message } => {
                write!(f, "failed to parse trace: {message}")
            }
            ScenarioFailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one scenario in a benchmark run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScenarioRecord {
    Completed(ScenarioMetrics),
    Failed {
        scenario_name: String,
        reason: ScenarioFailureReason,
    },
}

impl ScenarioRecord {
    pub fn scenario_name(&self) -> &str {
        match self {
            ScenarioRecord::Completed(metrics) => &metrics.scenario_name,
            ScenarioRecord::Failed { scenario_name, .. } => scenario_name,
        }
    }

    pub fn metrics(&self) -> Option<&ScenarioMetrics> {
        match self {
            ScenarioRecord::Completed(metrics) => Some(metrics),
            ScenarioRecord::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ScenarioRecord::Failed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ScenarioRecord::Failed {
                reason: ScenarioFailureReason::Cancelled,
                ..
            }
        )
    }
}

/// Wall-clock timing of one scenario, in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecTimeStats {
    pub mean: f64,
    /// Absent when the scenario was only run once
    pub stddev: Option<f64>,
    pub user: f64,
    pub system: f64,
    pub min: f64,
    pub max: f64,
}

/// Build identification supplied by whoever drives the benchmark
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BuildInfo {
    /// The commit the measured build was made from
    pub commit: Option<String>,
    /// A free-form label, for example a CI job or branch name
    pub label: Option<String>,
}

/// One benchmark invocation, as appended to the historical store
///
/// Built once from parsed inputs and never modified afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkRun {
    /// When the run was recorded, as `%Y-%m-%dT%H:%M:%SZ` in UTC
    created_at: String,
    build: BuildInfo,
    /// Trace statistics of the primary scenario, empty when tracing was unavailable
    operation_stats: BTreeMap<String, OperationStat>,
    total: Option<OperationStat>,
    memory: MemoryUsage,
    artifacts: ArtifactSizes,
    /// One entry per configured scenario, in catalogue order
    scenarios: Vec<ScenarioRecord>,
    #[serde(default)]
    exec_time: BTreeMap<String, ExecTimeStats>,
}

impl BenchmarkRun {
    pub fn new(
        created_at: String,
        build: BuildInfo,
        trace: TraceSummary,
        memory: MemoryUsage,
        artifacts: ArtifactSizes,
        scenarios: Vec<ScenarioRecord>,
        exec_time: BTreeMap<String, ExecTimeStats>,
    ) -> Self {
        let (operation_stats, total) = trace.into_parts();
        Self {
            created_at,
            build,
            operation_stats,
            total,
            memory,
            artifacts,
            scenarios,
            exec_time,
        }
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn build(&self) -> &BuildInfo {
        &self.build
    }

    pub fn operation_stats(&self) -> &BTreeMap<String, OperationStat> {
        &self.operation_stats
    }

    pub fn total(&self) -> Option<&OperationStat> {
        self.total.as_ref()
    }

    pub fn memory(&self) -> MemoryUsage {
        self.memory
    }

    pub fn artifacts(&self) -> &ArtifactSizes {
        &self.artifacts
    }

    pub fn scenarios(&self) -> &[ScenarioRecord] {
        &self.scenarios
    }

    pub fn exec_time(&self) -> &BTreeMap<String, ExecTimeStats> {
        &self.exec_time
    }

    /// Compute a fingerprint for the configuration this run was measured with
    ///
    /// Runs with the same fingerprint are directly comparable. It uses the
    ///     - Build label
    ///     - Tracked artifact names
    ///     - Scenario names, in order
    ///
    /// The commit is not part of the fingerprint.
    /// The fingerprint is computed using [sha3::Sha3_256].
    pub fn fingerprint(&self) -> String {
        let mut hasher = sha3::Sha3_256::new();
        if let Some(label) = &self.build.label {
            Digest::update(&mut hasher, label.as_bytes());
        }
        self.artifacts.iter().for_each(|(name, _)| {
            Digest::update(&mut hasher, name.as_bytes());
        });
        self.scenarios.iter().for_each(|scenario| {
            Digest::update(&mut hasher, scenario.scenario_name().as_bytes());
        });

        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(name: &str, calls: u64) -> OperationStat {
        OperationStat {
            name: name.to_string(),
            calls,
            errors: 0,
            time_percent: 0.0,
            total_time_seconds: 0.0,
            usec_per_call: Some(1.0),
        }
    }

    fn run(label: Option<&str>, commit: &str, scenarios: &[&str]) -> BenchmarkRun {
        BenchmarkRun::new(
            "2024-01-01T00:00:00Z".to_string(),
            BuildInfo {
                commit: Some(commit.to_string()),
                label: label.map(str::to_string),
            },
            TraceSummary::default(),
            MemoryUsage {
                max_resident_bytes: 1,
            },
            [("runtime".to_string(), 10)].into_iter().collect(),
            scenarios
                .iter()
                .map(|name| {
                    ScenarioRecord::Completed(ScenarioMetrics {
                        scenario_name: name.to_string(),
                        thread_count: 2,
                        syscall_count: 3,
                    })
                })
                .collect(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn kilobytes_are_converted_without_loss() {
        assert_eq!(
            Some(MemoryUsage {
                max_resident_bytes: 123_269_120
            }),
            MemoryUsage::from_kilobytes(120_380)
        );
        assert_eq!(None, MemoryUsage::from_kilobytes(u64::MAX));
    }

    #[test]
    fn total_key_resolves_to_total_row() {
        let summary = TraceSummary::new(
            [("read".to_string(), stat("read", 3))].into_iter().collect(),
            Some(stat(TOTAL_KEY, 3)),
        );

        assert_eq!(3, summary.get("total").unwrap().calls);
        assert!(summary.get("total").unwrap().is_total());
        assert_eq!(Some(3), summary.calls_excluding_total());
        assert!(summary.get("write").is_none());
    }

    #[test]
    fn call_sum_overflow_is_detected() {
        let summary = TraceSummary::new(
            [
                ("read".to_string(), stat("read", u64::MAX)),
                ("write".to_string(), stat("write", 1)),
            ]
            .into_iter()
            .collect(),
            None,
        );

        assert_eq!(None, summary.calls_excluding_total());
    }

    #[test]
    fn scenario_record_serializes_with_status_tag() {
        let failed = ScenarioRecord::Failed {
            scenario_name: "hello".to_string(),
            reason: ScenarioFailureReason::TimedOut { after_secs: 5 },
        };

        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!("failed", json["status"]);
        assert_eq!("timed_out", json["reason"]["kind"]);
        assert_eq!(
            failed,
            serde_json::from_value::<ScenarioRecord>(json).unwrap()
        );
    }

    #[test]
    fn fingerprint_ignores_commit() {
        let a = run(Some("ci"), "aaaa", &["hello", "relative_import"]);
        let b = run(Some("ci"), "bbbb", &["hello", "relative_import"]);
        let c = run(Some("ci"), "aaaa", &["hello"]);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
