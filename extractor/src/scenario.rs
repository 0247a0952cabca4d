use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tracebench_core::prelude::Executor;
use tracebench_model::{
    ExecTimeStats, ScenarioFailureReason, ScenarioMetrics, ScenarioRecord, TraceSummary,
};

use crate::config::{ScenarioSpec, TelemetryConfig};
use crate::parse::{ExecTimeParser, TraceSummaryParser};
use crate::tools::resolve_tool;

/// Operations that start a new thread or process in a trace summary.
const THREAD_CREATING_OPERATIONS: &[&str] = &["clone", "clone3"];

/// Label used in failures of the timing benchmark, which covers all scenarios at once.
const EXEC_TIME_LABEL: &str = "exec_time";

/// Whether execution traces can be collected on this machine
///
/// Selected once at startup. The trace tool is Linux only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCapability {
    Available,
    Unsupported,
}

impl TraceCapability {
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            TraceCapability::Available
        } else {
            TraceCapability::Unsupported
        }
    }
}

/// One scenario could not be measured
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Scenario '{scenario_name}' failed: {reason}")]
pub struct ScenarioFailure {
    pub scenario_name: String,
    pub reason: ScenarioFailureReason,
}

impl ScenarioFailure {
    fn new(scenario_name: &str, reason: ScenarioFailureReason) -> Self {
        Self {
            scenario_name: scenario_name.to_string(),
            reason,
        }
    }
}

/// Outcome of tracing one scenario
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioTrace {
    pub record: ScenarioRecord,
    /// The parsed trace, present when the scenario completed
    pub summary: Option<TraceSummary>,
}

impl From<ScenarioFailure> for ScenarioRecord {
    fn from(failure: ScenarioFailure) -> Self {
        ScenarioRecord::Failed {
            scenario_name: failure.scenario_name,
            reason: failure.reason,
        }
    }
}

/// Runs the target program once per scenario under external measurement tools.
///
/// Scenarios run one after the other, never concurrently, so that one scenario's threads and
/// system calls cannot leak into another's measurement. Every spawn blocks until the process
/// exits, the configured timeout elapses or a shutdown is requested. In the latter two cases the
/// process is killed.
pub struct ScenarioRunner<'a> {
    config: &'a TelemetryConfig,
    executor: &'a Executor,
    capability: TraceCapability,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(
        config: &'a TelemetryConfig,
        executor: &'a Executor,
        capability: TraceCapability,
    ) -> Self {
        Self {
            config,
            executor,
            capability,
        }
    }
}

impl ScenarioRunner<'_> {
    pub fn capability(&self) -> TraceCapability {
        self.capability
    }

    /// Trace every configured scenario and record its thread and operation counts.
    ///
    /// Returns one record per scenario in catalogue order. A scenario that fails is recorded as
    /// failed and the remaining scenarios still run. After a shutdown request the remaining
    /// scenarios are recorded as cancelled without being started. Without trace support nothing
    /// is run and the result is empty.
    pub fn run_all(&self, target: &Path) -> Vec<ScenarioRecord> {
        self.trace_all(target)
            .into_iter()
            .map(|trace| trace.record)
            .collect()
    }

    /// Like [ScenarioRunner::run_all], keeping the parsed trace of every completed scenario.
    pub fn trace_all(&self, target: &Path) -> Vec<ScenarioTrace> {
        if self.capability == TraceCapability::Unsupported {
            log::info!("Execution tracing is not supported on this platform, skipping scenarios");
            return Vec::new();
        }

        self.config
            .scenarios
            .iter()
            .map(|scenario| {
                if self.executor.shutdown_handle().is_shutdown() {
                    return ScenarioTrace {
                        record: ScenarioFailure::new(
                            &scenario.name,
                            ScenarioFailureReason::Cancelled,
                        )
                        .into(),
                        summary: None,
                    };
                }

                log::info!("Running scenario '{}'", scenario.name);
                let outcome = self.capture_trace(target, scenario).and_then(|summary| {
                    let metrics = metrics_from_summary(&scenario.name, &summary).ok_or_else(|| {
                        ScenarioFailure::new(
                            &scenario.name,
                            ScenarioFailureReason::Parse {
                                message: "thread or call counts do not fit in 64 bits"
                                    .to_string(),
                            },
                        )
                    })?;
                    Ok((metrics, summary))
                });

                match outcome {
                    Ok((metrics, summary)) => {
                        log::info!(
                            "Scenario '{}' used {} threads and {} system calls",
                            metrics.scenario_name,
                            metrics.thread_count,
                            metrics.syscall_count
                        );
                        ScenarioTrace {
                            record: ScenarioRecord::Completed(metrics),
                            summary: Some(summary),
                        }
                    }
                    Err(failure) => {
                        log::error!("{failure}");
                        ScenarioTrace {
                            record: failure.into(),
                            summary: None,
                        }
                    }
                }
            })
            .collect()
    }

    /// Run one scenario under the trace tool and parse its summary.
    pub fn capture_trace(
        &self,
        target: &Path,
        scenario: &ScenarioSpec,
    ) -> Result<TraceSummary, ScenarioFailure> {
        let fail = |reason| ScenarioFailure::new(&scenario.name, reason);
        if self.capability == TraceCapability::Unsupported {
            return Err(fail(ScenarioFailureReason::ToolUnavailable {
                tool: self.config.trace_tool.display().to_string(),
            }));
        }

        let tool = self.tool(&self.config.trace_tool, &scenario.name)?;
        let trace_file = tempfile::Builder::new()
            .prefix("tracebench-")
            .suffix(".strace")
            .tempfile()
            .map_err(|e| fail(spawn_reason(e)))?;

        let mut command = tokio::process::Command::new(tool);
        command
            .args(["-c", "-f", "-q", "-o"])
            .arg(trace_file.path())
            .arg(target)
            .args(&scenario.args);

        self.run_bounded(&scenario.name, command, self.config.scenario_timeout())?;

        let text = std::fs::read_to_string(trace_file.path()).map_err(|e| fail(spawn_reason(e)))?;
        TraceSummaryParser::parse(&text).map_err(|e| {
            fail(ScenarioFailureReason::Parse {
                message: e.to_string(),
            })
        })
    }

    /// Run one scenario under the resource-usage tool and return its report.
    pub fn measure_memory(
        &self,
        target: &Path,
        scenario: &ScenarioSpec,
    ) -> Result<String, ScenarioFailure> {
        let tool = self.tool(&self.config.memory_tool, &scenario.name)?;

        let mut command = tokio::process::Command::new(tool);
        command
            .args(&self.config.memory_tool_args)
            .arg(target)
            .args(&scenario.args);

        let output = self.run_bounded(&scenario.name, command, self.config.scenario_timeout())?;

        // time(1) writes its report to stderr, interleaved with whatever the target printed there.
        Ok(String::from_utf8_lossy(&output.stderr).into_owned())
    }

    /// Time every scenario with the benchmarking tool.
    ///
    /// Returns [None] if the tool is not installed, timings are optional.
    pub fn measure_exec_time(
        &self,
        target: &Path,
    ) -> Result<Option<BTreeMap<String, ExecTimeStats>>, ScenarioFailure> {
        let fail = |reason| ScenarioFailure::new(EXEC_TIME_LABEL, reason);
        let tool = match resolve_tool(&self.config.exec_time_tool) {
            Ok(tool) => tool,
            Err(e) => {
                log::warn!("Skipping execution time benchmark: {e}");
                return Ok(None);
            }
        };

        let export = tempfile::Builder::new()
            .prefix("tracebench-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| fail(spawn_reason(e)))?;

        let mut command = tokio::process::Command::new(tool);
        command
            .arg("--export-json")
            .arg(export.path())
            .arg("--warmup")
            .arg(self.config.exec_time_warmup.to_string())
            .args(
                self.config
                    .scenarios
                    .iter()
                    .map(|scenario| shell_command(target, &scenario.args)),
            );

        self.run_bounded(EXEC_TIME_LABEL, command, self.config.exec_time_timeout())?;

        let json = std::fs::read_to_string(export.path()).map_err(|e| fail(spawn_reason(e)))?;
        let names = self
            .config
            .scenarios
            .iter()
            .map(|scenario| scenario.name.as_str())
            .collect::<Vec<_>>();

        ExecTimeParser::parse(&json, &names)
            .map(Some)
            .map_err(|e| {
                fail(ScenarioFailureReason::Parse {
                    message: e.to_string(),
                })
            })
    }

    fn tool(&self, tool: &Path, scenario_name: &str) -> Result<PathBuf, ScenarioFailure> {
        resolve_tool(tool).map_err(|e| {
            log::debug!("{e}");
            ScenarioFailure::new(
                scenario_name,
                ScenarioFailureReason::ToolUnavailable {
                    tool: tool.display().to_string(),
                },
            )
        })
    }

    /// Spawn the command and wait for it, killing it and its descendants on timeout or shutdown.
    fn run_bounded(
        &self,
        scenario_name: &str,
        mut command: tokio::process::Command,
        timeout: Duration,
    ) -> Result<Output, ScenarioFailure> {
        let fail = |reason| ScenarioFailure::new(scenario_name, reason);
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        let spawned_program = program.clone();

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let outcome = self.executor.execute_in_place(async move {
            let child = command.spawn()?;
            log::debug!("Spawned '{spawned_program}' with PID {:?}", child.id());
            let group = ProcessGroupGuard::new(child.id());

            // Dropping the child and the guard on timeout or shutdown kills the whole group.
            let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
            if matches!(waited, Ok(Ok(_))) {
                group.disarm();
            }
            Ok::<_, std::io::Error>(waited)
        });

        let output = match outcome {
            Err(_cancelled) => return Err(fail(ScenarioFailureReason::Cancelled)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Could not start '{program}': {e}");
                return Err(fail(ScenarioFailureReason::ToolUnavailable { tool: program }));
            }
            Ok(Err(e)) => return Err(fail(spawn_reason(e))),
            Ok(Ok(Err(_elapsed))) => {
                return Err(fail(ScenarioFailureReason::TimedOut {
                    after_secs: timeout.as_secs(),
                }))
            }
            Ok(Ok(Ok(Err(e)))) => return Err(fail(spawn_reason(e))),
            Ok(Ok(Ok(Ok(output)))) => output,
        };

        if !output.status.success() {
            log::debug!(
                "Scenario '{scenario_name}' stderr: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(fail(ScenarioFailureReason::NonZeroExit {
                code: output.status.code(),
            }));
        }

        Ok(output)
    }
}

/// Kills the process group led by a spawned tool when dropped, unless the tool ran to
/// completion.
///
/// The tool is started as the leader of a new group, so its own children (the traced program
/// and anything that forks) receive the signal too.
struct ProcessGroupGuard {
    leader: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(leader: Option<u32>) -> Self {
        Self { leader }
    }

    fn disarm(mut self) {
        self.leader = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        let Some(leader) = self.leader.take() else {
            return;
        };
        log::trace!("Killing process group {leader}");

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, SIGKILL};
            use nix::unistd::Pid;

            let Ok(pid) = i32::try_from(leader) else {
                return;
            };
            if let Err(e) = killpg(Pid::from_raw(pid), SIGKILL) {
                // ESRCH, every member has already exited.
                log::debug!("Could not kill process group {leader}: {e}");
            }
        }
    }
}

/// Reduce a scenario's trace to its thread and operation counts.
///
/// Every thread-creating call adds a thread to the main one. The operation count is the total
/// row, or the sum of the rows if the tool printed no total. Returns [None] if a count does not
/// fit in a `u64`.
pub fn metrics_from_summary(
    scenario_name: &str,
    summary: &TraceSummary,
) -> Option<ScenarioMetrics> {
    let spawned = THREAD_CREATING_OPERATIONS
        .iter()
        .filter_map(|name| summary.get(name))
        .try_fold(0u64, |sum, op| sum.checked_add(op.calls))?;
    let syscall_count = match summary.total() {
        Some(total) => total.calls,
        None => summary.calls_excluding_total()?,
    };

    Some(ScenarioMetrics {
        scenario_name: scenario_name.to_string(),
        thread_count: spawned.checked_add(1)?,
        syscall_count,
    })
}

fn spawn_reason(e: std::io::Error) -> ScenarioFailureReason {
    ScenarioFailureReason::Spawn {
        message: e.to_string(),
    }
}

/// Render the target invocation as a single shell command, as the timing tool expects.
fn shell_command(target: &Path, args: &[String]) -> String {
    std::iter::once(target.display().to_string())
        .chain(args.iter().cloned())
        .map(|word| {
            if !word.is_empty()
                && word
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "/._-=:,+@%".contains(c))
            {
                word
            } else {
                format!("'{}'", word.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
