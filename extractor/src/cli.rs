use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(about, long_about = None)]
pub struct CliArgs {
    /// Build output directory containing the tracked artifacts.
    #[arg(long, env = "TRACEBENCH_BUILD_DIR")]
    pub build_dir: PathBuf,

    /// Executable to run the scenarios against.
    ///
    /// Defaults to the executable artifact inside the build directory.
    #[arg(long)]
    pub target: Option<PathBuf>,

    /// Path to the historical store that runs are appended to.
    #[arg(long, default_value = "benchmark_history.jsonl", env = "TRACEBENCH_STORE")]
    pub store: PathBuf,

    /// TOML file overriding tools, scenarios and artifacts.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Commit the build was made from.
    #[arg(long)]
    pub commit: Option<String>,

    /// Free-form label for the build, part of the run fingerprint.
    #[arg(long)]
    pub label: Option<String>,

    /// Use a previously captured trace summary instead of tracing the primary scenario.
    #[arg(long)]
    pub trace_summary: Option<PathBuf>,

    /// Use a previously captured memory report instead of measuring the primary scenario.
    #[arg(long)]
    pub memory_report: Option<PathBuf>,

    /// History to initialise the store from when it does not exist yet.
    #[arg(long)]
    pub baseline: Option<PathBuf>,

    /// Also write the most recent runs to this file as a JSON array.
    #[arg(long)]
    pub recent: Option<PathBuf>,

    /// Number of runs to write to the recent file.
    #[arg(long, default_value_t = 20)]
    pub recent_count: usize,

    /// Skip the wall-clock timing benchmark.
    #[arg(long)]
    pub skip_exec_time: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_arguments() {
        let args = CliArgs::try_parse_from(["tracebench", "--build-dir", "target/release"]).unwrap();

        assert_eq!(PathBuf::from("target/release"), args.build_dir);
        assert_eq!(20, args.recent_count);
        assert!(args.target.is_none());
        assert!(!args.skip_exec_time);
    }

    #[test]
    fn pre_captured_inputs() {
        let args = CliArgs::try_parse_from([
            "tracebench",
            "--build-dir",
            "out",
            "--trace-summary",
            "trace.out",
            "--memory-report",
            "time.out",
            "--commit",
            "abc123",
            "--skip-exec-time",
        ])
        .unwrap();

        assert_eq!(Some(PathBuf::from("trace.out")), args.trace_summary);
        assert_eq!(Some(PathBuf::from("time.out")), args.memory_report);
        assert_eq!(Some("abc123".to_string()), args.commit);
        assert!(args.skip_exec_time);
    }
}
