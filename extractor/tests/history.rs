use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use tracebench::aggregator::{AggregateError, BenchmarkRecordAggregator, RunInputs};
use tracebench::config::TelemetryConfig;
use tracebench::parse::{ExecTimeParser, MemoryReportParser, TraceSummaryParser};
use tracebench::scenario::metrics_from_summary;
use tracebench_model::{
    BuildInfo, HistoricalStore, ScenarioFailureReason, ScenarioRecord, StoreWriteError,
};

const STRACE_SUMMARY: &str = include_str!("../test_data/strace_summary.out");
const TIME_REPORT: &str = include_str!("../test_data/time.out");
const HYPERFINE: &str = include_str!("../test_data/hyperfine.json");

fn inputs(commit: &str) -> RunInputs {
    let trace = TraceSummaryParser::parse(STRACE_SUMMARY).unwrap();
    let hello = metrics_from_summary("hello", &trace).unwrap();

    RunInputs {
        build: BuildInfo {
            commit: Some(commit.to_string()),
            label: Some("release".to_string()),
        },
        memory: MemoryReportParser::parse(TIME_REPORT).unwrap(),
        artifacts: TelemetryConfig::default()
            .artifacts
            .iter()
            .map(|spec| (spec.name.clone(), 1024))
            .collect(),
        scenarios: vec![
            ScenarioRecord::Completed(hello),
            ScenarioRecord::Failed {
                scenario_name: "relative_import".to_string(),
                reason: ScenarioFailureReason::NonZeroExit { code: Some(1) },
            },
        ],
        exec_time: ExecTimeParser::parse(HYPERFINE, &["hello", "relative_import"]).unwrap(),
        trace,
    }
}

#[test]
fn appended_run_reads_back_identically() {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoricalStore::open(dir.path().join("history.jsonl"));
    let config = TelemetryConfig::default();
    let aggregator = BenchmarkRecordAggregator::new(&store, &config.artifacts);

    let run = aggregator.append(inputs("abc123")).unwrap();

    let stored = store.load_all().unwrap();
    assert_eq!(vec![run.clone()], stored);
    assert_eq!(704, stored[0].total().unwrap().calls);
    assert_eq!(123_269_120, stored[0].memory().max_resident_bytes);
    assert!(stored[0].scenarios()[1].is_failed());
    assert_eq!(2, stored[0].exec_time().len());
}

#[test]
fn history_keeps_every_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoricalStore::open(dir.path().join("history.jsonl"));
    let config = TelemetryConfig::default();
    let aggregator = BenchmarkRecordAggregator::new(&store, &config.artifacts);

    for commit in ["aaa", "bbb", "ccc"] {
        aggregator.append(inputs(commit)).unwrap();
    }

    let stored = store.load_all().unwrap();
    let commits = stored
        .iter()
        .map(|run| run.build().commit.clone().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(vec!["aaa", "bbb", "ccc"], commits);

    // Same label, artifacts and scenarios so the runs are comparable
    assert_eq!(stored[0].fingerprint(), stored[2].fingerprint());
}

#[test]
fn recent_window_is_exported() {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoricalStore::open(dir.path().join("history.jsonl"));
    let config = TelemetryConfig::default();
    let aggregator = BenchmarkRecordAggregator::new(&store, &config.artifacts);

    for commit in ["aaa", "bbb", "ccc"] {
        aggregator.append(inputs(commit)).unwrap();
    }

    let recent = dir.path().join("recent.json");
    assert_eq!(2, store.write_recent(&recent, 2).unwrap());

    let exported: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&recent).unwrap()).unwrap();
    assert_eq!(2, exported.len());
    assert_eq!("bbb", exported[0]["build"]["commit"]);
    assert_eq!("ccc", exported[1]["build"]["commit"]);
}

#[test]
fn seeded_history_is_extended() {
    let dir = tempfile::tempdir().unwrap();
    let config = TelemetryConfig::default();

    let baseline = HistoricalStore::open(dir.path().join("baseline.jsonl"));
    BenchmarkRecordAggregator::new(&baseline, &config.artifacts)
        .append(inputs("aaa"))
        .unwrap();

    let store = HistoricalStore::open(dir.path().join("history.jsonl"));
    assert!(store.seed_from(baseline.path()).unwrap());
    assert!(!store.seed_from(baseline.path()).unwrap());

    BenchmarkRecordAggregator::new(&store, &config.artifacts)
        .append(inputs("bbb"))
        .unwrap();

    assert_eq!(2, store.load_all().unwrap().len());
    assert_eq!(1, baseline.load_all().unwrap().len());
}

#[test]
fn held_lock_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    let store = HistoricalStore::open(&path).with_lock_timeout(std::time::Duration::from_millis(100));
    let config = TelemetryConfig::default();
    let aggregator = BenchmarkRecordAggregator::new(&store, &config.artifacts);

    aggregator.append(inputs("aaa")).unwrap();
    let before = std::fs::read(&path).unwrap();

    std::fs::write(dir.path().join("history.jsonl.lock"), b"").unwrap();
    let result = aggregator.append(inputs("bbb"));

    assert!(matches!(
        result,
        Err(AggregateError::Store(StoreWriteError::Locked { .. }))
    ));
    assert_eq!(before, std::fs::read(&path).unwrap());
}

#[test]
fn build_does_not_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoricalStore::open(dir.path().join("history.jsonl"));
    let aggregator = BenchmarkRecordAggregator::new(&store, &[]);

    let created_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let mut inputs = inputs("abc123");
    inputs.exec_time = BTreeMap::new();
    let run = aggregator.build(created_at, inputs).unwrap();

    assert_eq!("2024-01-02T03:04:05Z", run.created_at());
    assert!(run.exec_time().is_empty());
    assert!(!store.path().exists());
}
