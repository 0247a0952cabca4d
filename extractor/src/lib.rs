//! Extracts execution-trace, memory and build-size telemetry from benchmark runs of a target
//! program and records one [tracebench_model::BenchmarkRun] per invocation.

pub mod aggregator;
pub mod artifacts;
pub mod config;
pub mod parse;
pub mod pipeline;
pub mod scenario;
pub mod tools;
