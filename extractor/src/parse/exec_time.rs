use std::collections::BTreeMap;

use serde::Deserialize;
use tracebench_model::ExecTimeStats;

use super::{ParseError, SourceFormat};

/// Reads the JSON document written by `hyperfine --export-json`
pub struct ExecTimeParser;

#[derive(Debug, Deserialize)]
struct HyperfineExport {
    results: Vec<HyperfineResult>,
}

#[derive(Debug, Deserialize)]
struct HyperfineResult {
    command: String,
    mean: f64,
    /// hyperfine writes `null` when a command was only run once
    stddev: Option<f64>,
    user: f64,
    system: f64,
    min: f64,
    max: f64,
}

impl ExecTimeParser {
    /// Parse the export, naming the results after `scenario_names`.
    ///
    /// hyperfine reports results in the order the commands were given, so the names must be in
    /// the same order as the commands that were benchmarked.
    pub fn parse(
        json: &str,
        scenario_names: &[&str],
    ) -> Result<BTreeMap<String, ExecTimeStats>, ParseError> {
        let export: HyperfineExport = serde_json::from_str(json).map_err(|e| {
            let error = ParseError::new(SourceFormat::ExecTime, e.to_string());
            match json.lines().nth(e.line().saturating_sub(1)) {
                Some(line) if e.line() > 0 => error.at_line(e.line(), line),
                _ => error,
            }
        })?;

        if export.results.len() != scenario_names.len() {
            return Err(ParseError::new(
                SourceFormat::ExecTime,
                format!(
                    "expected {} results but found {}",
                    scenario_names.len(),
                    export.results.len()
                ),
            ));
        }

        Ok(scenario_names
            .iter()
            .zip(export.results)
            .map(|(name, result)| {
                log::debug!("Timing for scenario '{name}' from command '{}'", result.command);
                (
                    name.to_string(),
                    ExecTimeStats {
                        mean: result.mean,
                        stddev: result.stddev,
                        user: result.user,
                        system: result.system,
                        min: result.min,
                        max: result.max,
                    },
                )
            })
            .collect())
    }
}
