use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracebench_model::ArtifactKind;

/// Everything the pipeline needs to know about tools, scenarios and artifacts
///
/// Constructed once at startup, from [TelemetryConfig::default] or a TOML file, and passed to every
/// component that needs it. Keys missing from the file keep their default value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// The execution-trace tool, a path or a name to look up in `PATH`
    pub trace_tool: PathBuf,
    /// The resource-usage tool used to measure peak memory
    pub memory_tool: PathBuf,
    /// Arguments passed to the memory tool before the target command
    pub memory_tool_args: Vec<String>,
    /// The wall-clock benchmarking tool
    pub exec_time_tool: PathBuf,
    /// Warmup runs per scenario before timing
    pub exec_time_warmup: u32,
    /// Upper bound for one traced or measured scenario
    pub scenario_timeout_secs: u64,
    /// Upper bound for the whole timing benchmark
    pub exec_time_timeout_secs: u64,
    /// The scenario whose trace is recorded as the run's operation statistics
    ///
    /// Defaults to the first scenario.
    pub primary_scenario: Option<String>,
    #[serde(rename = "scenario")]
    pub scenarios: Vec<ScenarioSpec>,
    #[serde(rename = "artifact")]
    pub artifacts: Vec<ArtifactSpec>,
}

/// A named workload: the arguments the target is run with
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A build output whose size is tracked, relative to the build directory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    pub name: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            trace_tool: PathBuf::from("strace"),
            memory_tool: PathBuf::from("/usr/bin/time"),
            memory_tool_args: vec!["-v".to_string()],
            exec_time_tool: PathBuf::from("hyperfine"),
            exec_time_warmup: 3,
            scenario_timeout_secs: 120,
            exec_time_timeout_secs: 600,
            primary_scenario: None,
            scenarios: vec![
                ScenarioSpec {
                    name: "hello".to_string(),
                    args: vec!["tests/002_hello.ts".to_string(), "--reload".to_string()],
                },
                ScenarioSpec {
                    name: "relative_import".to_string(),
                    args: vec![
                        "tests/003_relative_import.ts".to_string(),
                        "--reload".to_string(),
                    ],
                },
            ],
            artifacts: default_artifacts(),
        }
    }
}

fn default_artifacts() -> Vec<ArtifactSpec> {
    vec![
        ArtifactSpec {
            name: "runtime".to_string(),
            kind: ArtifactKind::Executable,
            path: PathBuf::from(format!("runtime{}", std::env::consts::EXE_SUFFIX)),
        },
        ArtifactSpec {
            name: "main.js".to_string(),
            kind: ArtifactKind::ScriptBundle,
            path: PathBuf::from("gen/bundle/main.js"),
        },
        ArtifactSpec {
            name: "main.js.map".to_string(),
            kind: ArtifactKind::SourceMap,
            path: PathBuf::from("gen/bundle/main.js.map"),
        },
        ArtifactSpec {
            name: "snapshot.bin".to_string(),
            kind: ArtifactKind::SnapshotBlob,
            path: PathBuf::from("gen/snapshot.bin"),
        },
    ]
}

impl TelemetryConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded config from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenarios.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one scenario is required".to_string(),
            ));
        }
        if self.scenario_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "scenario_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for scenario in &self.scenarios {
            if !names.insert(scenario.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "scenario '{}' is defined more than once",
                    scenario.name
                )));
            }
        }

        let mut names = HashSet::new();
        for artifact in &self.artifacts {
            if !names.insert(artifact.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "artifact '{}' is defined more than once",
                    artifact.name
                )));
            }
        }

        if let Some(primary) = &self.primary_scenario {
            if !self.scenarios.iter().any(|s| &s.name == primary) {
                return Err(ConfigError::Invalid(format!(
                    "primary scenario '{primary}' is not defined"
                )));
            }
        }

        Ok(())
    }

    pub fn scenario_timeout(&self) -> Duration {
        Duration::from_secs(self.scenario_timeout_secs)
    }

    pub fn exec_time_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_time_timeout_secs)
    }

    /// The scenario whose trace becomes the run's operation statistics.
    pub fn primary(&self) -> Option<&ScenarioSpec> {
        match &self.primary_scenario {
            Some(name) => self.scenarios.iter().find(|s| &s.name == name),
            None => self.scenarios.first(),
        }
    }

    /// Where the target executable lives inside a build directory.
    pub fn executable_in(&self, build_dir: &Path) -> Option<PathBuf> {
        self.artifacts
            .iter()
            .find(|artifact| artifact.kind == ArtifactKind::Executable)
            .map(|artifact| build_dir.join(&artifact.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TelemetryConfig::default();
        config.validate().unwrap();

        assert_eq!("hello", config.primary().unwrap().name);
        assert_eq!(4, config.artifacts.len());
        assert_eq!(Duration::from_secs(120), config.scenario_timeout());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = TelemetryConfig::from_toml_str(
            r#"
trace_tool = "/opt/strace/bin/strace"
scenario_timeout_secs = 30
primary_scenario = "startup"

[[scenario]]
name = "hello"
args = ["hello.js"]

[[scenario]]
name = "startup"
"#,
        )
        .unwrap();

        assert_eq!(PathBuf::from("/opt/strace/bin/strace"), config.trace_tool);
        assert_eq!(PathBuf::from("hyperfine"), config.exec_time_tool);
        assert_eq!(30, config.scenario_timeout_secs);
        assert_eq!(2, config.scenarios.len());
        assert!(config.scenarios[1].args.is_empty());
        assert_eq!("startup", config.primary().unwrap().name);
        assert_eq!(TelemetryConfig::default().artifacts, config.artifacts);
    }

    #[test]
    fn artifacts_can_be_replaced() {
        let config = TelemetryConfig::from_toml_str(
            r#"
[[artifact]]
name = "app"
kind = "executable"
path = "bin/app"
"#,
        )
        .unwrap();

        assert_eq!(1, config.artifacts.len());
        assert_eq!(
            Some(PathBuf::from("out/bin/app")),
            config.executable_in(Path::new("out"))
        );
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(matches!(
            TelemetryConfig::from_toml_str("scenario = []"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TelemetryConfig::from_toml_str(
                "[[scenario]]\nname = \"a\"\n[[scenario]]\nname = \"a\"\n"
            ),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TelemetryConfig::from_toml_str("primary_scenario = \"missing\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TelemetryConfig::from_toml_str("unknown_key = 1"),
            Err(ConfigError::Toml(_))
        ));
    }
}
