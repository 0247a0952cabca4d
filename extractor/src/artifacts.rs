use std::path::{Path, PathBuf};

use tracebench_model::{ArtifactKind, ArtifactSizes};

use crate::config::ArtifactSpec;

/// A required build output is not where it should be
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Missing build artifact '{name}' ({kind}), expected at {}", .path.display())]
pub struct MissingArtifactError {
    pub name: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Missing(#[from] MissingArtifactError),
    #[error("Cannot measure build artifact '{name}' at {}: {source}", .path.display())]
    Unreadable {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Build artifact '{name}' at {} is not a file", .path.display())]
    NotAFile { name: String, path: PathBuf },
}

/// Measures the size of a fixed set of build outputs.
pub struct ArtifactSizeCollector<'a> {
    specs: &'a [ArtifactSpec],
}

impl<'a> ArtifactSizeCollector<'a> {
    pub fn new(specs: &'a [ArtifactSpec]) -> Self {
        Self { specs }
    }
}

impl ArtifactSizeCollector<'_> {
    /// Measure every artifact below `build_dir`.
    ///
    /// Any missing artifact fails the whole collection, a partial set of sizes is never returned.
    /// Empty files are measured as 0 bytes.
    pub fn collect(&self, build_dir: &Path) -> Result<ArtifactSizes, ArtifactError> {
        log::debug!("Measuring build artifacts in {}", build_dir.display());

        self.specs
            .iter()
            .map(|spec| {
                let size = Self::measure(spec, build_dir)?;
                log::debug!("Artifact '{}' is {size} bytes", spec.name);
                Ok((spec.name.clone(), size))
            })
            .collect()
    }

    fn measure(spec: &ArtifactSpec, build_dir: &Path) -> Result<u64, ArtifactError> {
        let path = build_dir.join(&spec.path);
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MissingArtifactError {
                    name: spec.name.clone(),
                    kind: spec.kind,
                    path,
                }
                .into());
            }
            Err(source) => {
                return Err(ArtifactError::Unreadable {
                    name: spec.name.clone(),
                    path,
                    source,
                })
            }
        };

        if !metadata.is_file() {
            return Err(ArtifactError::NotAFile {
                name: spec.name.clone(),
                path,
            });
        }
        if metadata.len() == 0 {
            log::warn!("Build artifact '{}' at {} is empty", spec.name, path.display());
        }

        Ok(metadata.len())
    }
}
