use std::path::{Path, PathBuf};

/// An external tool that could not be located
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Path to '{}' was configured but that path doesn't exist", .0.display())]
    MissingPath(PathBuf),
    #[error("'{name}' not found in PATH, install it or configure its full path")]
    NotInPath {
        name: String,
        #[source]
        source: which::Error,
    },
}

/// Resolve a configured tool to an executable path.
///
/// A bare name such as `strace` is looked up in the user's `PATH`, anything with a directory
/// component is used as given and must exist.
pub fn resolve_tool(tool: &Path) -> Result<PathBuf, ToolError> {
    let is_bare_name = tool.components().count() == 1 && !tool.is_absolute();
    if is_bare_name {
        log::debug!("'{}' is not a path so looking in user's 'PATH'", tool.display());
        return which::which(tool).map_err(|source| ToolError::NotInPath {
            name: tool.display().to_string(),
            source,
        });
    }

    if tool.exists() {
        Ok(tool.to_path_buf())
    } else {
        Err(ToolError::MissingPath(tool.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn configured_path_must_exist() {
        let result = resolve_tool(Path::new("/non/existent/path/to/strace"));
        assert!(matches!(result, Err(ToolError::MissingPath(_))));
    }

    #[test]
    fn configured_path_is_used_as_given() {
        let temp = NamedTempFile::new().expect("failed to create temp file");
        let result = resolve_tool(temp.path()).expect("failed to resolve tool");
        assert_eq!(temp.path(), result);
    }

    #[test]
    fn unknown_bare_name_is_an_error() {
        let result = resolve_tool(Path::new("tracebench-definitely-not-installed"));
        assert!(matches!(result, Err(ToolError::NotInPath { .. })));
    }
}
