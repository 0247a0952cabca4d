use std::fs::{File, OpenOptions, Permissions};
use std::io::{BufRead, BufReader, Lines, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::BenchmarkRun;

/// Mode of a newly created store or export file.
#[cfg(unix)]
const NEW_FILE_MODE: u32 = 0o644;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Append-only history of benchmark runs
///
/// The store is a JSON Lines file, one [BenchmarkRun] per line. The recommended file extension is
/// `.jsonl`. Existing lines are never rewritten: an append copies the current bytes verbatim into a
/// staging file next to the store, adds the new line and renames the staging file over the store.
/// Writers serialize on a `<store>.lock` file.
#[derive(Debug, Clone)]
pub struct HistoricalStore {
    path: PathBuf,
    lock_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreWriteError {
    #[error("Historical store {path} is locked by another writer, remove {lock} if it is stale")]
    Locked { path: PathBuf, lock: PathBuf },
    #[error("Failed to write historical store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize benchmark run: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to read historical store: {0}")]
    Read(#[from] StoreReadError),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreReadError {
    #[error("Failed to read historical store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid benchmark run on line {line_number}: {source}")]
    Parse {
        line_number: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl HistoricalStore {
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// How long an append waits for another writer to release the lock.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Create the staging file that will replace the store, with the store's permissions.
    fn stage(
        &self,
        permissions: Option<Permissions>,
    ) -> Result<tempfile::NamedTempFile, StoreWriteError> {
        let staged = tempfile::Builder::new()
            .prefix(".tracebench-")
            .suffix(".jsonl.tmp")
            .tempfile_in(self.dir())
            .map_err(|e| self.io_error(e))?;
        if let Some(permissions) = permissions {
            staged
                .as_file()
                .set_permissions(permissions)
                .map_err(|e| self.io_error(e))?;
        }

        Ok(staged)
    }

    fn io_error(&self, source: std::io::Error) -> StoreWriteError {
        StoreWriteError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Append one run. Either the whole line is added or the store is left as it was.
    pub fn append(&self, run: &BenchmarkRun) -> Result<(), StoreWriteError> {
        let mut line = serde_json::to_vec(run)?;
        line.push(b'\n');

        let _lock = StoreLock::acquire(self.lock_path(), self.lock_timeout, &self.path)?;

        let permissions = permissions_of(&self.path).map_err(|e| self.io_error(e))?;
        let mut staged = self.stage(permissions)?;

        match File::open(&self.path) {
            Ok(mut existing) => {
                let copied = std::io::copy(&mut existing, staged.as_file_mut())
                    .map_err(|e| self.io_error(e))?;
                if copied > 0 && !ends_with_newline(&mut existing).map_err(|e| self.io_error(e))? {
                    log::warn!(
                        "Historical store {} did not end with a newline, terminating the last line",
                        self.path.display()
                    );
                    staged.write_all(b"\n").map_err(|e| self.io_error(e))?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Creating historical store {}", self.path.display());
            }
            Err(e) => return Err(self.io_error(e)),
        }

        staged.write_all(&line).map_err(|e| self.io_error(e))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|e| self.io_error(e))?;
        staged
            .persist(&self.path)
            .map_err(|e| self.io_error(e.error))?;

        log::debug!("Appended benchmark run to {}", self.path.display());

        Ok(())
    }

    /// Initialise a missing store from a baseline history.
    ///
    /// Does nothing if the store already exists. If the baseline does not exist either, an empty
    /// store is created. Returns whether the store was created.
    pub fn seed_from(&self, baseline: &Path) -> Result<bool, StoreWriteError> {
        let _lock = StoreLock::acquire(self.lock_path(), self.lock_timeout, &self.path)?;
        if self.path.exists() {
            return Ok(false);
        }

        let permissions = permissions_of(&self.path).map_err(|e| self.io_error(e))?;
        let mut staged = self.stage(permissions)?;

        match File::open(baseline) {
            Ok(mut source) => {
                // Validate before adopting it, a broken baseline must not become history.
                let runs =
                    read_runs(File::open(baseline).map_err(|e| self.io_error(e))?, baseline)?;
                std::io::copy(&mut source, staged.as_file_mut()).map_err(|e| self.io_error(e))?;
                if !runs.is_empty()
                    && !ends_with_newline(&mut source).map_err(|e| self.io_error(e))?
                {
                    staged.write_all(b"\n").map_err(|e| self.io_error(e))?;
                }
                log::info!(
                    "Seeded historical store {} with {} runs from {}",
                    self.path.display(),
                    runs.len(),
                    baseline.display()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "Baseline {} not found, starting an empty historical store",
                    baseline.display()
                );
            }
            Err(e) => return Err(self.io_error(e)),
        }

        staged
            .as_file()
            .sync_all()
            .map_err(|e| self.io_error(e))?;
        staged
            .persist(&self.path)
            .map_err(|e| self.io_error(e.error))?;

        Ok(true)
    }

    /// Iterate over the stored runs without loading the whole file.
    ///
    /// A missing store yields no runs.
    pub fn iter(&self) -> Result<StoreIter<File>, StoreReadError> {
        match File::open(&self.path) {
            Ok(file) => Ok(StoreIter::new(file, &self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreIter::empty(&self.path)),
            Err(source) => Err(StoreReadError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Load every stored run, oldest first.
    pub fn load_all(&self) -> Result<Vec<BenchmarkRun>, StoreReadError> {
        self.iter()?.collect()
    }

    /// Write the most recent `count` runs to `out` as a single JSON array.
    ///
    /// Returns the number of runs written.
    pub fn write_recent(&self, out: &Path, count: usize) -> Result<usize, StoreWriteError> {
        let runs = self.load_all()?;
        let recent = &runs[runs.len().saturating_sub(count)..];

        let out_dir = match out.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let out_error = |source| StoreWriteError::Io {
            path: out.to_path_buf(),
            source,
        };

        let mut staged = tempfile::NamedTempFile::new_in(out_dir).map_err(out_error)?;
        if let Some(permissions) = permissions_of(out).map_err(out_error)? {
            staged
                .as_file()
                .set_permissions(permissions)
                .map_err(out_error)?;
        }
        serde_json::to_writer(&mut staged, recent)?;
        staged.persist(out).map_err(|e| out_error(e.error))?;

        Ok(recent.len())
    }
}

/// Line-by-line reader over a JSON Lines history
pub struct StoreIter<R> {
    lines: Option<Lines<BufReader<R>>>,
    path: PathBuf,
    line_number: usize,
}

impl<R: Read> StoreIter<R> {
    pub fn new(reader: R, path: &Path) -> Self {
        Self {
            lines: Some(BufReader::new(reader).lines()),
            path: path.to_path_buf(),
            line_number: 0,
        }
    }

    fn empty(path: &Path) -> Self {
        Self {
            lines: None,
            path: path.to_path_buf(),
            line_number: 0,
        }
    }
}

impl<R: Read> Iterator for StoreIter<R> {
    type Item = Result<BenchmarkRun, StoreReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(source) => {
                    return Some(Err(StoreReadError::Io {
                        path: self.path.clone(),
                        source,
                    }))
                }
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }

            return Some(serde_json::from_str(&line).map_err(|source| StoreReadError::Parse {
                line_number: self.line_number,
                source,
            }));
        }
    }
}

fn read_runs<R: Read>(reader: R, path: &Path) -> Result<Vec<BenchmarkRun>, StoreReadError> {
    StoreIter::new(reader, path).collect()
}

/// Permissions a replacement for `path` should get: those of the existing file, or the usual
/// mode for a new file. Staging files start out as `0600`.
fn permissions_of(path: &Path) -> std::io::Result<Option<Permissions>> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.permissions())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(new_file_permissions()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn new_file_permissions() -> Option<Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(Permissions::from_mode(NEW_FILE_MODE))
}

#[cfg(not(unix))]
fn new_file_permissions() -> Option<Permissions> {
    None
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Exclusive writer lock, held for as long as the value lives
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(path: PathBuf, timeout: Duration, store: &Path) -> Result<Self, StoreWriteError> {
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // The pid only helps a human find the owner of a stale lock.
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= timeout {
                        return Err(StoreWriteError::Locked {
                            path: store.to_path_buf(),
                            lock: path,
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(StoreWriteError::Io {
                        path: store.to_path_buf(),
                        source,
                    })
                }
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::error!("Failed to release store lock {}: {e}", self.path.display());
        }
    }
}
