//! Read-before-write bookkeeping for files touched by tools.
//!
//! A mutating tool may only write a path that was read earlier in the session and
//! whose modification time has not moved since. A successful write refreshes the
//! recorded time, so several edits in a row stay valid.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum FileTrackError {
    #[error("{} has not been read yet. Read the file before modifying it", .0.display())]
    NotRead(PathBuf),
    #[error("{} was modified since it was last read. Read it again before modifying it", .0.display())]
    ModifiedExternally(PathBuf),
    #[error("cannot stat {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FileTrackError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotRead(_) => "not_read",
            Self::ModifiedExternally(_) => "modified_externally",
            Self::Io { .. } => "io",
        }
    }
}

/// Shared handle over the per-session map of path to last observed mtime.
///
/// Clones share state. Serializes as a plain `{path: mtime}` map.
#[derive(Clone, Debug, Default)]
pub struct FileTracker {
    inner: Arc<Mutex<BTreeMap<PathBuf, SystemTime>>>,
}

impl FileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(entries: BTreeMap<PathBuf, SystemTime>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(entries)),
        }
    }

    /// Record the current modification time after a successful read.
    pub fn track(&self, path: &Path) -> Result<SystemTime, FileTrackError> {
        let mtime = modified_time(path)?;
        self.inner.lock().insert(path.to_path_buf(), mtime);
        Ok(mtime)
    }

    /// Record a modification time observed before the caller read the file.
    ///
    /// A write landing between that observation and this call still shows up
    /// as a change.
    pub fn record(&self, path: &Path, mtime: SystemTime) {
        self.inner.lock().insert(path.to_path_buf(), mtime);
    }

    /// Decide whether a write to `path` may proceed.
    ///
    /// Creating a file that neither exists nor was tracked is allowed. A tracked
    /// file that has since disappeared counts as modified externally.
    pub fn validate(&self, path: &Path) -> Result<(), FileTrackError> {
        let recorded = self.inner.lock().get(path).copied();
        match (recorded, path.exists()) {
            (None, false) => Ok(()),
            (None, true) => Err(FileTrackError::NotRead(path.to_path_buf())),
            (Some(_), false) => Err(FileTrackError::ModifiedExternally(path.to_path_buf())),
            (Some(recorded), true) => {
                if modified_time(path)? == recorded {
                    Ok(())
                } else {
                    Err(FileTrackError::ModifiedExternally(path.to_path_buf()))
                }
            }
        }
    }

    /// Refresh the recorded time after the tool's own write succeeded.
    pub fn record_write(&self, path: &Path) -> Result<(), FileTrackError> {
        self.track(path).map(|_| ())
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.inner.lock().contains_key(path)
    }

    /// Tracked paths whose modification time no longer matches (or that vanished).
    pub fn changed_files(&self) -> Vec<PathBuf> {
        let entries = self.snapshot();
        entries
            .into_iter()
            .filter(|(path, recorded)| match modified_time(path) {
                Ok(now) => now != *recorded,
                Err(_) => true,
            })
            .map(|(path, _)| path)
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<PathBuf, SystemTime> {
        self.inner.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl PartialEq for FileTracker {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl Serialize for FileTracker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileTracker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::<PathBuf, SystemTime>::deserialize(deserializer).map(Self::from_snapshot)
    }
}

fn modified_time(path: &Path) -> Result<SystemTime, FileTrackError> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|source| FileTrackError::Io {
            path: path.to_path_buf(),
            source,
        })
}
