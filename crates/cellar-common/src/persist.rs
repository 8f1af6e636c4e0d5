//! Small JSON records on disk.
//!
//! Records are rewritten whole on every save. Read-modify-write cycles on
//! files shared between invocations run under an exclusive `flock(2)` on a
//! sidecar `<file>.lock`, held for the whole cycle.

use std::ffi::OsString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::constants::MAX_RECORD_BYTES;
use crate::error::{CellarError, Result};

/// Exclusive lock over a persisted record. Released on drop.
pub struct RecordLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl fmt::Debug for RecordLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordLock").field("path", &self.path).finish_non_exhaustive()
    }
}

impl RecordLock {
    /// Path of the sidecar lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Returns the sidecar lock file guarding `record`.
#[must_use]
pub fn lock_path(record: &Path) -> PathBuf {
    let mut name = record
        .file_name()
        .map_or_else(OsString::new, ToOwned::to_owned);
    name.push(".lock");
    record.with_file_name(name)
}

/// Blocks until an exclusive lock on `record` is held.
///
/// # Errors
///
/// Returns an error if the lock file cannot be created or locked.
pub fn lock(record: &Path) -> Result<RecordLock> {
    let path = lock_path(record);
    ensure_parent(&path)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| CellarError::io(&path, e))?;
    let lock = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| CellarError::io(&path, errno.into()))?;
    tracing::trace!(path = %path.display(), "record lock acquired");
    Ok(RecordLock { _lock: lock, path })
}

/// Reads and deserializes a record. A missing file yields `None`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, exceeds
/// [`MAX_RECORD_BYTES`], or is not valid JSON for `T`.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CellarError::io(path, e)),
    };
    let mut bytes = Vec::new();
    let _ = file
        .take(MAX_RECORD_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| CellarError::io(path, e))?;
    if bytes.len() as u64 > MAX_RECORD_BYTES {
        return Err(CellarError::config(format!(
            "record {} exceeds {MAX_RECORD_BYTES} bytes",
            path.display()
        )));
    }
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Serializes `value` and replaces the file contents with it.
///
/// # Errors
///
/// Returns an error if the parent directory or file cannot be written.
pub fn dump<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let bytes = serde_json::to_vec(value)?;
    let mut file = File::create(path).map_err(|e| CellarError::io(path, e))?;
    file.write_all(&bytes).map_err(|e| CellarError::io(path, e))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "record written");
    Ok(())
}

/// Loads `path` (or `T::default()` if absent), applies `f`, and writes the
/// result back, all under the record's exclusive lock.
///
/// Nothing is written if `f` fails.
///
/// # Errors
///
/// Returns an error from locking, loading, `f`, or writing.
pub fn update<T, R, F>(path: &Path, f: F) -> Result<R>
where
    T: DeserializeOwned + Serialize + Default,
    F: FnOnce(&mut T) -> Result<R>,
{
    let _lock = lock(path)?;
    let mut value = load(path)?.unwrap_or_default();
    let out = f(&mut value)?;
    dump(path, &value)?;
    Ok(out)
}

/// Removes a record file. A missing file is not an error.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be removed.
pub fn remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CellarError::io(path, e)),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CellarError::io(parent, e))?;
    }
    Ok(())
}
