//! Persistent container state.
//!
//! Each container owns a directory under the state root holding its
//! metadata record and, for detached containers, its output log. The
//! store is daemon-less: every invocation reads the records it needs and
//! refreshes stale statuses on the way.

use std::io::ErrorKind;

use cellar_common::config::RuntimePaths;
use cellar_common::error::{CellarError, Result};
use cellar_common::persist::{self, RecordLock};

use crate::container::ContainerRecord;

/// Exclusive hold on a container name while its container is created.
///
/// The lock file sits next to the container directory, so it outlives
/// the directory being removed by a rollback.
#[derive(Debug)]
pub struct NameClaim {
    _lock: RecordLock,
}

/// Reads and writes container records under a [`RuntimePaths`] layout.
#[derive(Debug, Clone)]
pub struct ContainerStore {
    paths: RuntimePaths,
}

impl ContainerStore {
    /// Creates a store over `paths`.
    #[must_use]
    pub const fn new(paths: RuntimePaths) -> Self {
        Self { paths }
    }

    /// Returns `true` if a record named `name` exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.paths.container_record(name).is_file()
    }

    /// Reserves `name` for a new container.
    ///
    /// Blocks while another invocation holds the same name, then checks
    /// that no record exists under it.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Config`] if the name is taken, or an error
    /// if the lock cannot be taken.
    pub fn claim(&self, name: &str) -> Result<NameClaim> {
        let lock = persist::lock(&self.paths.container_dir(name))?;
        if self.exists(name) {
            return Err(CellarError::config(format!(
                "container name {name} is already in use"
            )));
        }
        Ok(NameClaim { _lock: lock })
    }

    /// Writes `record` under its name.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.paths.container_record(&record.name);
        let _lock = persist::lock(&path)?;
        persist::dump(&path, record)
    }

    /// Loads the record named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] if there is no such container.
    pub fn load(&self, name: &str) -> Result<ContainerRecord> {
        persist::load(&self.paths.container_record(name))?.ok_or_else(|| CellarError::NotFound {
            kind: "container",
            id: name.to_owned(),
        })
    }

    /// Applies `f` to the record named `name` and writes it back under
    /// the record lock.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] if there is no such container,
    /// or an error from `f` or the write.
    pub fn update<F>(&self, name: &str, f: F) -> Result<ContainerRecord>
    where
        F: FnOnce(&mut ContainerRecord),
    {
        let path = self.paths.container_record(name);
        let _lock = persist::lock(&path)?;
        let mut record = self.load(name)?;
        f(&mut record);
        persist::dump(&path, &record)?;
        Ok(record)
    }

    /// Lists every record, sorted by name, with statuses refreshed.
    ///
    /// Records whose status changed are written back. Unreadable records
    /// are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the containers directory cannot be listed.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let dir = self.paths.containers_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CellarError::io(&dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CellarError::io(&dir, e))?;
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.refreshed(&name) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(container = %name, error = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Deletes the record directory of `name`, log included.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn remove(&self, name: &str) -> Result<()> {
        let dir = self.paths.container_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(container = name, "record removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CellarError::io(&dir, e)),
        }
    }

    fn refreshed(&self, name: &str) -> Result<Option<ContainerRecord>> {
        let path = self.paths.container_record(name);
        let _lock = persist::lock(&path)?;
        let Some(mut record) = persist::load::<ContainerRecord>(&path)? else {
            return Ok(None);
        };
        if record.refresh_status() {
            tracing::info!(container = name, pid = record.pid, "container exited");
            persist::dump(&path, &record)?;
        }
        Ok(Some(record))
    }
}
