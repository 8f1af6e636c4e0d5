//! Unified error types for the cellar workspace.
//!
//! Every library crate returns [`CellarError`]. Operations that fan out
//! over several independent steps (cgroup subsystems, teardown) collect
//! per-step failures in a [`StepErrors`] accumulator and surface them as
//! a single [`CellarError::Partial`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CellarError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A flag, mapping, or other configuration value is malformed.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A layer or mount directory could not be created.
    #[error("failed to create directory {path}: {source}")]
    Directory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An image archive is missing or could not be unpacked.
    #[error("failed to extract image {image}: {message}")]
    Extraction {
        /// Image name.
        image: String,
        /// Description of the failure.
        message: String,
    },

    /// A `mount(2)` or `umount2(2)` call failed.
    #[error("mount operation on {target} failed: {source}")]
    Mount {
        /// Mount target.
        target: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// One step of the root-filesystem pivot failed.
    #[error("root transition failed during {step}: {source}")]
    RootTransition {
        /// Name of the failing step.
        step: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The init process received no command to execute.
    #[error("no command received on the init channel")]
    MissingCommand,

    /// A bounded wait expired.
    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What was being waited on.
        operation: &'static str,
        /// How long the wait lasted.
        after: Duration,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The subnet has too many host bits to track in a bitmap.
    #[error("subnet {subnet} is too large to allocate from")]
    SubnetTooLarge {
        /// Offending subnet.
        subnet: String,
    },

    /// Every host address in the subnet is allocated.
    #[error("no usable address left in subnet {subnet}")]
    AddressExhausted {
        /// Exhausted subnet.
        subnet: String,
    },

    /// The address is not a releasable host address of the subnet.
    #[error("address {ip} is not a valid host address of {subnet}")]
    InvalidAddress {
        /// Offending address.
        ip: String,
        /// Subnet it was checked against.
        subnet: String,
    },

    /// A network or interface with this name already exists.
    #[error("network {name} already exists")]
    NetworkExists {
        /// Conflicting name.
        name: String,
    },

    /// A link, address, or namespace operation on an interface failed.
    #[error("link operation {op} on {name} failed: {message}")]
    Link {
        /// Operation that failed.
        op: &'static str,
        /// Interface name.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// Writing to a cgroup control file failed.
    #[error("cgroup {subsystem} at {path}: {source}")]
    Cgroup {
        /// Subsystem name.
        subsystem: String,
        /// File or directory that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An external helper program exited unsuccessfully.
    #[error("{program} failed: {message}")]
    ExternalCommand {
        /// Program name.
        program: String,
        /// Captured stderr or spawn error.
        message: String,
    },

    /// The operation exists but is not implemented by this driver.
    #[error("{operation} is not supported")]
    Unsupported {
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    /// One or more independent steps failed; the rest were still attempted.
    #[error("{operation} partially failed: {failures}")]
    Partial {
        /// Operation that fanned out.
        operation: &'static str,
        /// Per-step failures, in the order they occurred.
        failures: StepErrors,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CellarError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a configuration error from any displayable message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CellarError>;

/// One failed step inside a fan-out operation.
#[derive(Debug)]
pub struct StepFailure {
    /// Subsystem or operation name.
    pub step: String,
    /// Why it failed.
    pub error: CellarError,
}

/// Accumulates per-step failures without aborting the remaining steps.
#[derive(Debug, Default)]
pub struct StepErrors {
    failures: Vec<StepFailure>,
}

impl StepErrors {
    /// Creates an empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            failures: Vec::new(),
        }
    }

    /// Records a failure for `step`.
    pub fn push(&mut self, step: impl Into<String>, error: CellarError) {
        self.failures.push(StepFailure {
            step: step.into(),
            error,
        });
    }

    /// Records the error of `result`, if any, and passes the value through.
    pub fn record<T>(&mut self, step: impl Into<String>, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.push(step, error);
                None
            }
        }
    }

    /// Returns `true` if no step failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failed steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Iterates over the recorded failures in order.
    pub fn iter(&self) -> impl Iterator<Item = &StepFailure> {
        self.failures.iter()
    }

    /// Returns `true` if `step` is among the failures.
    #[must_use]
    pub fn contains(&self, step: &str) -> bool {
        self.failures.iter().any(|f| f.step == step)
    }

    /// Converts into `Ok(())` when empty, otherwise a [`CellarError::Partial`].
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Partial`] if any step failed.
    pub fn into_result(self, operation: &'static str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CellarError::Partial {
                operation,
                failures: self,
            })
        }
    }
}

impl fmt::Display for StepErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.step, failure.error)?;
        }
        Ok(())
    }
}
