//! Memory cap via the v1 `memory` subsystem.
//!
//! The kernel accepts a byte count or a value with a `k`, `m`, or `g`
//! suffix in `memory.limit_in_bytes`; the value is passed through.

use cellar_common::types::ResourceLimits;

use super::subsystem::Subsystem;

/// Writes the hard memory limit to `memory.limit_in_bytes`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySubsystem;

impl Subsystem for MemorySubsystem {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn limit_file(&self) -> &'static str {
        "memory.limit_in_bytes"
    }

    fn limit<'l>(&self, limits: &'l ResourceLimits) -> Option<&'l str> {
        limits.memory.as_deref()
    }
}
