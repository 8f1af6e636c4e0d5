//! CPU weight via the v1 `cpu` subsystem.

use cellar_common::types::ResourceLimits;

use super::subsystem::Subsystem;

/// Writes the relative CPU weight to `cpu.shares`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuSubsystem;

impl Subsystem for CpuSubsystem {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn limit_file(&self) -> &'static str {
        "cpu.shares"
    }

    fn limit<'l>(&self, limits: &'l ResourceLimits) -> Option<&'l str> {
        limits.cpu_shares.as_deref()
    }
}
