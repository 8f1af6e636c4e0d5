//! Filesystem management for container isolation.
//!
//! Provides image layer extraction, the overlay workspace, host volume
//! binds, `pivot_root` for switching the root filesystem, and the pseudo
//! filesystems mounted inside the new root.

pub mod layer;
pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
pub mod volume;
pub mod workspace;

pub use volume::VolumeMapping;
pub use workspace::{MountedWorkspace, Workspace};
