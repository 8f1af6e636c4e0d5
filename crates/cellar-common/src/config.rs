//! On-disk layout of the cellar runtime.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{
    CONFIG_FILE_NAME, CONTAINER_LOG_FILE_NAME, DEFAULT_DATA_DIR, DEFAULT_STATE_DIR,
    IMAGE_ARCHIVE_EXTENSION,
};

/// Every path the runtime reads or writes, derived from two roots.
///
/// The data root holds images and per-container filesystem layers; the
/// state root holds small JSON records that describe live resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePaths {
    /// Root for images, layers, and mount points.
    pub data_dir: PathBuf,
    /// Root for container records, network descriptors, and IPAM state.
    pub state_dir: PathBuf,
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR, DEFAULT_STATE_DIR)
    }
}

impl RuntimePaths {
    /// Creates a layout rooted at the given directories.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    /// Places both roots under a single directory. Used by tests.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self::new(root.join("data"), root.join("state"))
    }

    /// Directory holding image archives.
    #[must_use]
    pub fn image_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    /// Archive for `image`.
    #[must_use]
    pub fn image_archive(&self, image: &str) -> PathBuf {
        self.image_dir().join(format!("{image}.{IMAGE_ARCHIVE_EXTENSION}"))
    }

    /// Extracted read-only layer for `image`.
    #[must_use]
    pub fn read_only_layer(&self, image: &str) -> PathBuf {
        self.data_dir.join("layers").join(image)
    }

    /// Writable upper layer for `container`.
    #[must_use]
    pub fn write_layer(&self, container: &str) -> PathBuf {
        self.data_dir.join("write").join(container)
    }

    /// Overlay scratch directory for `container`.
    #[must_use]
    pub fn work_dir(&self, container: &str) -> PathBuf {
        self.data_dir.join("work").join(container)
    }

    /// Merged root filesystem mount point for `container`.
    #[must_use]
    pub fn mount_point(&self, container: &str) -> PathBuf {
        self.data_dir.join("mnt").join(container)
    }

    /// Directory holding every container record.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.state_dir.join("containers")
    }

    /// Record directory for `container`.
    #[must_use]
    pub fn container_dir(&self, container: &str) -> PathBuf {
        self.containers_dir().join(container)
    }

    /// Metadata file for `container`.
    #[must_use]
    pub fn container_record(&self, container: &str) -> PathBuf {
        self.container_dir(container).join(CONFIG_FILE_NAME)
    }

    /// Output log for a detached `container`.
    #[must_use]
    pub fn container_log(&self, container: &str) -> PathBuf {
        self.container_dir(container).join(CONTAINER_LOG_FILE_NAME)
    }

    /// Directory of network descriptor files.
    #[must_use]
    pub fn networks_dir(&self) -> PathBuf {
        self.state_dir.join("network").join("networks")
    }

    /// Descriptor file for network `name`.
    #[must_use]
    pub fn network_file(&self, name: &str) -> PathBuf {
        self.networks_dir().join(format!("{name}.json"))
    }

    /// IPAM bitmap file.
    #[must_use]
    pub fn ipam_file(&self) -> PathBuf {
        self.state_dir.join("network").join("ipam").join("subnet.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_paths_are_keyed_by_name() {
        let paths = RuntimePaths::new("/data", "/state");
        assert_eq!(paths.image_archive("busybox"), PathBuf::from("/data/images/busybox.tar"));
        assert_eq!(paths.read_only_layer("busybox"), PathBuf::from("/data/layers/busybox"));
        assert_eq!(paths.write_layer("web"), PathBuf::from("/data/write/web"));
        assert_eq!(paths.work_dir("web"), PathBuf::from("/data/work/web"));
        assert_eq!(paths.mount_point("web"), PathBuf::from("/data/mnt/web"));
    }

    #[test]
    fn state_paths_live_under_state_dir() {
        let paths = RuntimePaths::new("/data", "/state");
        assert_eq!(
            paths.container_record("web"),
            PathBuf::from("/state/containers/web/config.json")
        );
        assert_eq!(paths.network_file("br0"), PathBuf::from("/state/network/networks/br0.json"));
        assert!(paths.ipam_file().starts_with("/state"));
    }
}
