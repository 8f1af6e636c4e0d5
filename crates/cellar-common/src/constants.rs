//! System-wide constants and default paths.

use std::time::Duration;

/// Default base directory for images, layers, and mount points.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/cellar";

/// Default base directory for runtime state (records, networks, IPAM).
pub const DEFAULT_STATE_DIR: &str = "/var/run/cellar";

/// File name of a container's metadata record.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// File name of a detached container's output log.
pub const CONTAINER_LOG_FILE_NAME: &str = "container.log";

/// Extension of image archives in the image directory.
pub const IMAGE_ARCHIVE_EXTENSION: &str = "tar";

/// Directory created under the new root to park the old one during a pivot.
pub const PIVOT_PUT_OLD_DIR_NAME: &str = ".pivot_put_old";

/// Parent cgroup for every container's hierarchy entry.
pub const CGROUP_PARENT: &str = "cellar";

/// File descriptor on which the init process receives its command.
pub const INIT_COMMAND_FD: i32 = 3;

/// Upper bound on how long the init process waits for its command.
pub const INIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest JSON record the persistence layer will read.
pub const MAX_RECORD_BYTES: u64 = 4 * 1024 * 1024;

/// Kernel limit on interface names, excluding the trailing NUL.
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Number of characters of an endpoint ID used in veth names.
pub const VETH_ID_PREFIX_LEN: usize = 8;

/// Prefix of the bridge-side veth peer name.
pub const VETH_PEER_PREFIX: &str = "veth";

/// Name of the only built-in network driver.
pub const BRIDGE_DRIVER_NAME: &str = "bridge";

/// Attempts made to look up a freshly created interface.
pub const INTERFACE_LOOKUP_ATTEMPTS: u32 = 2;

/// Delay between interface lookup attempts.
pub const INTERFACE_LOOKUP_DELAY: Duration = Duration::from_secs(2);

/// Grace period between SIGTERM and SIGKILL when stopping a container.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Application name used in CLI output.
pub const APP_NAME: &str = "cellar";

/// Name of the hidden subcommand the runtime re-executes itself with.
pub const INIT_SUBCOMMAND: &str = "init";
