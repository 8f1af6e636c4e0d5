//! Root pivot against the real kernel.
//!
//! Needs `CAP_SYS_ADMIN`; run with `cargo test -- --ignored` as root. The
//! pivot happens in a forked child inside a private mount namespace so
//! the test runner's own root is never touched.

#![allow(clippy::expect_used, clippy::unwrap_used, unsafe_code)]

use std::path::Path;

use cellar_core::filesystem::pivot_root::pivot_root;
use cellar_core::syscall::{LinuxSyscall, Syscall};
use nix::mount::MsFlags;
use nix::sched::{CloneFlags, unshare};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork};

const CONTAINER_MARKER: &str = "container-marker";

fn pivot_and_check(new_root: &Path, host_marker: &Path) -> i32 {
    let syscall = LinuxSyscall;
    if unshare(CloneFlags::CLONE_NEWNS).is_err() {
        return 10;
    }
    if syscall
        .mount(None, Path::new("/"), None, MsFlags::MS_PRIVATE | MsFlags::MS_REC, None)
        .is_err()
    {
        return 11;
    }
    if pivot_root(&syscall, new_root).is_err() {
        return 12;
    }
    if !Path::new("/").join(CONTAINER_MARKER).is_file() {
        return 13;
    }
    if host_marker.exists() {
        return 14;
    }
    0
}

#[test]
#[ignore = "requires root"]
fn pivoted_root_shows_only_container_contents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let new_root = dir.path().join("rootfs");
    std::fs::create_dir(&new_root).expect("rootfs");
    std::fs::write(new_root.join(CONTAINER_MARKER), b"inside").expect("container marker");
    let host_marker = dir.path().join("host-marker");
    std::fs::write(&host_marker, b"outside").expect("host marker");

    // SAFETY: the child only runs the pivot and exits without returning
    // to the test harness.
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            let code = pivot_and_check(&new_root, &host_marker);
            // SAFETY: skips the harness's atexit handlers in the child.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            let status = waitpid(child, None).expect("waitpid");
            assert_eq!(status, WaitStatus::Exited(child, 0));
        }
    }

    assert!(host_marker.is_file(), "host root must be untouched");
}
