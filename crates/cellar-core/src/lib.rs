//! # cellar-core
//!
//! Low-level Linux isolation primitives for the cellar runtime.
//!
//! This crate provides:
//! - **Filesystem**: image layer extraction, the overlay workspace, host
//!   volume binds, and the `pivot_root` transition.
//! - **Cgroups**: per-subsystem limits on the v1 hierarchy (`cpu`,
//!   `cpuset`, `memory`).
//! - **Namespaces**: clone flags and the in-container init sequence.
//!
//! Mount-table changes go through the [`syscall::Syscall`] trait so the
//! ordering rules of setup and teardown can be exercised without root.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod syscall;
