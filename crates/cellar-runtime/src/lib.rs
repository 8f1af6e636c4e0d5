//! Container lifecycle management for the cellar runtime.
//!
//! The [`engine::Engine`] sequences the workspace, process, cgroup, and
//! network components to create a container, and reverses that sequence
//! to destroy one. Records of live containers are kept as JSON files by
//! [`state::ContainerStore`].

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod engine;
pub mod logs;
pub mod process;
pub mod state;

pub use container::ContainerRecord;
pub use engine::{Engine, RunOptions, RunOutcome};
