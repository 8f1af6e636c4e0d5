//! # cellar-common
//!
//! Shared types, error definitions, on-disk layout, and persistence
//! helpers used across the cellar workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod persist;
pub mod types;
