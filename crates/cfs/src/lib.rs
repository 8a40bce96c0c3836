#![forbid(unsafe_code)]
//! ChainFS public API facade.
//!
//! Re-exports the mounted-volume engine from `cfs-core` through a stable
//! external interface. This is the crate that downstream consumers (CLI,
//! harness) depend on.

pub use cfs_core::*;
