#![forbid(unsafe_code)]
//! Error types for ChainFS.
//!
//! # Error Taxonomy
//!
//! ChainFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `FsError` | `cfs-error` (this crate) | User-facing errors for CLI and API consumers |
//!
//! `cfs-error` is intentionally independent of `cfs-types` and `cfs-ondisk`
//! to avoid cyclic dependencies. The conversion from `ParseError` to
//! `FsError` happens in `cfs-core`, which depends on both crates: every
//! parse failure observed at mount time becomes `FsError::InvalidFormat`
//! carrying the parse diagnostic, and no state is retained.
//!
//! Three categories of runtime failure:
//!
//! - **format errors** (`InvalidFormat`): bad signature, inconsistent
//!   superblock geometry, violated chain-table sentinel, broken directory
//!   entry. Only surfaced at mount time; the mount simply fails.
//! - **usage errors** (everything from `NotMounted` through
//!   `OffsetOutOfRange`): returned to the caller with volume state left
//!   unchanged.
//! - **device errors** (`Device`): I/O failures from the underlying block
//!   device, wrapped as-is.
//!
//! Disk exhaustion during a write is deliberately NOT an error: the write
//! degrades to a partial result and reports the true byte count.

use thiserror::Error;

/// Unified error type for all ChainFS operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// I/O error from the underlying block device.
    #[error("device error: {0}")]
    Device(#[from] std::io::Error),

    /// The image is not a valid volume of this format.
    ///
    /// Covers bad signature, inconsistent superblock fields, a violated
    /// chain-table sentinel, and directory entries whose size and first
    /// block disagree. Mount is the only operation that can return this.
    #[error("invalid on-disk format: {0}")]
    InvalidFormat(String),

    /// An operation was attempted with no volume mounted.
    #[error("no volume is mounted")]
    NotMounted,

    /// A second mount was attempted while a volume is active.
    #[error("a volume is already mounted")]
    AlreadyMounted,

    /// Unmount was attempted while descriptors are still open.
    #[error("cannot unmount: {0} descriptor(s) still open")]
    FilesOpen(usize),

    /// The filename is empty, too long for the on-disk buffer, or contains
    /// an embedded NUL.
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    /// Create found an occupied slot with the same name.
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// The root directory has no free slot.
    #[error("root directory is full")]
    DirectoryFull,

    /// No occupied directory slot matches the name.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Delete was attempted while the file has open descriptors.
    #[error("file is busy: {0}")]
    Busy(String),

    /// The open-file table has no free slot.
    #[error("too many open files")]
    TooManyOpen,

    /// The descriptor is out of range or not currently open.
    #[error("bad file descriptor: {0}")]
    BadDescriptor(usize),

    /// Seek past the end of the file.
    #[error("offset {offset} is past end of file (size {size})")]
    OffsetOutOfRange { offset: u32, size: u32 },
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = FsError::InvalidFormat("signature mismatch".into());
        assert_eq!(
            err.to_string(),
            "invalid on-disk format: signature mismatch"
        );

        assert_eq!(
            FsError::FilesOpen(3).to_string(),
            "cannot unmount: 3 descriptor(s) still open"
        );

        assert_eq!(
            FsError::OffsetOutOfRange {
                offset: 5000,
                size: 4096,
            }
            .to_string(),
            "offset 5000 is past end of file (size 4096)"
        );

        assert_eq!(
            FsError::BadDescriptor(99).to_string(),
            "bad file descriptor: 99"
        );
    }

    #[test]
    fn device_error_wraps_io() {
        let io = std::io::Error::other("short read");
        let err = FsError::Device(io);
        assert!(err.to_string().contains("short read"));
    }
}
