#![forbid(unsafe_code)]
//! Block device adapters.
//!
//! Everything above this crate does I/O in whole 4096-byte blocks through
//! the [`BlockDevice`] trait. Two implementations are provided: a
//! file-backed device using positioned reads/writes, and an in-memory
//! device for tests and scratch volumes.

use cfs_error::{FsError, Result};
use cfs_types::BLOCK_SIZE;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Block-addressed I/O interface.
///
/// All transfers are exactly one block. Implementations report their fixed
/// block population via [`block_count`](Self::block_count); indices at or
/// past that count are rejected.
pub trait BlockDevice: Send + Sync {
    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Read block `index` into `buf`.
    fn read_block(&self, index: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Write `data` to block `index`.
    fn write_block(&self, index: u32, data: &[u8; BLOCK_SIZE]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn out_of_range(index: u32, count: u32) -> FsError {
    FsError::Device(Error::new(
        ErrorKind::InvalidInput,
        format!("block {index} out of range (device has {count} blocks)"),
    ))
}

fn block_offset(index: u32) -> u64 {
    u64::from(index) * BLOCK_SIZE as u64
}

/// File-backed block device using positioned I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which does not require a shared seek
/// position. The file length must be a whole number of blocks.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    block_count: u32,
}

impl FileBlockDevice {
    /// Open an existing image for read/write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(FsError::InvalidFormat(format!(
                "image length {len} is not a multiple of the {BLOCK_SIZE}-byte block size"
            )));
        }
        let block_count = u32::try_from(len / BLOCK_SIZE as u64).map_err(|_| {
            FsError::InvalidFormat(format!("image too large: {len} bytes"))
        })?;
        Ok(Self { file, block_count })
    }

    /// Create (or truncate) an image holding `block_count` zeroed blocks.
    pub fn create(path: impl AsRef<Path>, block_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(u64::from(block_count) * BLOCK_SIZE as u64)?;
        Ok(Self { file, block_count })
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn read_block(&self, index: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        if index >= self.block_count {
            return Err(out_of_range(index, self.block_count));
        }
        self.file.read_exact_at(buf, block_offset(index))?;
        Ok(())
    }

    fn write_block(&self, index: u32, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        if index >= self.block_count {
            return Err(out_of_range(index, self.block_count));
        }
        self.file.write_all_at(data, block_offset(index))?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory block device.
///
/// Cloning shares the underlying storage, so a test can keep a handle to
/// inspect raw bytes after the volume under test has written through its
/// own clone.
#[derive(Debug, Clone)]
pub struct MemBlockDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    block_count: u32,
}

impl MemBlockDevice {
    /// Create a zeroed device with `block_count` blocks.
    #[must_use]
    pub fn new(block_count: u32) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; block_count as usize * BLOCK_SIZE])),
            block_count,
        }
    }

    /// Wrap an existing image. The length must be block-aligned.
    pub fn from_image(image: Vec<u8>) -> Result<Self> {
        if image.len() % BLOCK_SIZE != 0 {
            return Err(FsError::InvalidFormat(format!(
                "image length {} is not a multiple of the {BLOCK_SIZE}-byte block size",
                image.len()
            )));
        }
        let block_count = u32::try_from(image.len() / BLOCK_SIZE).map_err(|_| {
            FsError::InvalidFormat(format!("image too large: {} bytes", image.len()))
        })?;
        Ok(Self {
            bytes: Arc::new(Mutex::new(image)),
            block_count,
        })
    }

    /// Copy out the full image.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn read_block(&self, index: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        if index >= self.block_count {
            return Err(out_of_range(index, self.block_count));
        }
        let bytes = self.bytes.lock();
        let start = index as usize * BLOCK_SIZE;
        buf.copy_from_slice(&bytes[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, index: u32, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        if index >= self.block_count {
            return Err(out_of_range(index, self.block_count));
        }
        let mut bytes = self.bytes.lock();
        let start = index as usize * BLOCK_SIZE;
        bytes[start..start + BLOCK_SIZE].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips_blocks() {
        let dev = MemBlockDevice::new(4);
        assert_eq!(dev.block_count(), 4);

        let mut block = [0_u8; BLOCK_SIZE];
        block[0] = 0xAB;
        block[BLOCK_SIZE - 1] = 0xCD;
        dev.write_block(2, &block).expect("write");

        let mut out = [0_u8; BLOCK_SIZE];
        dev.read_block(2, &mut out).expect("read");
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[BLOCK_SIZE - 1], 0xCD);

        dev.read_block(3, &mut out).expect("read untouched");
        assert_eq!(out, [0_u8; BLOCK_SIZE]);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let dev = MemBlockDevice::new(2);
        let mut buf = [0_u8; BLOCK_SIZE];
        assert!(dev.read_block(2, &mut buf).is_err());
        assert!(dev.write_block(u32::MAX, &buf).is_err());
    }

    #[test]
    fn mem_device_clones_share_storage() {
        let dev = MemBlockDevice::new(1);
        let other = dev.clone();

        let block = [0x5A_u8; BLOCK_SIZE];
        dev.write_block(0, &block).expect("write");

        let mut out = [0_u8; BLOCK_SIZE];
        other.read_block(0, &mut out).expect("read via clone");
        assert_eq!(out, block);
    }

    #[test]
    fn mem_device_rejects_misaligned_image() {
        assert!(MemBlockDevice::from_image(vec![0_u8; BLOCK_SIZE + 1]).is_err());
        assert!(MemBlockDevice::from_image(vec![0_u8; BLOCK_SIZE * 2]).is_ok());
    }

    #[test]
    fn file_device_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vol.img");

        let block = [0x42_u8; BLOCK_SIZE];
        {
            let dev = FileBlockDevice::create(&path, 8).expect("create");
            assert_eq!(dev.block_count(), 8);
            dev.write_block(5, &block).expect("write");
            dev.sync().expect("sync");
        }

        let dev = FileBlockDevice::open(&path).expect("reopen");
        assert_eq!(dev.block_count(), 8);
        let mut out = [0_u8; BLOCK_SIZE];
        dev.read_block(5, &mut out).expect("read");
        assert_eq!(out, block);

        dev.read_block(0, &mut out).expect("read zeroed");
        assert_eq!(out, [0_u8; BLOCK_SIZE]);
    }

    #[test]
    fn file_device_rejects_misaligned_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.img");
        std::fs::write(&path, vec![0_u8; BLOCK_SIZE - 1]).expect("write file");

        match FileBlockDevice::open(&path) {
            Err(FsError::InvalidFormat(_)) => {}
            other => panic!("expected InvalidFormat, got {other:?}"),
        }
    }

    #[test]
    fn file_device_rejects_out_of_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dev = FileBlockDevice::create(dir.path().join("vol.img"), 2).expect("create");
        let mut buf = [0_u8; BLOCK_SIZE];
        assert!(dev.read_block(2, &mut buf).is_err());
    }
}
