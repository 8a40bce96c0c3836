#![forbid(unsafe_code)]
//! End-to-end test helpers.
//!
//! Integration suites build volumes on [`MemBlockDevice`] so the whole
//! engine runs without touching the host filesystem; the device handle the
//! helpers return is a clone sharing storage with the mounted volume, so a
//! test can inspect raw bytes behind the engine's back.

use cfs::{ChainFs, format_volume};
use cfs_block::MemBlockDevice;
use cfs_ondisk::required_chain_blocks;

/// Total device blocks for a volume with exactly `data_blocks` data blocks.
#[must_use]
pub fn volume_total_blocks(data_blocks: u16) -> u16 {
    data_blocks + 2 + u16::from(required_chain_blocks(data_blocks))
}

/// Freshly formatted in-memory device with `data_blocks` data blocks.
///
/// Data block 0 is the allocator sentinel, so `data_blocks - 1` blocks are
/// actually usable for file contents.
#[must_use]
pub fn fresh_device(data_blocks: u16) -> MemBlockDevice {
    let dev = MemBlockDevice::new(u32::from(volume_total_blocks(data_blocks)));
    format_volume(&dev).expect("format fresh device");
    dev
}

/// Mounted session over a fresh volume, plus a handle to its storage.
#[must_use]
pub fn mounted(data_blocks: u16) -> (ChainFs, MemBlockDevice) {
    let dev = fresh_device(data_blocks);
    let mut fs = ChainFs::new();
    fs.mount(dev.clone()).expect("mount fresh device");
    (fs, dev)
}

/// Deterministic non-repeating byte pattern for payload checks.
#[must_use]
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    let mut state = u32::from(seed) | 1;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_helper_matches_solver() {
        for data_blocks in [1_u16, 8, 100, 2048, 2049, 4096] {
            let total = volume_total_blocks(data_blocks);
            let sb = cfs_ondisk::Superblock::with_total_blocks(total).expect("geometry");
            assert_eq!(sb.data_block_count, data_blocks, "for total {total}");
        }
    }

    #[test]
    fn fresh_device_mounts_clean() {
        let (fs, _dev) = mounted(8);
        let info = fs.info().expect("info");
        assert_eq!(info.data_block_count, 8);
        assert_eq!(info.free_chain_entries, 7);
        assert_eq!(info.free_directory_entries, 128);
        assert_eq!(info.open_descriptors, 0);
    }

    #[test]
    fn pattern_is_deterministic_and_seed_sensitive() {
        assert_eq!(pattern(64, 1), pattern(64, 1));
        assert_ne!(pattern(64, 1), pattern(64, 2));
        assert_eq!(pattern(0, 1), Vec::<u8>::new());
    }
}
