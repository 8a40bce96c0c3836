#![forbid(unsafe_code)]
//! Mounted-volume engine.
//!
//! [`ChainFs`] is the session handle: it holds at most one mounted
//! [`Volume`] and turns every call made outside a mount session into
//! `NotMounted`. The volume owns the block device plus the single in-memory
//! copy of each metadata structure (superblock, chain table, root
//! directory, open-file table); all of them are dropped together on
//! unmount.
//!
//! Mutation policy: any operation that changes the chain table writes back
//! all of its blocks, and any operation that changes the directory writes
//! back the root-directory block, before returning. There is no
//! write-behind; the device is byte-identical to memory whenever a
//! mutating call returns.

use cfs_block::{BlockDevice, FileBlockDevice};
use cfs_ondisk::{ChainLink, ChainTable, DirEntry, RootDir, is_valid_name};
use cfs_types::{
    BLOCK_SIZE, CHAIN_TABLE_START_BLOCK, OPEN_TABLE_CAPACITY, ParseError, SUPERBLOCK_BLOCK,
    blocks_for,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

pub use cfs_error::{FsError, Result};
pub use cfs_ondisk::Superblock;
pub use cfs_types::{DataBlock, Fd, FileId};

/// Boundary conversion: any parse failure observed while mounting means the
/// image is not a volume of this format.
fn parse_to_fs_error(err: &ParseError) -> FsError {
    FsError::InvalidFormat(err.to_string())
}

#[inline]
fn as_block(slice: &[u8]) -> &[u8; BLOCK_SIZE] {
    slice.try_into().expect("slice length equals block size")
}

#[inline]
fn as_block_mut(slice: &mut [u8]) -> &mut [u8; BLOCK_SIZE] {
    slice.try_into().expect("slice length equals block size")
}

// ── Open-file table ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct OpenFile {
    file_id: FileId,
    cursor: u32,
}

/// Fixed-capacity descriptor table. A descriptor's identity is its slot
/// index, assigned as the lowest free slot at open time.
#[derive(Debug)]
struct OpenFileTable {
    slots: Vec<Option<OpenFile>>,
}

impl OpenFileTable {
    fn new() -> Self {
        Self {
            slots: vec![None; OPEN_TABLE_CAPACITY],
        }
    }

    fn open(&mut self, file_id: FileId) -> Option<Fd> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(OpenFile { file_id, cursor: 0 });
        Some(Fd(slot))
    }

    fn get(&self, fd: Fd) -> Result<OpenFile> {
        self.slots
            .get(fd.0)
            .copied()
            .flatten()
            .ok_or(FsError::BadDescriptor(fd.0))
    }

    fn set_cursor(&mut self, fd: Fd, cursor: u32) -> Result<()> {
        match self.slots.get_mut(fd.0) {
            Some(Some(open)) => {
                open.cursor = cursor;
                Ok(())
            }
            _ => Err(FsError::BadDescriptor(fd.0)),
        }
    }

    fn close(&mut self, fd: Fd) -> Result<()> {
        match self.slots.get_mut(fd.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(FsError::BadDescriptor(fd.0)),
        }
    }

    fn references(&self, file_id: FileId) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|open| open.file_id == file_id)
    }

    fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

// ── Reporting types ─────────────────────────────────────────────────────────

/// One row of [`ChainFs::list`]: an occupied directory slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u32,
    /// First data block of the file's chain; `None` for zero-length files.
    pub first_block: Option<u16>,
}

/// Volume geometry and live occupancy, for info-style reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub total_blocks: u16,
    pub chain_table_blocks: u8,
    pub root_dir_block: u16,
    pub data_start_block: u16,
    pub data_block_count: u16,
    pub free_chain_entries: usize,
    pub free_directory_entries: usize,
    pub open_descriptors: usize,
}

// ── Mounted volume ──────────────────────────────────────────────────────────

struct Volume {
    dev: Box<dyn BlockDevice>,
    superblock: Superblock,
    chain: ChainTable,
    root: RootDir,
    open_files: OpenFileTable,
    free_chain_entries: usize,
    free_dir_entries: usize,
}

impl Volume {
    /// Load and validate all metadata. On any failure the device handle is
    /// dropped (released) and nothing is retained.
    fn mount(dev: Box<dyn BlockDevice>) -> Result<Self> {
        let mut block = [0_u8; BLOCK_SIZE];

        dev.read_block(SUPERBLOCK_BLOCK, &mut block)?;
        let superblock = Superblock::parse(&block).map_err(|e| parse_to_fs_error(&e))?;
        superblock
            .validate(dev.block_count())
            .map_err(|e| parse_to_fs_error(&e))?;

        let mut chain_bytes = Vec::with_capacity(
            usize::from(superblock.chain_table_blocks) * BLOCK_SIZE,
        );
        for index in 0..u32::from(superblock.chain_table_blocks) {
            dev.read_block(CHAIN_TABLE_START_BLOCK + index, &mut block)?;
            chain_bytes.extend_from_slice(&block);
        }
        let chain = ChainTable::parse(&chain_bytes, superblock.data_block_count)
            .map_err(|e| parse_to_fs_error(&e))?;
        let free_chain_entries = chain.free_count();

        dev.read_block(u32::from(superblock.root_dir_block), &mut block)?;
        let root = RootDir::parse(&block).map_err(|e| parse_to_fs_error(&e))?;
        let free_dir_entries = root.free_count();

        info!(
            total_blocks = superblock.total_blocks,
            data_blocks = superblock.data_block_count,
            free_chain_entries,
            free_dir_entries,
            "mounted volume"
        );

        Ok(Self {
            dev,
            superblock,
            chain,
            root,
            open_files: OpenFileTable::new(),
            free_chain_entries,
            free_dir_entries,
        })
    }

    fn flush_chain(&self) -> Result<()> {
        let blocks = self.chain.encode_blocks(self.superblock.chain_table_blocks);
        for (index, block) in blocks.iter().enumerate() {
            self.dev
                .write_block(CHAIN_TABLE_START_BLOCK + index as u32, block)?;
        }
        Ok(())
    }

    fn flush_root(&self) -> Result<()> {
        self.dev
            .write_block(u32::from(self.superblock.root_dir_block), &self.root.encode())
    }

    // ── Chain operations ────────────────────────────────────────────────

    /// Claim up to `count` free entries, in ascending index order, linking
    /// them onto `tail` (or starting a new chain). Returns the first newly
    /// claimed block and how many were actually claimed; the caller must
    /// cope with a partial grant.
    fn allocate_chain(&mut self, count: usize, tail: Option<DataBlock>) -> (Option<DataBlock>, usize) {
        let mut first = None;
        let mut prev = tail;
        let mut granted = 0_usize;

        for raw in 1..self.chain.len() {
            if granted == count {
                break;
            }
            let index = DataBlock(raw);
            if self.chain.link(index) != ChainLink::Free {
                continue;
            }
            match prev {
                Some(prev_index) => self.chain.set_link(prev_index, ChainLink::Next(index)),
                None => first = Some(index),
            }
            self.chain.set_link(index, ChainLink::End);
            prev = Some(index);
            granted += 1;
            self.free_chain_entries -= 1;
        }

        if granted > 0 {
            debug!(granted, requested = count, "allocated chain blocks");
        }
        (first, granted)
    }

    /// Walk the chain from `head`, freeing every visited entry.
    fn release_chain(&mut self, head: Option<DataBlock>) {
        let mut cursor = head;
        while let Some(index) = cursor {
            cursor = match self.chain.link(index) {
                ChainLink::Next(next) => Some(next),
                ChainLink::End => None,
                ChainLink::Free => panic!(
                    "chain table corruption: chain passes through free entry {index}"
                ),
            };
            self.chain.set_link(index, ChainLink::Free);
            self.free_chain_entries += 1;
        }
    }

    /// Data block holding byte `offset` of the chain starting at `head`.
    ///
    /// The walk covering `offset` is guaranteed by the directory size
    /// invariant; running off the chain first means the volume's metadata
    /// no longer agrees with itself, which is fatal.
    fn block_at(&self, head: DataBlock, offset: u32) -> DataBlock {
        let mut current = head;
        for _ in 0..offset / BLOCK_SIZE as u32 {
            current = match self.chain.link(current) {
                ChainLink::Next(next) => next,
                ChainLink::End | ChainLink::Free => panic!(
                    "chain table corruption: chain from {head} ends before byte offset {offset}"
                ),
            };
        }
        current
    }

    /// Last block of the chain starting at `head`.
    fn chain_tail(&self, head: DataBlock) -> DataBlock {
        let mut current = head;
        loop {
            current = match self.chain.link(current) {
                ChainLink::Next(next) => next,
                ChainLink::End => return current,
                ChainLink::Free => panic!(
                    "chain table corruption: chain passes through free entry {current}"
                ),
            };
        }
    }

    /// Next block of a chain mid-walk; reaching the end here contradicts
    /// the byte bound already established by the caller.
    fn chain_next(&self, current: DataBlock) -> DataBlock {
        match self.chain.link(current) {
            ChainLink::Next(next) => next,
            ChainLink::End | ChainLink::Free => panic!(
                "chain table corruption: chain ends inside file at data block {current}"
            ),
        }
    }

    // ── Directory operations ────────────────────────────────────────────

    fn create(&mut self, name: &str) -> Result<()> {
        if !is_valid_name(name) {
            return Err(FsError::InvalidName(name.to_owned()));
        }
        if self.root.find(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_owned()));
        }
        if self.free_dir_entries == 0 {
            return Err(FsError::DirectoryFull);
        }
        let Some(slot) = self.root.first_free() else {
            return Err(FsError::DirectoryFull);
        };

        *self.root.entry_mut(slot) = DirEntry::new(name);
        self.free_dir_entries -= 1;
        self.flush_root()?;

        debug!(name, slot = slot.0, "created file");
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        if !is_valid_name(name) {
            return Err(FsError::InvalidName(name.to_owned()));
        }
        let id = self
            .root
            .find(name)
            .ok_or_else(|| FsError::NotFound(name.to_owned()))?;
        if self.open_files.references(id) {
            return Err(FsError::Busy(name.to_owned()));
        }

        let head = self.root.entry(id).first_block();
        self.release_chain(head);
        *self.root.entry_mut(id) = DirEntry::EMPTY;
        self.free_dir_entries += 1;
        self.flush_root()?;
        self.flush_chain()?;

        debug!(name, slot = id.0, "deleted file");
        Ok(())
    }

    fn list(&self) -> impl Iterator<Item = FileInfo> + '_ {
        self.root.iter_occupied().map(|(_, entry)| FileInfo {
            name: entry.name_str(),
            size: entry.size,
            first_block: entry.first_block().map(|block| block.0),
        })
    }

    fn info(&self) -> VolumeInfo {
        VolumeInfo {
            total_blocks: self.superblock.total_blocks,
            chain_table_blocks: self.superblock.chain_table_blocks,
            root_dir_block: self.superblock.root_dir_block,
            data_start_block: self.superblock.data_start_block,
            data_block_count: self.superblock.data_block_count,
            free_chain_entries: self.free_chain_entries,
            free_directory_entries: self.free_dir_entries,
            open_descriptors: self.open_files.open_count(),
        }
    }

    // ── Descriptor operations ───────────────────────────────────────────

    fn open(&mut self, name: &str) -> Result<Fd> {
        let id = self
            .root
            .find(name)
            .ok_or_else(|| FsError::NotFound(name.to_owned()))?;
        self.open_files.open(id).ok_or(FsError::TooManyOpen)
    }

    fn close(&mut self, fd: Fd) -> Result<()> {
        self.open_files.close(fd)
    }

    fn stat(&self, fd: Fd) -> Result<u32> {
        let open = self.open_files.get(fd)?;
        // Size is read live: a write through another descriptor may have
        // changed it since this one was opened.
        Ok(self.root.entry(open.file_id).size)
    }

    fn seek(&mut self, fd: Fd, offset: u32) -> Result<()> {
        let open = self.open_files.get(fd)?;
        let size = self.root.entry(open.file_id).size;
        if offset > size {
            return Err(FsError::OffsetOutOfRange { offset, size });
        }
        self.open_files.set_cursor(fd, offset)
    }

    // ── Read/write engine ───────────────────────────────────────────────

    fn read(&mut self, fd: Fd, count: usize) -> Result<Vec<u8>> {
        let open = self.open_files.get(fd)?;
        let size = self.root.entry(open.file_id).size;
        let mut cursor = open.cursor;

        let n = count.min((size - cursor) as usize);
        let mut out = vec![0_u8; n];
        if n == 0 {
            return Ok(out);
        }

        let head = self
            .root
            .entry(open.file_id)
            .first_block()
            .unwrap_or_else(|| panic!("directory corruption: sized file owns no blocks"));
        let mut block = self.block_at(head, cursor);
        let mut scratch = [0_u8; BLOCK_SIZE];
        let mut copied = 0_usize;

        while copied < n {
            let local = cursor as usize % BLOCK_SIZE;
            let step = (BLOCK_SIZE - local).min(n - copied);
            let phys = self.superblock.phys_of(block);

            if local == 0 && step == BLOCK_SIZE {
                self.dev
                    .read_block(phys, as_block_mut(&mut out[copied..copied + BLOCK_SIZE]))?;
            } else {
                self.dev.read_block(phys, &mut scratch)?;
                out[copied..copied + step].copy_from_slice(&scratch[local..local + step]);
            }

            copied += step;
            cursor += step as u32;
            if copied < n {
                block = self.chain_next(block);
            }
        }

        self.open_files.set_cursor(fd, cursor)?;
        Ok(out)
    }

    fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize> {
        let open = self.open_files.get(fd)?;
        let file_id = open.file_id;
        let mut cursor = open.cursor;
        let old_size = self.root.entry(file_id).size;

        if buf.is_empty() {
            return Ok(0);
        }

        let prospective = u64::from(old_size).max(u64::from(cursor) + buf.len() as u64);
        let old_blocks = u64::from(blocks_for(old_size));
        let new_blocks = prospective.div_ceil(BLOCK_SIZE as u64);

        // Grow the chain by exactly the shortfall. A partial grant clamps
        // the writable range to what the granted blocks can hold; the write
        // still proceeds and reports the true count.
        let mut allocated = false;
        let mut writable_end = prospective;
        if new_blocks > old_blocks {
            let shortfall = (new_blocks - old_blocks) as usize;
            let head = self.root.entry(file_id).first_block();
            let tail = head.map(|h| self.chain_tail(h));
            let (first_new, granted) = self.allocate_chain(shortfall, tail);
            allocated = granted > 0;
            if head.is_none() {
                if let Some(first) = first_new {
                    self.root.entry_mut(file_id).first_block = first.0;
                }
            }
            if granted < shortfall {
                writable_end = (old_blocks + granted as u64) * BLOCK_SIZE as u64;
            }
        }

        let n = (writable_end.saturating_sub(u64::from(cursor))).min(buf.len() as u64);
        // Bounded by the volume's data capacity (< 2^28 bytes).
        #[allow(clippy::cast_possible_truncation)]
        let n = n as usize;

        if n > 0 {
            let head = self
                .root
                .entry(file_id)
                .first_block()
                .unwrap_or_else(|| panic!("directory corruption: writable file owns no blocks"));
            let mut block = self.block_at(head, cursor);
            let mut scratch = [0_u8; BLOCK_SIZE];
            let mut copied = 0_usize;

            while copied < n {
                let local = cursor as usize % BLOCK_SIZE;
                let step = (BLOCK_SIZE - local).min(n - copied);
                let phys = self.superblock.phys_of(block);

                if local == 0 && step == BLOCK_SIZE {
                    self.dev
                        .write_block(phys, as_block(&buf[copied..copied + BLOCK_SIZE]))?;
                } else {
                    self.dev.read_block(phys, &mut scratch)?;
                    scratch[local..local + step].copy_from_slice(&buf[copied..copied + step]);
                    self.dev.write_block(phys, &scratch)?;
                }

                copied += step;
                cursor += step as u32;
                if copied < n {
                    block = self.chain_next(block);
                }
            }
        }

        let new_size = u64::from(old_size).max(u64::from(cursor));
        // Same capacity bound as above.
        #[allow(clippy::cast_possible_truncation)]
        let new_size = new_size as u32;
        if new_size != old_size || allocated {
            if new_size != old_size {
                self.root.entry_mut(file_id).size = new_size;
            }
            self.flush_root()?;
        }
        if allocated {
            self.flush_chain()?;
        }

        self.open_files.set_cursor(fd, cursor)?;
        Ok(n)
    }
}

// ── Session handle ──────────────────────────────────────────────────────────

/// Session handle owning at most one mounted volume.
///
/// Every operation requires a mount; a second mount while one is active is
/// rejected. Unmount refuses while descriptors are open, then drops the
/// in-memory state and releases the device.
#[derive(Default)]
pub struct ChainFs {
    volume: Option<Volume>,
}

impl ChainFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.volume.is_some()
    }

    fn volume(&self) -> Result<&Volume> {
        self.volume.as_ref().ok_or(FsError::NotMounted)
    }

    fn volume_mut(&mut self) -> Result<&mut Volume> {
        self.volume.as_mut().ok_or(FsError::NotMounted)
    }

    /// Mount the volume on `dev`.
    pub fn mount(&mut self, dev: impl BlockDevice + 'static) -> Result<()> {
        if self.volume.is_some() {
            return Err(FsError::AlreadyMounted);
        }
        self.volume = Some(Volume::mount(Box::new(dev))?);
        Ok(())
    }

    /// Open the image at `path` and mount it.
    pub fn mount_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.volume.is_some() {
            return Err(FsError::AlreadyMounted);
        }
        let dev = FileBlockDevice::open(path)?;
        self.volume = Some(Volume::mount(Box::new(dev))?);
        Ok(())
    }

    /// Release the mounted volume. All metadata was already flushed on each
    /// mutation, so this only refuses while descriptors remain open.
    pub fn unmount(&mut self) -> Result<()> {
        let volume = self.volume()?;
        let open = volume.open_files.open_count();
        if open > 0 {
            return Err(FsError::FilesOpen(open));
        }
        self.volume = None;
        info!("unmounted volume");
        Ok(())
    }

    /// Create an empty file named `name`.
    pub fn create(&mut self, name: &str) -> Result<()> {
        self.volume_mut()?.create(name)
    }

    /// Delete the file named `name`, releasing its chain.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        self.volume_mut()?.delete(name)
    }

    /// Occupied directory entries in slot order.
    pub fn list(&self) -> Result<impl Iterator<Item = FileInfo> + '_> {
        Ok(self.volume()?.list())
    }

    /// Volume geometry and live free-space counters.
    pub fn info(&self) -> Result<VolumeInfo> {
        Ok(self.volume()?.info())
    }

    /// Open `name`, returning the lowest free descriptor with its cursor
    /// at 0. The same file may be open through several descriptors at once.
    pub fn open(&mut self, name: &str) -> Result<Fd> {
        self.volume_mut()?.open(name)
    }

    /// Close a descriptor.
    pub fn close(&mut self, fd: Fd) -> Result<()> {
        self.volume_mut()?.close(fd)
    }

    /// Current size of the file behind `fd`.
    pub fn stat(&self, fd: Fd) -> Result<u32> {
        self.volume()?.stat(fd)
    }

    /// Move the descriptor's cursor to `offset` (at most the file size).
    pub fn seek(&mut self, fd: Fd, offset: u32) -> Result<()> {
        self.volume_mut()?.seek(fd, offset)
    }

    /// Read up to `count` bytes from the cursor, stopping at end of file.
    /// Returns the bytes actually read and advances the cursor past them.
    pub fn read(&mut self, fd: Fd, count: usize) -> Result<Vec<u8>> {
        self.volume_mut()?.read(fd, count)
    }

    /// Write `buf` at the cursor, growing the file as needed. On disk
    /// exhaustion the write degrades to whatever fits and the returned
    /// count reports the truth; that partial outcome is not an error.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize> {
        self.volume_mut()?.write(fd, buf)
    }
}

// ── Formatting ──────────────────────────────────────────────────────────────

/// Write a fresh, empty volume onto `dev`: superblock, chain table with the
/// entry-0 sentinel, and an empty root directory.
pub fn format_volume(dev: &dyn BlockDevice) -> Result<Superblock> {
    let total_blocks = u16::try_from(dev.block_count()).map_err(|_| {
        FsError::InvalidFormat(format!(
            "device has {} blocks; the format addresses at most {}",
            dev.block_count(),
            u16::MAX
        ))
    })?;
    let superblock =
        Superblock::with_total_blocks(total_blocks).map_err(|e| parse_to_fs_error(&e))?;

    dev.write_block(SUPERBLOCK_BLOCK, &superblock.encode())?;
    let chain = ChainTable::empty(superblock.data_block_count);
    for (index, block) in chain
        .encode_blocks(superblock.chain_table_blocks)
        .iter()
        .enumerate()
    {
        dev.write_block(CHAIN_TABLE_START_BLOCK + index as u32, block)?;
    }
    dev.write_block(u32::from(superblock.root_dir_block), &RootDir::empty().encode())?;
    dev.sync()?;

    info!(
        total_blocks,
        data_blocks = superblock.data_block_count,
        "formatted volume"
    );
    Ok(superblock)
}
