#![forbid(unsafe_code)]
//! On-disk metadata codecs.
//!
//! The volume layout is fixed:
//!
//! | blocks | contents |
//! |---|---|
//! | 0 | superblock |
//! | 1 ..= chain_table_blocks | chain table, 16-bit entries packed LE |
//! | chain_table_blocks + 1 | root directory, 128 × 32-byte entries |
//! | data_start_block .. | data blocks, addressed by [`DataBlock`] index |
//!
//! Everything here is pure byte-level parsing and encoding; device I/O and
//! mount policy live in `cfs-core`. All multi-byte integers are
//! little-endian.

use cfs_types::{
    BLOCK_SIZE, CHAIN_END, CHAIN_FREE, DIR_ENTRY_SIZE, DataBlock, FILENAME_SIZE, FileId,
    ParseError, ROOT_DIR_CAPACITY, SUPERBLOCK_SIGNATURE, ensure_slice, read_fixed, read_le_u16,
    read_le_u32, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

/// Parsed superblock (block 0).
///
/// Geometry fields are stored raw; [`validate`](Self::validate) checks the
/// internal consistency rules and the device block count before a mount may
/// proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    /// Block count of the whole device.
    pub total_blocks: u16,
    /// Index of the single root-directory block.
    pub root_dir_block: u16,
    /// Index of the first data block.
    pub data_start_block: u16,
    /// Number of allocatable data blocks (chain-table entries).
    pub data_block_count: u16,
    /// Number of blocks occupied by the chain table.
    pub chain_table_blocks: u8,
}

/// Number of blocks the chain table needs for `data_block_count` 16-bit
/// entries.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // at most ceil(131070 / 4096) = 32
pub fn required_chain_blocks(data_block_count: u16) -> u8 {
    let bytes = 2 * u32::from(data_block_count);
    bytes.div_ceil(BLOCK_SIZE as u32) as u8
}

impl Superblock {
    /// Parse a superblock from the contents of block 0.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let signature = read_fixed::<8>(block, 0)?;
        if signature != SUPERBLOCK_SIGNATURE {
            return Err(ParseError::InvalidSignature);
        }

        let total_blocks = read_le_u16(block, 8)?;
        let root_dir_block = read_le_u16(block, 10)?;
        let data_start_block = read_le_u16(block, 12)?;
        let data_block_count = read_le_u16(block, 14)?;
        let chain_table_blocks = ensure_slice(block, 16, 1)?[0];

        Ok(Self {
            total_blocks,
            root_dir_block,
            data_start_block,
            data_block_count,
            chain_table_blocks,
        })
    }

    /// Encode into a full superblock block. Padding bytes are zero.
    #[must_use]
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0_u8; BLOCK_SIZE];
        block[0..8].copy_from_slice(&SUPERBLOCK_SIGNATURE);
        write_le_u16(&mut block, 8, self.total_blocks);
        write_le_u16(&mut block, 10, self.root_dir_block);
        write_le_u16(&mut block, 12, self.data_start_block);
        write_le_u16(&mut block, 14, self.data_block_count);
        block[16] = self.chain_table_blocks;
        block
    }

    /// Check the geometry invariants against the device's reported block
    /// count. A volume may only be mounted if every rule holds.
    pub fn validate(&self, device_block_count: u32) -> Result<(), ParseError> {
        if u32::from(self.total_blocks) != device_block_count {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "does not match device block count",
            });
        }
        if self.chain_table_blocks != required_chain_blocks(self.data_block_count) {
            return Err(ParseError::InvalidField {
                field: "chain_table_blocks",
                reason: "does not cover the chain table",
            });
        }
        let expected_data = u32::from(self.total_blocks)
            .checked_sub(2 + u32::from(self.chain_table_blocks))
            .ok_or(ParseError::InvalidField {
                field: "total_blocks",
                reason: "too small for metadata blocks",
            })?;
        if u32::from(self.data_block_count) != expected_data {
            return Err(ParseError::InvalidField {
                field: "data_block_count",
                reason: "inconsistent with total_blocks and chain_table_blocks",
            });
        }
        if self.root_dir_block != u16::from(self.chain_table_blocks) + 1 {
            return Err(ParseError::InvalidField {
                field: "root_dir_block",
                reason: "must follow the chain table",
            });
        }
        if self.data_start_block != self.root_dir_block + 1 {
            return Err(ParseError::InvalidField {
                field: "data_start_block",
                reason: "must follow the root directory",
            });
        }
        Ok(())
    }

    /// Solve the geometry for a device of `total_blocks` blocks.
    ///
    /// Not every block count admits a consistent layout: near chain-table
    /// size boundaries the entry count and the blocks needed to hold it can
    /// chase each other with no fixed point.
    pub fn with_total_blocks(total_blocks: u16) -> Result<Self, ParseError> {
        // 1 superblock + 1 chain block + 1 root block + at least 1 data block.
        if total_blocks < 4 {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "too small for superblock, chain table, root directory and data",
            });
        }

        for chain_table_blocks in 1_u16..=32 {
            let Some(data_block_count) = total_blocks.checked_sub(2 + chain_table_blocks) else {
                break;
            };
            if u16::from(required_chain_blocks(data_block_count)) == chain_table_blocks {
                #[allow(clippy::cast_possible_truncation)]
                let chain_table_blocks = chain_table_blocks as u8;
                return Ok(Self {
                    total_blocks,
                    root_dir_block: u16::from(chain_table_blocks) + 1,
                    data_start_block: u16::from(chain_table_blocks) + 2,
                    data_block_count,
                    chain_table_blocks,
                });
            }
        }

        Err(ParseError::InvalidField {
            field: "total_blocks",
            reason: "no consistent chain-table geometry exists for this block count",
        })
    }

    /// Physical block backing data block `index`.
    #[must_use]
    pub fn phys_of(&self, index: DataBlock) -> u32 {
        u32::from(self.data_start_block) + u32::from(index.0)
    }
}

// ── Filename validation ─────────────────────────────────────────────────────

/// Whether `name` fits a directory entry: non-empty, NUL-free, and short
/// enough to leave room for the terminator in the 16-byte buffer.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() < FILENAME_SIZE && !name.bytes().any(|b| b == 0)
}

// ── Directory entries ───────────────────────────────────────────────────────

/// One 32-byte root-directory entry.
///
/// An empty slot is all-zero in its name field. For occupied slots,
/// `size == 0` exactly when `first_block == CHAIN_END`: a zero-length file
/// owns no blocks, anything larger owns at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; FILENAME_SIZE],
    pub size: u32,
    pub first_block: u16,
}

impl DirEntry {
    /// An unoccupied slot.
    pub const EMPTY: Self = Self {
        name: [0; FILENAME_SIZE],
        size: 0,
        first_block: CHAIN_END,
    };

    /// Fresh entry for a newly created, zero-length file.
    ///
    /// `name` must already satisfy [`is_valid_name`].
    #[must_use]
    pub fn new(name: &str) -> Self {
        debug_assert!(is_valid_name(name));
        let mut buf = [0_u8; FILENAME_SIZE];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            name: buf,
            size: 0,
            first_block: CHAIN_END,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name[0] == 0
    }

    /// Stored filename as a string.
    #[must_use]
    pub fn name_str(&self) -> String {
        cfs_types::decode_nul_terminated(&self.name)
    }

    /// Whether this occupied slot stores exactly `name`.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        if self.is_empty() || name.len() >= FILENAME_SIZE {
            return false;
        }
        &self.name[..name.len()] == name.as_bytes() && self.name[name.len()] == 0
    }

    /// First block of the chain, or `None` for a zero-length file.
    #[must_use]
    pub fn first_block(&self) -> Option<DataBlock> {
        (self.first_block != CHAIN_END).then_some(DataBlock(self.first_block))
    }

    fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            name: read_fixed::<FILENAME_SIZE>(bytes, 0)?,
            size: read_le_u32(bytes, 16)?,
            first_block: read_le_u16(bytes, 20)?,
        })
    }

    fn encode_into(&self, out: &mut [u8]) {
        out[..FILENAME_SIZE].copy_from_slice(&self.name);
        write_le_u32(out, 16, self.size);
        write_le_u16(out, 20, self.first_block);
        // Bytes 22..32 are padding and stay zero.
    }

    /// Check the per-slot occupancy invariant.
    pub fn check(&self) -> Result<(), ParseError> {
        if self.is_empty() {
            return Ok(());
        }
        match (self.size, self.first_block) {
            (0, CHAIN_END) => Ok(()),
            (0, _) => Err(ParseError::InvalidField {
                field: "first_block",
                reason: "zero-length file owns a block",
            }),
            (_, CHAIN_END) => Err(ParseError::InvalidField {
                field: "first_block",
                reason: "non-empty file owns no blocks",
            }),
            _ => Ok(()),
        }
    }
}

/// The root directory: a fixed-capacity ordered table of file entries
/// occupying a single block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDir {
    entries: Vec<DirEntry>,
}

impl RootDir {
    /// A directory with every slot free.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: vec![DirEntry::EMPTY; ROOT_DIR_CAPACITY],
        }
    }

    /// Parse the root-directory block, checking every slot's invariant.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let mut entries = Vec::with_capacity(ROOT_DIR_CAPACITY);
        for slot in 0..ROOT_DIR_CAPACITY {
            let bytes = ensure_slice(block, slot * DIR_ENTRY_SIZE, DIR_ENTRY_SIZE)?;
            let entry = DirEntry::parse(bytes)?;
            entry.check()?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Encode into a full directory block.
    #[must_use]
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0_u8; BLOCK_SIZE];
        for (slot, entry) in self.entries.iter().enumerate() {
            entry.encode_into(&mut block[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]);
        }
        block
    }

    #[must_use]
    pub fn entry(&self, id: FileId) -> &DirEntry {
        &self.entries[id.0]
    }

    pub fn entry_mut(&mut self, id: FileId) -> &mut DirEntry {
        &mut self.entries[id.0]
    }

    /// Locate the occupied slot storing `name`.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<FileId> {
        self.entries
            .iter()
            .position(|entry| entry.matches(name))
            .map(FileId)
    }

    /// Lowest free slot, if any.
    #[must_use]
    pub fn first_free(&self) -> Option<FileId> {
        self.entries
            .iter()
            .position(DirEntry::is_empty)
            .map(FileId)
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_empty()).count()
    }

    /// Occupied slots in slot-index order.
    pub fn iter_occupied(&self) -> impl Iterator<Item = (FileId, &DirEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_empty())
            .map(|(slot, entry)| (FileId(slot), entry))
    }
}

// ── Chain table ─────────────────────────────────────────────────────────────

/// Decoded state of one chain-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLink {
    /// The data block is unallocated.
    Free,
    /// Allocated; last block of its chain.
    End,
    /// Allocated; the chain continues at this data block.
    Next(DataBlock),
}

impl ChainLink {
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            CHAIN_FREE => Self::Free,
            CHAIN_END => Self::End,
            next => Self::Next(DataBlock(next)),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u16 {
        match self {
            Self::Free => CHAIN_FREE,
            Self::End => CHAIN_END,
            Self::Next(block) => block.0,
        }
    }
}

/// The allocation structure: a flat array of `data_block_count` entries,
/// one per data block, packed across the chain-table blocks.
///
/// Entry 0 is a permanent [`ChainLink::End`] sentinel. It guards against a
/// zero-initialized disk being mistaken for a formatted one, and keeps data
/// block 0 out of every chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTable {
    entries: Vec<u16>,
}

impl ChainTable {
    /// A freshly formatted table: everything free except the sentinel.
    #[must_use]
    pub fn empty(data_block_count: u16) -> Self {
        let mut entries = vec![CHAIN_FREE; usize::from(data_block_count)];
        if let Some(first) = entries.first_mut() {
            *first = CHAIN_END;
        }
        Self { entries }
    }

    /// Decode `data_block_count` entries from the concatenated chain-table
    /// blocks, checking the sentinel.
    pub fn parse(bytes: &[u8], data_block_count: u16) -> Result<Self, ParseError> {
        let mut entries = Vec::with_capacity(usize::from(data_block_count));
        for index in 0..usize::from(data_block_count) {
            entries.push(read_le_u16(bytes, index * 2)?);
        }
        if entries.first() != Some(&CHAIN_END) {
            return Err(ParseError::InvalidField {
                field: "chain_table",
                reason: "entry 0 is not the end-of-chain sentinel",
            });
        }
        Ok(Self { entries })
    }

    /// Encode into exactly `chain_table_blocks` blocks. Trailing bytes past
    /// the last entry are zero.
    #[must_use]
    pub fn encode_blocks(&self, chain_table_blocks: u8) -> Vec<[u8; BLOCK_SIZE]> {
        let mut blocks = vec![[0_u8; BLOCK_SIZE]; usize::from(chain_table_blocks)];
        for (index, &raw) in self.entries.iter().enumerate() {
            let byte = index * 2;
            write_le_u16(&mut blocks[byte / BLOCK_SIZE], byte % BLOCK_SIZE, raw);
        }
        blocks
    }

    /// Number of entries (equals the volume's data block count).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // construction bounds the length to u16
    pub fn len(&self) -> u16 {
        self.entries.len() as u16
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decoded entry for data block `index`.
    ///
    /// Panics if `index` is out of range; chain walks only reach an index
    /// through links that the allocator wrote, so an out-of-range link means
    /// the table no longer describes the volume.
    #[must_use]
    pub fn link(&self, index: DataBlock) -> ChainLink {
        let raw = self.entries.get(usize::from(index.0)).unwrap_or_else(|| {
            panic!(
                "chain table corruption: link to data block {index} outside table of {}",
                self.entries.len()
            )
        });
        ChainLink::from_raw(*raw)
    }

    pub fn set_link(&mut self, index: DataBlock, link: ChainLink) {
        self.entries[usize::from(index.0)] = link.to_raw();
    }

    /// Number of free entries.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.entries.iter().filter(|&&raw| raw == CHAIN_FREE).count()
    }
}
