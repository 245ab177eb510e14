//! # Blob Layout
//!
//! Placement of code units inside the code region and the fixed field
//! offsets of the metadata region.
//!
//! ## Code Region
//!
//! ```text
//! 0                 CODE_HEADER_SIZE
//! ┌─────────────────┬──────────┬─────┬────────────────┬─────┬─────────┐
//! │ reserved header │ unit 0   │ pad │ unit 1         │ pad │ unit 2 …│
//! └─────────────────┴──────────┴─────┴────────────────┴─────┴─────────┘
//!                   ▲ offset 0       ▲ offset 1 (aligned)
//! ```
//!
//! ## Metadata Region
//!
//! ```text
//! [0  .. 8)       blob integrity hash   (u64, little endian)
//! [8  .. 16)      generation context hash (u64, little endian)
//! [16 .. 16+8N)   N × { offset: u32, length: u32 } (little endian)
//! ```

use crate::{BlobError, BlobResult};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Reserved bytes at the start of the code region
pub const CODE_HEADER_SIZE: usize = 64;

/// Largest supported code alignment
pub const MAX_CODE_ALIGNMENT: u32 = CODE_HEADER_SIZE as u32;

/// Default code alignment
pub const DEFAULT_CODE_ALIGNMENT: u32 = 32;

/// Offset of the blob integrity hash
pub const BLOB_HASH_OFFSET: usize = 0;
/// Size of the blob integrity hash
pub const BLOB_HASH_SIZE: usize = core::mem::size_of::<u64>();
/// Offset of the generation context hash
pub const CONTEXT_HASH_OFFSET: usize = BLOB_HASH_OFFSET + BLOB_HASH_SIZE;
/// Size of the generation context hash
pub const CONTEXT_HASH_SIZE: usize = core::mem::size_of::<u64>();
/// Offset of the metadata table
pub const METADATA_TABLE_OFFSET: usize = CONTEXT_HASH_OFFSET + CONTEXT_HASH_SIZE;
/// Size of one metadata table entry
pub const METADATA_ENTRY_SIZE: usize = 2 * core::mem::size_of::<u32>();

static_assertions::const_assert_eq!(BLOB_HASH_SIZE, 8);
static_assertions::const_assert_eq!(CONTEXT_HASH_SIZE, 8);
static_assertions::const_assert_eq!(METADATA_ENTRY_SIZE, 8);
static_assertions::const_assert!(MAX_CODE_ALIGNMENT.is_power_of_two());
static_assertions::const_assert!(DEFAULT_CODE_ALIGNMENT <= MAX_CODE_ALIGNMENT);

/// Metadata region size for `unit_count` units
pub const fn metadata_size(unit_count: usize) -> usize {
    METADATA_TABLE_OFFSET + unit_count * METADATA_ENTRY_SIZE
}

// ============================================================================
// METADATA ENTRY
// ============================================================================

/// Placement of one code unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataEntry {
    /// Offset from the start of the raw code (after the header)
    pub offset: u32,
    /// Instruction bytes, excluding padding
    pub length: u32,
}

impl MetadataEntry {
    /// End of the instructions (exclusive)
    pub const fn end(&self) -> u32 {
        self.offset + self.length
    }

    pub(crate) fn read(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), METADATA_ENTRY_SIZE);
        Self {
            offset: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub(crate) fn write(&self, bytes: &mut [u8]) {
        debug_assert_eq!(bytes.len(), METADATA_ENTRY_SIZE);
        bytes[..4].copy_from_slice(&self.offset.to_le_bytes());
        bytes[4..].copy_from_slice(&self.length.to_le_bytes());
    }
}

// ============================================================================
// LAYOUT
// ============================================================================

/// Computed placement of every code unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    entries: Vec<MetadataEntry>,
    raw_code_size: u32,
    alignment: u32,
}

impl Layout {
    /// Place units of the given lengths, in order
    ///
    /// Each offset is the running total rounded up to `alignment`; the
    /// total is rounded up once more so the last unit carries its own
    /// padding.
    pub fn compute<I>(lengths: I, alignment: u32) -> BlobResult<Self>
    where
        I: IntoIterator<Item = u32>,
    {
        if !alignment.is_power_of_two() || alignment > MAX_CODE_ALIGNMENT {
            return Err(BlobError::InvalidConfig("code alignment"));
        }

        let lengths = lengths.into_iter();
        let mut entries = Vec::with_capacity(lengths.size_hint().0);
        let mut total: u64 = 0;

        for length in lengths {
            let offset = align_u64(total, alignment);
            entries.push(MetadataEntry {
                offset: to_u32(offset)?,
                length,
            });
            total = offset + length as u64;
        }

        let raw_code_size = to_u32(align_u64(total, alignment))?;
        // Code region size must fit as well
        to_u32(raw_code_size as u64 + CODE_HEADER_SIZE as u64)?;

        assert!(
            entries.windows(2).all(|w| w[0].end() <= w[1].offset),
            "layout entries out of address order"
        );

        Ok(Self {
            entries,
            raw_code_size,
            alignment,
        })
    }

    /// Per-unit placement
    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    /// Number of units
    pub fn unit_count(&self) -> usize {
        self.entries.len()
    }

    /// Code alignment used
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Raw code bytes, padding included, header excluded
    pub fn raw_code_size(&self) -> u32 {
        self.raw_code_size
    }

    /// Code region size (header + raw code)
    pub fn code_size(&self) -> usize {
        CODE_HEADER_SIZE + self.raw_code_size as usize
    }

    /// Metadata region size
    pub fn metadata_size(&self) -> usize {
        metadata_size(self.entries.len())
    }

    /// Bytes from unit `index`'s start to the next unit (or the end)
    pub fn padded_length(&self, index: usize) -> u32 {
        padded_length(&self.entries, self.raw_code_size, index)
    }
}

pub(crate) fn padded_length(entries: &[MetadataEntry], raw_code_size: u32, index: usize) -> u32 {
    let next = entries
        .get(index + 1)
        .map(|entry| entry.offset)
        .unwrap_or(raw_code_size);
    next - entries[index].offset
}

fn align_u64(value: u64, alignment: u32) -> u64 {
    let mask = alignment as u64 - 1;
    (value + mask) & !mask
}

fn to_u32(value: u64) -> BlobResult<u32> {
    u32::try_from(value).map_err(|_| BlobError::TooLarge { size: value })
}

// ============================================================================
// TESTS
// ============================================================================
