//! # Embedded Data View
//!
//! [`EmbeddedData`] reads a finished blob: metadata fields, per-unit
//! instruction ranges, integrity hashes and address resolution. It borrows
//! the two regions and works the same over the build-time buffers and over
//! hosted pages.

use core::ops::{Range, RangeInclusive};

use crate::checksum::checksum;
use crate::layout::{
    BLOB_HASH_OFFSET, BLOB_HASH_SIZE, CODE_HEADER_SIZE, CONTEXT_HASH_OFFSET,
    METADATA_ENTRY_SIZE, METADATA_TABLE_OFFSET, MetadataEntry,
};
use crate::{BlobError, BlobResult};

/// Read-only view of a blob's code and metadata regions
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedData<'a> {
    code: &'a [u8],
    metadata: &'a [u8],
}

impl<'a> EmbeddedData<'a> {
    /// View over regions already known to be well formed
    pub(crate) fn new(code: &'a [u8], metadata: &'a [u8]) -> Self {
        debug_assert!(code.len() >= CODE_HEADER_SIZE);
        debug_assert!(metadata.len() >= METADATA_TABLE_OFFSET);
        debug_assert_eq!((metadata.len() - METADATA_TABLE_OFFSET) % METADATA_ENTRY_SIZE, 0);
        Self { code, metadata }
    }

    /// View over serialized regions, checking structure and integrity hash
    pub fn from_raw(code: &'a [u8], metadata: &'a [u8]) -> BlobResult<Self> {
        validate(code, metadata)?;
        let data = Self { code, metadata };
        data.verify_blob_hash()?;
        Ok(data)
    }

    // ========================================================================
    // Regions
    // ========================================================================

    /// Code region (header included)
    pub fn code(&self) -> &'a [u8] {
        self.code
    }

    /// Metadata region
    pub fn metadata(&self) -> &'a [u8] {
        self.metadata
    }

    /// Code region size
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Metadata region size
    pub fn metadata_size(&self) -> usize {
        self.metadata.len()
    }

    /// Address of the code region
    pub fn code_start(&self) -> usize {
        self.code.as_ptr() as usize
    }

    /// End of the code region (exclusive)
    pub fn code_end(&self) -> usize {
        self.code_start() + self.code.len()
    }

    /// Raw code bytes, padding included, header excluded
    pub fn raw_code(&self) -> &'a [u8] {
        &self.code[CODE_HEADER_SIZE..]
    }

    /// `pc` lies in this blob's code region
    pub fn contains_pc(&self, pc: usize) -> bool {
        self.code_start() <= pc && pc < self.code_end()
    }

    // ========================================================================
    // Metadata Table
    // ========================================================================

    /// Number of code units
    pub fn unit_count(&self) -> usize {
        (self.metadata.len() - METADATA_TABLE_OFFSET) / METADATA_ENTRY_SIZE
    }

    /// Table entry of unit `index`
    pub fn entry(&self, index: usize) -> MetadataEntry {
        debug_assert!(index < self.unit_count(), "unit {} out of range", index);
        let start = METADATA_TABLE_OFFSET + index * METADATA_ENTRY_SIZE;
        MetadataEntry::read(&self.metadata[start..start + METADATA_ENTRY_SIZE])
    }

    /// All table entries
    pub fn entries(&self) -> impl ExactSizeIterator<Item = MetadataEntry> + 'a {
        self.metadata[METADATA_TABLE_OFFSET..]
            .chunks_exact(METADATA_ENTRY_SIZE)
            .map(MetadataEntry::read)
    }

    /// Address of unit `index`'s first instruction
    pub fn instruction_start_of(&self, index: usize) -> usize {
        let entry = self.entry(index);
        let start = self.code_start() + CODE_HEADER_SIZE + entry.offset as usize;
        debug_assert!(start <= self.code_end());
        debug_assert!(start < self.code_end() || entry.length == 0);
        start
    }

    /// Instruction bytes of unit `index`, excluding padding
    pub fn instruction_size_of(&self, index: usize) -> u32 {
        self.entry(index).length
    }

    /// Start address and length of unit `index`
    pub fn instruction_range(&self, index: usize) -> (usize, u32) {
        (self.instruction_start_of(index), self.instruction_size_of(index))
    }

    /// Instruction bytes of unit `index`
    pub fn instructions_of(&self, index: usize) -> &'a [u8] {
        let entry = self.entry(index);
        let start = CODE_HEADER_SIZE + entry.offset as usize;
        &self.code[start..start + entry.length as usize]
    }

    /// Bytes from unit `index`'s start to the next unit's start
    pub fn padded_instruction_size_of(&self, index: usize) -> u32 {
        let next = if index + 1 < self.unit_count() {
            self.entry(index + 1).offset
        } else {
            self.raw_code().len() as u32
        };
        next - self.entry(index).offset
    }

    /// Address span from the first instruction of `units.start()` to the
    /// end of the instructions of `units.end()`
    pub fn instructions_span(&self, units: RangeInclusive<usize>) -> Range<usize> {
        let (first, last) = units.into_inner();
        debug_assert!(first <= last);
        let (start, _) = self.instruction_range(first);
        let (last_start, last_length) = self.instruction_range(last);
        start..last_start + last_length as usize
    }

    // ========================================================================
    // Hashes
    // ========================================================================

    /// Integrity hash stored in the metadata
    pub fn embedded_blob_hash(&self) -> u64 {
        read_u64(self.metadata, BLOB_HASH_OFFSET)
    }

    /// Generation context hash stored in the metadata
    pub fn context_hash(&self) -> u64 {
        read_u64(self.metadata, CONTEXT_HASH_OFFSET)
    }

    /// Recompute the integrity hash: everything but the hash field itself
    pub fn create_embedded_blob_hash(&self) -> u64 {
        const _: () = assert!(BLOB_HASH_OFFSET == 0);
        checksum(&[&self.metadata[BLOB_HASH_SIZE..], self.code])
    }

    /// Stored integrity hash matches the contents
    pub fn verify_blob_hash(&self) -> BlobResult<()> {
        let stored = self.embedded_blob_hash();
        let computed = self.create_embedded_blob_hash();
        if stored != computed {
            return Err(BlobError::HashMismatch { stored, computed });
        }
        Ok(())
    }

    /// Blob was generated against context `expected`
    pub fn verify_context_hash(&self, expected: u64) -> BlobResult<()> {
        let found = self.context_hash();
        if found != expected {
            return Err(BlobError::ContextMismatch { expected, found });
        }
        Ok(())
    }

    // ========================================================================
    // Resolver
    // ========================================================================

    /// Unit owning `address`
    ///
    /// Padding after a unit belongs to that unit. Addresses in the header
    /// or outside the code region resolve to `None`.
    pub fn try_lookup_code(&self, address: usize) -> Option<usize> {
        if !self.contains_pc(address) || self.unit_count() == 0 {
            return None;
        }
        if address < self.instruction_start_of(0) {
            return None;
        }

        let mut low = 0;
        let mut high = self.unit_count();
        while low < high {
            let mid = low + (high - low) / 2;
            let start = self.instruction_start_of(mid);
            let end = start + self.padded_instruction_size_of(mid) as usize;
            if address < start {
                high = mid;
            } else if address >= end {
                low = mid + 1;
            } else {
                return Some(mid);
            }
        }

        panic!(
            "no code unit owns {:#x} in blob {:#x}..{:#x}",
            address,
            self.code_start(),
            self.code_end()
        );
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Structural checks for regions that did not come from the builder
pub(crate) fn validate(code: &[u8], metadata: &[u8]) -> BlobResult<()> {
    if code.len() < CODE_HEADER_SIZE {
        return Err(BlobError::Malformed("code region shorter than its header"));
    }
    if u32::try_from(code.len()).is_err() {
        return Err(BlobError::TooLarge {
            size: code.len() as u64,
        });
    }
    if metadata.len() < METADATA_TABLE_OFFSET
        || (metadata.len() - METADATA_TABLE_OFFSET) % METADATA_ENTRY_SIZE != 0
    {
        return Err(BlobError::Malformed("metadata size"));
    }
    let raw_code_size = (code.len() - CODE_HEADER_SIZE) as u64;
    let mut previous_end = 0u64;
    for chunk in metadata[METADATA_TABLE_OFFSET..].chunks_exact(METADATA_ENTRY_SIZE) {
        let entry = MetadataEntry::read(chunk);
        let offset = entry.offset as u64;
        let end = offset + entry.length as u64;
        if offset < previous_end {
            return Err(BlobError::Malformed("metadata table out of address order"));
        }
        if end > raw_code_size {
            return Err(BlobError::Malformed("code unit exceeds the code region"));
        }
        previous_end = end;
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
