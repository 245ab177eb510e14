//! # Off-Heap Instruction Stream
//!
//! Re-hosts a blob for one runtime instance: both regions are copied into
//! freshly mapped pages at randomized addresses, then the code pages become
//! read+execute and the metadata pages read-only.
//!
//! ```text
//!   Blob (build buffers)             hosted pages
//!   ┌──────────────┐  copy   ┌──────────────────────┐
//!   │ code         │────────▶│ code      RW ──▶ RX  │
//!   ├──────────────┤         ├──────────────────────┤
//!   │ metadata     │────────▶│ metadata  RW ──▶ R   │
//!   └──────────────┘         └──────────────────────┘
//! ```
//!
//! Each instantiation owns its own pages until
//! [`dispose`](OffHeapInstructionStream::dispose) gives them back.

use core::ptr::NonNull;

use helix_hal::{MmapRandomizer, PageAllocator, PageProtection, round_up};

use crate::data::EmbeddedData;
use crate::{BlobError, BlobResult};

/// A blob hosted in its own pages
///
/// Must be passed to [`dispose`](Self::dispose) with the allocator that
/// created it; dropping it leaks the pages.
#[must_use = "hosted pages leak unless disposed"]
#[derive(Debug)]
pub struct OffHeapInstructionStream {
    code: NonNull<u8>,
    code_size: u32,
    metadata: NonNull<u8>,
    metadata_size: u32,
}

// SAFETY: both regions are immutable after instantiation
unsafe impl Send for OffHeapInstructionStream {}
// SAFETY: both regions are immutable after instantiation
unsafe impl Sync for OffHeapInstructionStream {}

impl OffHeapInstructionStream {
    /// Copy `blob` into newly mapped pages
    ///
    /// Either both regions are hosted and protected, or nothing stays
    /// mapped.
    pub fn instantiate<A>(
        allocator: &A,
        randomizer: &MmapRandomizer,
        blob: &EmbeddedData<'_>,
    ) -> BlobResult<Self>
    where
        A: PageAllocator + ?Sized,
    {
        let code_size = u32::try_from(blob.code_size()).map_err(|_| BlobError::TooLarge {
            size: blob.code_size() as u64,
        })?;
        let metadata_size =
            u32::try_from(blob.metadata_size()).map_err(|_| BlobError::TooLarge {
                size: blob.metadata_size() as u64,
            })?;

        let code = host_region(allocator, randomizer, blob.code(), PageProtection::READ_EXECUTE)?;
        let metadata =
            match host_region(allocator, randomizer, blob.metadata(), PageProtection::READ) {
                Ok(metadata) => metadata,
                Err(err) => {
                    release_quietly(allocator, code, blob.code_size());
                    return Err(err);
                },
            };

        Ok(Self {
            code,
            code_size,
            metadata,
            metadata_size,
        })
    }

    /// Release both regions
    ///
    /// Both releases are attempted; the first failure is returned.
    pub fn dispose<A>(self, allocator: &A) -> BlobResult<()>
    where
        A: PageAllocator + ?Sized,
    {
        let page_size = allocator.page_size();
        let code_len = round_up(self.code_size as usize, page_size);
        let metadata_len = round_up(self.metadata_size as usize, page_size);

        // SAFETY: both regions came from `instantiate` on this allocator with
        // the same rounded sizes, and `self` is consumed
        let code = unsafe { allocator.release(self.code, code_len) };
        // SAFETY: as above
        let metadata = unsafe { allocator.release(self.metadata, metadata_len) };

        log::debug!(
            "embedded: released code {:#x}+{:#x}, metadata {:#x}+{:#x}",
            self.code.as_ptr() as usize,
            code_len,
            self.metadata.as_ptr() as usize,
            metadata_len
        );

        code?;
        metadata?;
        Ok(())
    }

    /// First byte of the hosted code region
    pub fn code(&self) -> NonNull<u8> {
        self.code
    }

    /// Code region size, not page rounded
    pub fn code_size(&self) -> u32 {
        self.code_size
    }

    /// First byte of the hosted metadata region
    pub fn metadata(&self) -> NonNull<u8> {
        self.metadata
    }

    /// Metadata region size, not page rounded
    pub fn metadata_size(&self) -> u32 {
        self.metadata_size
    }

    /// View of the hosted regions
    pub fn data(&self) -> EmbeddedData<'_> {
        // SAFETY: both regions stay mapped and readable until `dispose`,
        // which consumes `self`
        let (code, metadata) = unsafe {
            (
                core::slice::from_raw_parts(self.code.as_ptr(), self.code_size as usize),
                core::slice::from_raw_parts(self.metadata.as_ptr(), self.metadata_size as usize),
            )
        };
        EmbeddedData::new(code, metadata)
    }
}

/// Map, fill and protect one region
fn host_region<A>(
    allocator: &A,
    randomizer: &MmapRandomizer,
    bytes: &[u8],
    protection: PageProtection,
) -> BlobResult<NonNull<u8>>
where
    A: PageAllocator + ?Sized,
{
    let page_size = allocator.page_size();
    let size = round_up(bytes.len(), page_size);
    let hint = randomizer.random_aligned_addr(page_size);

    let region = allocator.reserve_and_commit(hint, size, page_size, PageProtection::READ_WRITE)?;

    // SAFETY: region is `size >= bytes.len()` writable bytes, freshly mapped
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), region.as_ptr(), bytes.len());
    }

    // SAFETY: region was just returned by this allocator with this size
    if let Err(err) = unsafe { allocator.set_protection(region, size, protection) } {
        release_quietly(allocator, region, bytes.len());
        return Err(err.into());
    }

    log::debug!(
        "embedded: hosted {} bytes at {:#x}+{:#x} (hint {:#x}, {:?})",
        bytes.len(),
        region.as_ptr() as usize,
        size,
        hint,
        protection
    );

    Ok(region)
}

/// Release a region while already failing
fn release_quietly<A>(allocator: &A, region: NonNull<u8>, len: usize)
where
    A: PageAllocator + ?Sized,
{
    let size = round_up(len, allocator.page_size());
    // SAFETY: region came from `host_region` with this rounded size
    if let Err(err) = unsafe { allocator.release(region, size) } {
        log::error!("embedded: {}", err);
    }
}

// ============================================================================
// TESTS
// ============================================================================
