//! # Page Allocation
//!
//! The page-allocation primitive: reserve-and-commit of aligned regions,
//! protection transitions and release. Regions are always whole pages;
//! callers round sizes with [`round_up`] before asking.

use core::fmt;
use core::ptr::NonNull;

// ============================================================================
// PROTECTION
// ============================================================================

bitflags::bitflags! {
    /// Page protection
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageProtection: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXECUTE = 1 << 2;

        /// Data being populated
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Immutable code
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl PageProtection {
    /// Convert to `mmap`/`mprotect` protection bits
    #[cfg(unix)]
    fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Page operation result type
pub type PageResult<T> = Result<T, PageError>;

/// Page operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    /// Size is zero or not a multiple of the page size
    InvalidSize(usize),
    /// Alignment is not a power of two multiple of the page size
    InvalidAlignment(usize),
    /// The OS refused to reserve the region
    ReserveFailed {
        /// Requested size in bytes
        size: usize,
        /// OS error code
        errno: i32,
    },
    /// Protection transition refused
    ProtectFailed {
        /// Region start
        address: usize,
        /// Region size in bytes
        size: usize,
        /// OS error code
        errno: i32,
    },
    /// Release refused
    ReleaseFailed {
        /// Region start
        address: usize,
        /// Region size in bytes
        size: usize,
        /// OS error code
        errno: i32,
    },
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize(size) => write!(f, "Invalid page region size: {}", size),
            Self::InvalidAlignment(align) => write!(f, "Invalid page alignment: {:#x}", align),
            Self::ReserveFailed { size, errno } => {
                write!(f, "Failed to reserve {} bytes (errno {})", size, errno)
            },
            Self::ProtectFailed {
                address,
                size,
                errno,
            } => write!(
                f,
                "Failed to change protection of {:#x}+{:#x} (errno {})",
                address, size, errno
            ),
            Self::ReleaseFailed {
                address,
                size,
                errno,
            } => write!(
                f,
                "Failed to release {:#x}+{:#x} (errno {})",
                address, size, errno
            ),
        }
    }
}

impl std::error::Error for PageError {}

// ============================================================================
// HELPERS
// ============================================================================

/// Round `size` up to the next multiple of `alignment` (a power of two)
#[inline]
pub const fn round_up(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

/// Round `address` down to a multiple of `alignment` (a power of two)
#[inline]
pub const fn align_down(address: usize, alignment: usize) -> usize {
    address & !(alignment - 1)
}

// ============================================================================
// ALLOCATOR TRAIT
// ============================================================================

/// Page allocator collaborator
///
/// Implementations hand out whole, aligned pages. Every region returned by
/// [`reserve_and_commit`](PageAllocator::reserve_and_commit) must eventually
/// be given back to [`release`](PageAllocator::release) with the same size.
pub trait PageAllocator {
    /// Allocation granularity in bytes
    fn page_size(&self) -> usize;

    /// Reserve and commit `size` bytes aligned to `alignment`
    ///
    /// `hint` is a placement suggestion; implementations may ignore it.
    fn reserve_and_commit(
        &self,
        hint: usize,
        size: usize,
        alignment: usize,
        protection: PageProtection,
    ) -> PageResult<NonNull<u8>>;

    /// Change the protection of a committed region
    ///
    /// # Safety
    /// `address..address + size` must lie within a region returned by
    /// `reserve_and_commit` on this allocator, and no live reference may
    /// rely on the access being revoked.
    unsafe fn set_protection(
        &self,
        address: NonNull<u8>,
        size: usize,
        protection: PageProtection,
    ) -> PageResult<()>;

    /// Release a region
    ///
    /// # Safety
    /// `address` and `size` must be exactly a region returned by
    /// `reserve_and_commit` on this allocator, not yet released.
    unsafe fn release(&self, address: NonNull<u8>, size: usize) -> PageResult<()>;
}

fn check_request(page_size: usize, size: usize, alignment: usize) -> PageResult<()> {
    if size == 0 || size % page_size != 0 {
        return Err(PageError::InvalidSize(size));
    }
    if !alignment.is_power_of_two() || alignment < page_size {
        return Err(PageError::InvalidAlignment(alignment));
    }
    Ok(())
}

// ============================================================================
// HOST ALLOCATOR
// ============================================================================

static PAGE_SIZE: spin::Once<usize> = spin::Once::new();

/// Page allocator backed by the host OS (`mmap`/`mprotect`/`munmap`)
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPageAllocator;

impl HostPageAllocator {
    /// Create the host allocator
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Unmap over-reserved slack around an aligned window
///
/// # Safety
///
/// `start..start + len` must lie in a mapping nothing else refers to.
#[cfg(unix)]
unsafe fn unmap_slack(start: usize, len: usize) -> PageResult<()> {
    // SAFETY: guaranteed by the caller
    if unsafe { libc::munmap(start as *mut libc::c_void, len) } != 0 {
        return Err(PageError::ReleaseFailed {
            address: start,
            size: len,
            errno: last_errno(),
        });
    }
    Ok(())
}

#[cfg(unix)]
impl PageAllocator for HostPageAllocator {
    fn page_size(&self) -> usize {
        *PAGE_SIZE.call_once(|| {
            // SAFETY: sysconf has no preconditions
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size <= 0 { 4096 } else { size as usize }
        })
    }

    fn reserve_and_commit(
        &self,
        hint: usize,
        size: usize,
        alignment: usize,
        protection: PageProtection,
    ) -> PageResult<NonNull<u8>> {
        let page_size = self.page_size();
        check_request(page_size, size, alignment)?;

        // Over-reserve so an aligned window always exists, then trim.
        let padded = size + (alignment - page_size);
        let hint = align_down(hint, alignment);

        // SAFETY: anonymous private mapping, no fixed address
        let raw = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                padded,
                protection.to_prot(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(PageError::ReserveFailed {
                size,
                errno: last_errno(),
            });
        }

        let base = raw as usize;
        let aligned = round_up(base, alignment);
        let head = aligned - base;
        let tail = padded - head - size;

        // A failed trim only leaks slack outside the returned window.
        for (start, len) in [(base, head), (aligned + size, tail)] {
            if len == 0 {
                continue;
            }
            // SAFETY: head and tail lie inside the mapping created above
            if let Err(err) = unsafe { unmap_slack(start, len) } {
                log::warn!("page: {}", err);
            }
        }

        #[cfg(feature = "debug")]
        log::trace!(
            "page: reserved {:#x}+{:#x} (hint {:#x}, {:?})",
            aligned,
            size,
            hint,
            protection
        );

        NonNull::new(aligned as *mut u8).ok_or(PageError::ReserveFailed { size, errno: 0 })
    }

    unsafe fn set_protection(
        &self,
        address: NonNull<u8>,
        size: usize,
        protection: PageProtection,
    ) -> PageResult<()> {
        // SAFETY: caller guarantees the range belongs to a live mapping
        let rc = unsafe {
            libc::mprotect(
                address.as_ptr() as *mut libc::c_void,
                size,
                protection.to_prot(),
            )
        };
        if rc != 0 {
            return Err(PageError::ProtectFailed {
                address: address.as_ptr() as usize,
                size,
                errno: last_errno(),
            });
        }

        #[cfg(feature = "debug")]
        log::trace!(
            "page: {:#x}+{:#x} -> {:?}",
            address.as_ptr() as usize,
            size,
            protection
        );

        Ok(())
    }

    unsafe fn release(&self, address: NonNull<u8>, size: usize) -> PageResult<()> {
        // SAFETY: caller guarantees this is exactly one live mapping
        let rc = unsafe { libc::munmap(address.as_ptr() as *mut libc::c_void, size) };
        if rc != 0 {
            return Err(PageError::ReleaseFailed {
                address: address.as_ptr() as usize,
                size,
                errno: last_errno(),
            });
        }
        Ok(())
    }
}

// Without mmap the heap stands in; protections cannot be enforced.
#[cfg(not(unix))]
impl PageAllocator for HostPageAllocator {
    fn page_size(&self) -> usize {
        *PAGE_SIZE.call_once(|| 4096)
    }

    fn reserve_and_commit(
        &self,
        _hint: usize,
        size: usize,
        alignment: usize,
        _protection: PageProtection,
    ) -> PageResult<NonNull<u8>> {
        let page_size = self.page_size();
        check_request(page_size, size, alignment)?;
        if alignment != page_size {
            return Err(PageError::InvalidAlignment(alignment));
        }
        let layout = std::alloc::Layout::from_size_align(size, page_size)
            .map_err(|_| PageError::InvalidSize(size))?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(PageError::ReserveFailed { size, errno: 0 })
    }

    unsafe fn set_protection(
        &self,
        _address: NonNull<u8>,
        _size: usize,
        _protection: PageProtection,
    ) -> PageResult<()> {
        Ok(())
    }

    unsafe fn release(&self, address: NonNull<u8>, size: usize) -> PageResult<()> {
        let layout = std::alloc::Layout::from_size_align(size, self.page_size())
            .map_err(|_| PageError::InvalidSize(size))?;
        // SAFETY: caller guarantees the region came from reserve_and_commit
        unsafe { std::alloc::dealloc(address.as_ptr(), layout) };
        Ok(())
    }
}

static_assertions::assert_impl_all!(HostPageAllocator: Send, Sync);

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(align_down(0x12345, 0x1000), 0x12000);
    }

    #[test]
    fn test_protection_presets() {
        assert!(PageProtection::READ_EXECUTE.contains(PageProtection::EXECUTE));
        assert!(!PageProtection::READ_EXECUTE.contains(PageProtection::WRITE));
        assert!(PageProtection::READ_WRITE.contains(PageProtection::READ));
    }

    #[test]
    fn test_rejects_bad_requests() {
        let alloc = HostPageAllocator::new();
        let page = alloc.page_size();
        assert_eq!(
            alloc.reserve_and_commit(0, 0, page, PageProtection::READ_WRITE),
            Err(PageError::InvalidSize(0))
        );
        assert_eq!(
            alloc.reserve_and_commit(0, page + 1, page, PageProtection::READ_WRITE),
            Err(PageError::InvalidSize(page + 1))
        );
        assert_eq!(
            alloc.reserve_and_commit(0, page, page + 1, PageProtection::READ_WRITE),
            Err(PageError::InvalidAlignment(page + 1))
        );
    }

    #[test]
    fn test_reserve_write_protect_release() {
        let alloc = HostPageAllocator::new();
        let page = alloc.page_size();
        let region = alloc
            .reserve_and_commit(0, 2 * page, page, PageProtection::READ_WRITE)
            .unwrap();
        assert_eq!(region.as_ptr() as usize % page, 0);

        unsafe {
            core::ptr::write_bytes(region.as_ptr(), 0xAB, 2 * page);
            alloc
                .set_protection(region, 2 * page, PageProtection::READ)
                .unwrap();
            assert_eq!(*region.as_ptr().add(page), 0xAB);
            alloc.release(region, 2 * page).unwrap();
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_large_alignment() {
        let alloc = HostPageAllocator::new();
        let page = alloc.page_size();
        let alignment = page * 16;
        let region = alloc
            .reserve_and_commit(0, page, alignment, PageProtection::READ_WRITE)
            .unwrap();
        assert_eq!(region.as_ptr() as usize % alignment, 0);
        unsafe { alloc.release(region, page).unwrap() };
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_slack_unmap_is_reported() {
        let page = HostPageAllocator::new().page_size();
        // munmap rejects an unaligned start
        let err = unsafe { unmap_slack(page + 1, page) }.unwrap_err();
        assert!(matches!(
            err,
            PageError::ReleaseFailed { address, size, errno }
                if address == page + 1 && size == page && errno != 0
        ));
    }
}
