pub mod bo;
pub mod dma;
pub mod fence;
pub mod manager;
pub mod migrate;
pub mod placement;
pub mod pool;

use crate::error::{MemError, MemResult};
use crate::utils::{PAGE_SIZE, pages_to_bytes};
use bitflags::bitflags;
use std::ptr::{self, NonNull};

pub use bo::{BoId, BufferObject, KernelMap};
pub use fence::{Fence, FencePool};
pub use manager::{MemConfig, MemoryManager};
pub use placement::{PlaceEntry, Placement, compute_placement};
pub use pool::{Pool, PoolSet};

bitflags! {
    /// Requested memory domains for a buffer object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Domain: u32 {
        /// Plain system memory.
        const SYSTEM = 1 << 0;
        /// System memory bound into the device aperture.
        const GART = 1 << 1;
        /// Device-local video memory.
        const VRAM = 1 << 2;
        /// The mappable register window.
        const MMIO = 1 << 3;
    }
}

bitflags! {
    /// Per-placement caching and eviction attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PlaceFlags: u32 {
        const CACHED = 1 << 0;
        const UNCACHED = 1 << 1;
        const WRITE_COMBINED = 1 << 2;
        /// The object must not be selected for eviction.
        const NO_EVICT = 1 << 3;
    }
}

/// The physical pools a buffer object can be resident in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    System,
    Gart,
    Vram,
    Mmio,
}

impl PoolKind {
    #[must_use]
    pub const fn domain_bit(self) -> Domain {
        match self {
            Self::System => Domain::SYSTEM,
            Self::Gart => Domain::GART,
            Self::Vram => Domain::VRAM,
            Self::Mmio => Domain::MMIO,
        }
    }
}

/// Where a buffer object currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Residency {
    pub pool: PoolKind,
    /// First page within the pool's address range.
    pub start_page: u64,
    pub pages: u64,
    pub flags: PlaceFlags,
}

impl Residency {
    /// Byte offset of the residency within its pool.
    #[must_use]
    pub const fn byte_offset(&self) -> u64 {
        self.start_page * PAGE_SIZE as u64
    }
}

// ===============================================================================================
// Host page allocation
// ===============================================================================================

/// Page-aligned, page-granular host memory backing SYSTEM and GART
/// residencies. Anonymous mapping, zero-filled by the kernel.
#[derive(Debug)]
pub struct HostPages {
    ptr: NonNull<u8>,
    pages: u64,
}

// Safety: a plain private mapping; exclusive access is coordinated by the
// buffer object that owns it.
unsafe impl Send for HostPages {}
unsafe impl Sync for HostPages {}

impl HostPages {
    pub fn new(pages: u64) -> MemResult<Self> {
        if pages == 0 {
            return Err(MemError::InvalidSize);
        }
        let len = pages_to_bytes(pages);
        // Safety: anonymous mapping, no fd, no fixed address.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(MemError::OutOfMemory);
        }
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or(MemError::OutOfMemory)?;
        Ok(Self { ptr, pages })
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        pages_to_bytes(self.pages)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages == 0
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Pointer to page `index`.
    #[must_use]
    pub fn page_ptr(&self, index: u64) -> *mut u8 {
        assert!(index < self.pages);
        // Safety: index bounds asserted; the mapping covers `pages` pages.
        unsafe { self.ptr.as_ptr().add(index as usize * PAGE_SIZE) }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // Safety: the mapping is live and `len` bytes long; callers only
        // read while no transfer targets these pages.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, plus exclusive access via `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for HostPages {
    fn drop(&mut self) {
        // Safety: `ptr`/`len` describe the mapping created in `new`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_pages_zeroed_and_sized() {
        let pages = HostPages::new(3).unwrap();
        assert_eq!(pages.len(), 3 * PAGE_SIZE);
        assert!(pages.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn host_pages_rejects_zero() {
        assert!(matches!(HostPages::new(0), Err(MemError::InvalidSize)));
    }
}
