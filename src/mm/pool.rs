//! Per-pool page-range allocation and residency tracking.

use crate::hw::device::BlitDevice;
use crate::mm::placement::default_caching;
use crate::mm::{BoId, PlaceFlags, PoolKind};
use log::warn;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Nominal capacity of the system pool: it is not fixed and can always
/// yield space by paging, so the allocator never sees it run out.
const SYSTEM_POOL_PAGES: u64 = 1 << 40;

struct PoolInner {
    total_pages: u64,
    free_pages: u64,
    /// Occupied ranges: start page -> length in pages. Holes between them
    /// are the free space.
    ranges: BTreeMap<u64, u64>,
    /// Resident buffer objects, least recently placed first. Eviction
    /// candidates are taken from the front.
    lru: VecDeque<BoId>,
}

/// One physical memory pool with its own address allocator.
pub struct Pool {
    kind: PoolKind,
    fixed: bool,
    inner: Mutex<PoolInner>,
}

impl Pool {
    #[must_use]
    pub fn new(kind: PoolKind, fixed: bool, total_pages: u64) -> Self {
        Self {
            kind,
            fixed,
            inner: Mutex::new(PoolInner {
                total_pages,
                free_pages: total_pages,
                ranges: BTreeMap::new(),
                lru: VecDeque::new(),
            }),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PoolKind {
        self.kind
    }

    /// A fixed pool cannot grow; freeing space requires eviction.
    #[must_use]
    pub const fn fixed(&self) -> bool {
        self.fixed
    }

    #[must_use]
    pub fn default_flags(&self) -> PlaceFlags {
        default_caching(self.kind)
    }

    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.inner.lock().unwrap().free_pages
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.inner.lock().unwrap().total_pages
    }

    /// First-fit search for a free range of `pages` pages. Returns the
    /// start page, or None when no hole is large enough.
    pub fn alloc_range(&self, pages: u64) -> Option<u64> {
        if pages == 0 {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();

        let mut candidate = 0u64;
        let mut found = None;
        for (&start, &len) in &inner.ranges {
            if start > candidate && start - candidate >= pages {
                found = Some(candidate);
                break;
            }
            candidate = start + len;
        }
        if found.is_none() && candidate + pages <= inner.total_pages {
            found = Some(candidate);
        }

        if let Some(start) = found {
            inner.ranges.insert(start, pages);
            inner.free_pages -= pages;
        }
        found
    }

    pub fn free_range(&self, start: u64, pages: u64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.ranges.remove(&start) {
            Some(len) if len == pages => inner.free_pages += pages,
            Some(len) => {
                // Length mismatch means the caller's bookkeeping is off;
                // trust the allocator's record.
                warn!(
                    "{:?} pool: freed range at page {start} recorded as {len} pages, caller said {pages}",
                    self.kind
                );
                inner.free_pages += len;
            }
            None => warn!("{:?} pool: free of untracked range at page {start}", self.kind),
        }
    }

    // ===========================================================================================
    // Residency tracking
    // ===========================================================================================

    pub fn note_resident(&self, id: BoId) {
        let mut inner = self.inner.lock().unwrap();
        inner.lru.retain(|&x| x != id);
        inner.lru.push_back(id);
    }

    pub fn remove_resident(&self, id: BoId) {
        self.inner.lock().unwrap().lru.retain(|&x| x != id);
    }

    /// Resident objects in eviction order (least recently placed first).
    #[must_use]
    pub fn lru_snapshot(&self) -> Vec<BoId> {
        self.inner.lock().unwrap().lru.iter().copied().collect()
    }
}

// ===============================================================================================
// Pool set
// ===============================================================================================

/// All four pools of one device.
pub struct PoolSet {
    pub system: Pool,
    pub gart: Pool,
    pub vram: Pool,
    pub mmio: Pool,
}

impl PoolSet {
    /// Size the fixed pools from what the device reports.
    #[must_use]
    pub fn new(device: &dyn BlitDevice) -> Self {
        Self {
            system: Pool::new(PoolKind::System, false, SYSTEM_POOL_PAGES),
            gart: Pool::new(PoolKind::Gart, true, device.gart_pages()),
            vram: Pool::new(PoolKind::Vram, true, device.vram_pages()),
            mmio: Pool::new(PoolKind::Mmio, true, device.mmio_pages()),
        }
    }

    #[must_use]
    pub fn get(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::System => &self.system,
            PoolKind::Gart => &self.gart,
            PoolKind::Vram => &self.vram,
            PoolKind::Mmio => &self.mmio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_finds_holes() {
        let pool = Pool::new(PoolKind::Vram, true, 8);
        let a = pool.alloc_range(3).unwrap();
        let b = pool.alloc_range(3).unwrap();
        let c = pool.alloc_range(2).unwrap();
        assert_eq!((a, b, c), (0, 3, 6));
        assert_eq!(pool.free_pages(), 0);

        pool.free_range(b, 3);
        assert_eq!(pool.free_pages(), 3);
        // The freed hole is reused before the tail.
        assert_eq!(pool.alloc_range(2), Some(3));
    }

    #[test]
    fn respects_capacity() {
        let pool = Pool::new(PoolKind::Vram, true, 4);
        assert_eq!(pool.alloc_range(5), None);
        assert_eq!(pool.alloc_range(4), Some(0));
        assert_eq!(pool.alloc_range(1), None);
    }

    #[test]
    fn fragmented_pool_rejects_contiguous_request() {
        let pool = Pool::new(PoolKind::Vram, true, 6);
        let a = pool.alloc_range(2).unwrap();
        let _b = pool.alloc_range(2).unwrap();
        let c = pool.alloc_range(2).unwrap();
        pool.free_range(a, 2);
        pool.free_range(c, 2);
        // 4 pages free but no 3-page hole.
        assert_eq!(pool.free_pages(), 4);
        assert_eq!(pool.alloc_range(3), None);
    }

    #[test]
    fn lru_order() {
        let pool = Pool::new(PoolKind::Vram, true, 8);
        pool.note_resident(1);
        pool.note_resident(2);
        pool.note_resident(1);
        assert_eq!(pool.lru_snapshot(), vec![2, 1]);
        pool.remove_resident(2);
        assert_eq!(pool.lru_snapshot(), vec![1]);
    }
}
