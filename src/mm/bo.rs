//! The buffer object: a managed region of device-visible memory with a
//! domain-aware placement and an optional CPU mapping.

use crate::error::{MemError, MemResult};
use crate::mm::fence::Fence;
use crate::mm::migrate::GartBind;
use crate::mm::{Domain, HostPages, PoolKind, Residency};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type BoId = u64;

/// Where a buffer object's bytes actually live.
#[derive(Debug)]
pub enum Backing {
    /// No backing yet (freshly created, or a register-window placement).
    None,
    /// Host pages, optionally bound into the device aperture.
    Host {
        pages: HostPages,
        bind: Option<GartBind>,
    },
    /// Device-local memory at the residency's offset.
    Vram,
}

/// Mutable placement state, guarded by the object's state lock. Mutated
/// only while the reservation token is held.
#[derive(Debug)]
pub struct BoState {
    pub residency: Option<Residency>,
    pub backing: Backing,
    /// Fence of the most recent migration; contents are unstable until it
    /// signals.
    pub last_fence: Option<Fence>,
}

pub struct BufferObject {
    id: BoId,
    size: usize,
    pages: u64,
    domain: Domain,
    /// Per-object exclusive token held across validation and migration.
    /// Never held across a blocking fence wait on this same object.
    reservation: Mutex<()>,
    pub(crate) state: Mutex<BoState>,
    pin_count: AtomicU32,
    map_count: AtomicU32,
    destroyed: AtomicBool,
}

impl BufferObject {
    pub(crate) fn new(id: BoId, size: usize, pages: u64, domain: Domain) -> Self {
        Self {
            id,
            size,
            pages,
            domain,
            reservation: Mutex::new(()),
            state: Mutex::new(BoState {
                residency: None,
                backing: Backing::None,
                last_fence: None,
            }),
            pin_count: AtomicU32::new(0),
            map_count: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> BoId {
        self.id
    }

    /// Requested byte size (before page rounding).
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn pages(&self) -> u64 {
        self.pages
    }

    #[must_use]
    pub fn domain(&self) -> Domain {
        self.domain
    }

    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    #[must_use]
    pub fn map_count(&self) -> u32 {
        self.map_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Current residency, if any.
    #[must_use]
    pub fn residency(&self) -> Option<Residency> {
        self.state.lock().unwrap().residency
    }

    #[must_use]
    pub fn current_pool(&self) -> Option<PoolKind> {
        self.residency().map(|r| r.pool)
    }

    // ===========================================================================================
    // Crate-internal state transitions
    // ===========================================================================================

    pub(crate) fn reserve(&self) -> MutexGuard<'_, ()> {
        self.reservation.lock().unwrap()
    }

    pub(crate) fn try_reserve(&self) -> MemResult<MutexGuard<'_, ()>> {
        self.reservation.try_lock().map_err(|_| MemError::Busy)
    }

    pub(crate) fn inc_pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_pin(&self) -> MemResult<()> {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .map(|_| ())
            .map_err(|_| MemError::InvalidState("unpin of an unpinned buffer object"))
    }

    pub(crate) fn force_unpin(&self) {
        self.pin_count.store(0, Ordering::Release);
    }

    pub(crate) fn inc_map(&self) {
        self.map_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_map(&self) {
        self.map_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub(crate) fn check_live(&self) -> MemResult<()> {
        if self.is_destroyed() {
            return Err(MemError::InvalidState("buffer object already destroyed"));
        }
        Ok(())
    }
}

// ===============================================================================================
// Kernel mapping
// ===============================================================================================

/// A scoped CPU-visible view of a buffer object's contents.
///
/// While a map is live the object cannot migrate or be destroyed; the
/// Drop impl releases that hold.
pub struct KernelMap {
    bo: Arc<BufferObject>,
    ptr: *mut u8,
    len: usize,
}

// Safety: the pointer targets memory kept alive by `bo`, whose map count
// blocks migration and destruction for the guard's lifetime.
unsafe impl Send for KernelMap {}

impl KernelMap {
    pub(crate) fn new(bo: Arc<BufferObject>, ptr: *mut u8, len: usize) -> Self {
        bo.inc_map();
        Self { bo, ptr, len }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn bo(&self) -> &Arc<BufferObject> {
        &self.bo
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: `ptr`/`len` were produced from the object's live backing
        // and stay valid while the map count holds off migration.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, plus `&mut self` for exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for KernelMap {
    fn drop(&mut self) {
        self.bo.dec_map();
    }
}
