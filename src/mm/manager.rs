//! The top-level memory manager: buffer object lifecycle, validation with
//! eviction, and the interrupt/shutdown surface.

use crate::error::{MemError, MemResult};
use crate::hw::device::BlitDevice;
use crate::hw::regs::NUM_ENGINES;
use crate::mm::bo::{Backing, BoId, BoState, BufferObject, KernelMap};
use crate::mm::dma;
use crate::mm::fence::FencePool;
use crate::mm::migrate::Migrator;
use crate::mm::placement::{Placement, compute_placement};
use crate::mm::pool::PoolSet;
use crate::mm::{Domain, PlaceFlags, PoolKind, Residency};
use crate::utils::bytes_to_pages;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MemConfig {
    /// Default bound on fence waits.
    pub fence_timeout: Duration,
    /// Bound on draining an engine at shutdown before it is aborted.
    pub quiesce_timeout: Duration,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            fence_timeout: Duration::from_secs(10),
            quiesce_timeout: Duration::from_secs(2),
        }
    }
}

pub struct MemoryManager {
    device: Arc<dyn BlitDevice>,
    pools: Arc<PoolSet>,
    fences: Arc<FencePool>,
    migrator: Migrator,
    registry: Mutex<HashMap<BoId, Arc<BufferObject>>>,
    next_id: AtomicU64,
    quiesce_timeout: Duration,
}

impl MemoryManager {
    #[must_use]
    pub fn new(device: Arc<dyn BlitDevice>, config: MemConfig) -> Self {
        let pools = Arc::new(PoolSet::new(device.as_ref()));
        let fences = Arc::new(FencePool::new(device.clone(), config.fence_timeout));
        let migrator = Migrator::new(device.clone(), pools.clone(), fences.clone());
        Self {
            device,
            pools,
            fences,
            migrator,
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            quiesce_timeout: config.quiesce_timeout,
        }
    }

    #[must_use]
    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    #[must_use]
    pub fn fence_pool(&self) -> &Arc<FencePool> {
        &self.fences
    }

    // ===========================================================================================
    // Buffer object lifecycle
    // ===========================================================================================

    /// Create a buffer object and place it into its preferred domain.
    pub fn create(&self, size: usize, domain: Domain) -> MemResult<Arc<BufferObject>> {
        if size == 0 {
            return Err(MemError::InvalidSize);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bo = Arc::new(BufferObject::new(id, size, bytes_to_pages(size), domain));
        self.registry.lock().unwrap().insert(id, bo.clone());

        let result = {
            let _res = bo.reserve();
            let mut state = bo.state.lock().unwrap();
            self.validate_locked(&bo, &mut state, &compute_placement(domain), true)
        };
        if let Err(err) = result {
            self.registry.lock().unwrap().remove(&id);
            return Err(err);
        }
        Ok(bo)
    }

    /// Create, pin and map in one step, for objects the CPU fills right
    /// away (cursors, ring buffers).
    pub fn create_mapped(&self, size: usize, domain: Domain) -> MemResult<KernelMap> {
        let bo = self.create(size, domain)?;
        if let Err(err) = self.pin(&bo, domain) {
            self.destroy(&bo)?;
            return Err(err);
        }
        match self.kmap(&bo) {
            Ok(map) => Ok(map),
            Err(err) => {
                self.unpin(&bo)?;
                self.destroy(&bo)?;
                Err(err)
            }
        }
    }

    /// Pin the object into a pool acceptable under `domain`: it will not
    /// be selected for eviction until unpinned. Scanout and cursor
    /// sources pin to `Domain::VRAM` before display.
    pub fn pin(&self, bo: &Arc<BufferObject>, domain: Domain) -> MemResult<()> {
        bo.check_live()?;
        let _res = bo.reserve();
        let mut state = bo.state.lock().unwrap();
        let placement = compute_placement(domain).pinned();
        self.validate_locked(bo, &mut state, &placement, true)?;
        bo.inc_pin();
        Ok(())
    }

    pub fn unpin(&self, bo: &Arc<BufferObject>) -> MemResult<()> {
        bo.dec_pin()?;
        if !bo.is_pinned() {
            let mut state = bo.state.lock().unwrap();
            if let Some(res) = &mut state.residency {
                res.flags.remove(PlaceFlags::NO_EVICT);
            }
        }
        Ok(())
    }

    /// Tear an object down. Fails with `StillMapped` while a kernel map is
    /// live; waits for any in-flight migration first.
    ///
    /// A timed-out wait returns before anything is torn down: the object
    /// stays live and a later call retries once the transfer resolves.
    pub fn destroy(&self, bo: &Arc<BufferObject>) -> MemResult<()> {
        bo.check_live()?;
        if bo.map_count() > 0 {
            return Err(MemError::StillMapped);
        }
        let _res = bo.reserve();
        let mut state = bo.state.lock().unwrap();
        if let Some(fence) = state.last_fence.clone() {
            fence.wait(None)?;
        }
        state.last_fence = None;
        bo.mark_destroyed();
        bo.force_unpin();
        if let Some(res) = state.residency.take() {
            let pool = self.pools.get(res.pool);
            pool.remove_resident(bo.id());
            pool.free_range(res.start_page, res.pages);
        }
        state.backing = Backing::None;
        drop(state);
        self.registry.lock().unwrap().remove(&bo.id());
        Ok(())
    }

    /// Map the object for CPU access. Waits for any in-flight migration;
    /// the returned guard blocks further migration and destruction.
    pub fn kmap(&self, bo: &Arc<BufferObject>) -> MemResult<KernelMap> {
        bo.check_live()?;
        let _res = bo.reserve();
        let mut state = bo.state.lock().unwrap();
        if let Some(fence) = state.last_fence.clone() {
            fence.wait(None)?;
        }
        state.last_fence = None;
        let res = state
            .residency
            .ok_or(MemError::InvalidState("mapping an unbacked buffer object"))?;
        let ptr = match &state.backing {
            Backing::Host { pages, .. } => pages.as_ptr(),
            Backing::Vram => self.device.map_vram(res.byte_offset(), bo.size())?,
            Backing::None => {
                return Err(MemError::InvalidState("no CPU-visible backing"));
            }
        };
        Ok(KernelMap::new(bo.clone(), ptr, bo.size()))
    }

    /// Wait for the object's last migration to finish.
    pub fn wait_idle(&self, bo: &BufferObject) -> MemResult<()> {
        let fence = bo.state.lock().unwrap().last_fence.clone();
        match fence {
            Some(fence) => fence.wait(None),
            None => Ok(()),
        }
    }

    // ===========================================================================================
    // Validation and eviction
    // ===========================================================================================

    /// Place `bo` according to `placement`. Caller holds the reservation
    /// and the state lock.
    ///
    /// Entries are tried in order: no-op if already resident in an
    /// acceptable pool, otherwise allocate, evicting from fixed pools in
    /// LRU order when allowed. Exhausting every entry is `OutOfMemory`.
    fn validate_locked(
        &self,
        bo: &Arc<BufferObject>,
        state: &mut BoState,
        placement: &Placement,
        allow_evict: bool,
    ) -> MemResult<()> {
        // Mid-transfer objects may only sit in a busy-acceptable pool;
        // anything else must wait for the contents to stabilize.
        if let Some(fence) = state.last_fence.clone() {
            if !fence.signaled() {
                if let Some(res) = state.residency {
                    if placement.busy.iter().any(|e| e.pool == res.pool) {
                        return Ok(());
                    }
                }
                fence.wait(None)?;
            }
            state.last_fence = None;
        }

        if let Some(res) = &mut state.residency {
            if let Some(entry) = placement.entries.iter().find(|e| e.pool == res.pool) {
                res.flags = entry.flags;
                self.pools.get(res.pool).note_resident(bo.id());
                return Ok(());
            }
            // A live kernel map pins the backing in place.
            if bo.map_count() > 0 {
                return Err(MemError::Busy);
            }
        }

        for entry in &placement.entries {
            let pool = self.pools.get(entry.pool);
            let mut start = pool.alloc_range(bo.pages());
            if start.is_none() && pool.fixed() && allow_evict {
                while start.is_none() && self.evict_one(entry.pool, bo.id())? {
                    start = pool.alloc_range(bo.pages());
                }
            }
            let Some(start_page) = start else {
                continue;
            };
            let target = Residency {
                pool: entry.pool,
                start_page,
                pages: bo.pages(),
                flags: entry.flags,
            };
            let old = state.residency;
            match self.migrator.migrate(state, bo.pages(), target) {
                Ok(_fence) => {
                    if let Some(old) = old {
                        self.pools.get(old.pool).remove_resident(bo.id());
                    }
                    pool.note_resident(bo.id());
                    return Ok(());
                }
                Err(err) => {
                    pool.free_range(start_page, bo.pages());
                    return Err(err);
                }
            }
        }
        Err(MemError::OutOfMemory)
    }

    /// Evict one unpinned resident out of `pool`, oldest first, preferring
    /// victims whose own domain offers a destination other than the
    /// pressured pool. Returns `false` when no candidate could be taken.
    fn evict_one(&self, pool: PoolKind, requester: BoId) -> MemResult<bool> {
        let lru = self.pools.get(pool).lru_snapshot();
        let elsewhere = |id: &BoId| {
            let registry = self.registry.lock().unwrap();
            registry
                .get(id)
                .is_some_and(|bo| !(bo.domain() & !pool.domain_bit()).is_empty())
        };
        let ordered: Vec<BoId> = lru
            .iter()
            .copied()
            .filter(|id| elsewhere(id))
            .chain(lru.iter().copied().filter(|id| !elsewhere(id)))
            .collect();

        for id in ordered {
            if id == requester {
                continue;
            }
            let Some(victim) = self.registry.lock().unwrap().get(&id).cloned() else {
                continue;
            };
            // Never block on a contended object.
            let Ok(_res) = victim.try_reserve() else {
                continue;
            };
            // Pin and map both take the reservation before bumping their
            // counts, so the check is only authoritative while it is held.
            if victim.is_pinned() || victim.map_count() > 0 {
                continue;
            }
            let fence = {
                let state = victim.state.lock().unwrap();
                match state.residency {
                    Some(res) if res.pool == pool => state.last_fence.clone(),
                    _ => continue,
                }
            };
            // The freed range is reused immediately, so the victim must be
            // idle before it moves.
            if let Some(fence) = fence {
                fence.wait(None)?;
            }
            let mut state = victim.state.lock().unwrap();
            state.last_fence = None;

            let fallback = (victim.domain() | Domain::SYSTEM)
                & !pool.domain_bit()
                & !Domain::MMIO;
            log::debug!("evicting bo {id} from {pool:?} (fallback {fallback:?})");
            // No recursive eviction: the chain always terminates in the
            // system pool, which cannot run out.
            match self.validate_locked(&victim, &mut state, &compute_placement(fallback), false) {
                Ok(()) => {
                    if let Some(fence) = state.last_fence.clone() {
                        drop(state);
                        fence.wait(None)?;
                    }
                    return Ok(true);
                }
                Err(MemError::OutOfMemory) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    // ===========================================================================================
    // Interrupts and shutdown
    // ===========================================================================================

    /// Interrupt dispatch entry point. Returns `true` if the engine had
    /// raised the interrupt and it was handled.
    pub fn on_engine_interrupt(&self, engine: usize) -> bool {
        self.fences.on_engine_interrupt(engine)
    }

    /// Drain every engine gracefully, then retire whatever remains.
    pub fn quiesce_all(&self) -> MemResult<()> {
        for engine in 0..NUM_ENGINES {
            dma::quiesce(self.device.as_ref(), engine, self.quiesce_timeout)?;
            self.fences.poll_engine(engine);
        }
        self.fences.flush_all();
        Ok(())
    }

    /// Emergency teardown: abort the engines and force every pending fence
    /// terminal, running cleanups.
    pub fn flush_all(&self) {
        for engine in 0..NUM_ENGINES {
            dma::abort(self.device.as_ref(), engine);
        }
        self.fences.flush_all();
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.flush_all();
    }
}
