//! Moving buffer objects between pools: no-copy backing swaps, aperture
//! bind/unbind, and fenced blits through the DMA engines.

use crate::error::{MemError, MemResult};
use crate::hw::device::{BlitDevice, DmaDirection};
use crate::hw::regs::NUM_ENGINES;
use crate::mm::bo::{Backing, BoState};
use crate::mm::dma::{self, Chain};
use crate::mm::fence::{Fence, FencePool};
use crate::mm::pool::PoolSet;
use crate::mm::{HostPages, PoolKind, Residency};
use crate::utils::PAGE_SIZE;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// ===============================================================================================
// Aperture bindings
// ===============================================================================================

/// A live window in the device aperture: consecutive page-table entries
/// pointing at bus-mapped host pages. Dropping it clears the entries and
/// releases the mappings. The aperture page range itself is owned by the
/// GART pool and freed separately.
pub struct GartBind {
    device: Arc<dyn BlitDevice>,
    first_page: u64,
    maps: Vec<u64>,
}

impl fmt::Debug for GartBind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GartBind")
            .field("first_page", &self.first_page)
            .field("pages", &self.maps.len())
            .finish()
    }
}

impl GartBind {
    #[must_use]
    pub fn first_page(&self) -> u64 {
        self.first_page
    }
}

impl Drop for GartBind {
    fn drop(&mut self) {
        self.device.gart_unbind(self.first_page, self.maps.len() as u64);
        for &bus in &self.maps {
            self.device.unmap_single(bus);
        }
    }
}

/// Bus-map every page of `pages` and program the aperture entries at
/// `first_page`. Any failure releases the mappings taken so far.
pub fn bind_pages(
    device: &Arc<dyn BlitDevice>,
    pages: &HostPages,
    first_page: u64,
) -> MemResult<GartBind> {
    let mut maps = Vec::with_capacity(pages.pages() as usize);
    for i in 0..pages.pages() {
        match device.map_single(pages.page_ptr(i), PAGE_SIZE, DmaDirection::Bidirectional) {
            Ok(bus) => maps.push(bus),
            Err(err) => {
                for &bus in &maps {
                    device.unmap_single(bus);
                }
                return Err(err);
            }
        }
    }
    if let Err(err) = device.gart_bind(first_page, &maps) {
        for &bus in &maps {
            device.unmap_single(bus);
        }
        return Err(err);
    }
    Ok(GartBind {
        device: device.clone(),
        first_page,
        maps,
    })
}

// ===============================================================================================
// Retired state carried by a migration fence
// ===============================================================================================

/// Everything a fenced blit keeps alive until the hardware is done with
/// it: the descriptor chain, superseded host pages, aperture windows, and
/// pool ranges to hand back. Releasing it only frees.
struct RetiredState {
    chain: Chain,
    pages: Option<HostPages>,
    binds: Vec<GartBind>,
    ranges: Vec<(PoolKind, u64, u64)>,
    pools: Arc<PoolSet>,
}

impl RetiredState {
    fn release(self) {
        // Unmap the chain before dropping the pages it points into.
        drop(self.chain);
        drop(self.binds);
        drop(self.pages);
        for (kind, start, pages) in self.ranges {
            self.pools.get(kind).free_range(start, pages);
        }
    }
}

// ===============================================================================================
// Migrator
// ===============================================================================================

pub struct Migrator {
    device: Arc<dyn BlitDevice>,
    pools: Arc<PoolSet>,
    fences: Arc<FencePool>,
    next_engine: AtomicUsize,
}

impl Migrator {
    #[must_use]
    pub fn new(device: Arc<dyn BlitDevice>, pools: Arc<PoolSet>, fences: Arc<FencePool>) -> Self {
        Self {
            device,
            pools,
            fences,
            next_engine: AtomicUsize::new(0),
        }
    }

    fn pick_engine(&self) -> usize {
        self.next_engine.fetch_add(1, Ordering::Relaxed) % NUM_ENGINES
    }

    /// Move the object described by `state` into `target`, whose range the
    /// caller has already allocated from the target pool.
    ///
    /// Synchronous paths return `Ok(None)`; blit paths return the fence
    /// guarding the transfer, with every superseded resource attached as
    /// its cleanup. On error nothing observable has changed and the caller
    /// still owns the target range.
    pub fn migrate(
        &self,
        state: &mut BoState,
        pages: u64,
        target: Residency,
    ) -> MemResult<Option<Fence>> {
        let Some(old) = state.residency else {
            return self.assign_fresh(state, pages, target);
        };
        if old.pool == target.pool {
            return Err(MemError::InvalidState("migration within one pool"));
        }
        if old.pool == PoolKind::Mmio || target.pool == PoolKind::Mmio {
            return Err(MemError::InvalidState(
                "register window placements cannot migrate",
            ));
        }
        log::debug!(
            "migrate {} pages {:?} -> {:?}",
            pages,
            old.pool,
            target.pool
        );
        match (old.pool, target.pool) {
            (PoolKind::System, PoolKind::Gart) => self.system_to_gart(state, old, target),
            (PoolKind::Gart, PoolKind::System) => self.gart_to_system(state, old, target),
            (PoolKind::Gart, PoolKind::Vram) => self.host_to_vram(state, old, target, None),
            (PoolKind::System, PoolKind::Vram) => {
                // Two-hop: stage through a scratch aperture window.
                let scratch = self
                    .pools
                    .get(PoolKind::Gart)
                    .alloc_range(pages)
                    .ok_or(MemError::OutOfMemory)?;
                match self.host_to_vram(state, old, target, Some(scratch)) {
                    Ok(fence) => Ok(fence),
                    Err(err) => {
                        self.pools.get(PoolKind::Gart).free_range(scratch, pages);
                        Err(err)
                    }
                }
            }
            (PoolKind::Vram, PoolKind::Gart) => self.vram_to_host(state, old, target, None),
            (PoolKind::Vram, PoolKind::System) => {
                let scratch = self
                    .pools
                    .get(PoolKind::Gart)
                    .alloc_range(pages)
                    .ok_or(MemError::OutOfMemory)?;
                match self.vram_to_host(state, old, target, Some(scratch)) {
                    Ok(fence) => Ok(fence),
                    Err(err) => {
                        self.pools.get(PoolKind::Gart).free_range(scratch, pages);
                        Err(err)
                    }
                }
            }
            _ => Err(MemError::InvalidState("unsupported migration path")),
        }
    }

    /// First placement of an unbacked object: nothing to copy, only
    /// backing to assign.
    fn assign_fresh(
        &self,
        state: &mut BoState,
        pages: u64,
        target: Residency,
    ) -> MemResult<Option<Fence>> {
        state.backing = match target.pool {
            PoolKind::System => Backing::Host {
                pages: HostPages::new(pages)?,
                bind: None,
            },
            PoolKind::Gart => {
                let host = HostPages::new(pages)?;
                let bind = bind_pages(&self.device, &host, target.start_page)?;
                Backing::Host {
                    pages: host,
                    bind: Some(bind),
                }
            }
            PoolKind::Vram => Backing::Vram,
            PoolKind::Mmio => Backing::None,
        };
        state.residency = Some(target);
        Ok(None)
    }

    /// Bind the existing host pages into the aperture. No copy.
    fn system_to_gart(
        &self,
        state: &mut BoState,
        old: Residency,
        target: Residency,
    ) -> MemResult<Option<Fence>> {
        let Backing::Host { pages, bind } = &mut state.backing else {
            return Err(MemError::InvalidState("system object without host backing"));
        };
        if bind.is_some() {
            return Err(MemError::InvalidState("system object already bound"));
        }
        *bind = Some(bind_pages(&self.device, pages, target.start_page)?);
        state.residency = Some(target);
        self.pools.get(old.pool).free_range(old.start_page, old.pages);
        Ok(None)
    }

    /// Drop the aperture window; the host pages stay. No copy.
    fn gart_to_system(
        &self,
        state: &mut BoState,
        old: Residency,
        target: Residency,
    ) -> MemResult<Option<Fence>> {
        let Backing::Host { bind, .. } = &mut state.backing else {
            return Err(MemError::InvalidState("aperture object without host backing"));
        };
        drop(bind.take());
        state.residency = Some(target);
        self.pools.get(old.pool).free_range(old.start_page, old.pages);
        Ok(None)
    }

    /// Blit host pages into VRAM. `scratch` is the staging aperture range
    /// for SYSTEM sources; GART sources are already bound.
    fn host_to_vram(
        &self,
        state: &mut BoState,
        old: Residency,
        target: Residency,
        scratch: Option<u64>,
    ) -> MemResult<Option<Fence>> {
        let Backing::Host { pages, .. } = &state.backing else {
            return Err(MemError::InvalidState("blit source has no host backing"));
        };
        let scratch_bind = match scratch {
            Some(first_page) => Some(bind_pages(&self.device, pages, first_page)?),
            None => None,
        };
        let chain = dma::build_chain(
            &self.device,
            pages,
            target.byte_offset(),
            DmaDirection::ToDevice,
        )?;
        let engine = self.pick_engine();
        let head = chain.head();
        let device = self.device.clone();
        let fence = self.fences.emit(engine, move |seq| {
            dma::fire(device.as_ref(), engine, head, DmaDirection::ToDevice, seq);
            Ok(())
        })?;

        // Point of no return: the hardware owns the transfer now.
        let Backing::Host { pages, bind } = mem::replace(&mut state.backing, Backing::Vram) else {
            unreachable!();
        };
        state.residency = Some(target);
        state.last_fence = Some(fence.clone());

        let mut retired = RetiredState {
            chain,
            pages: Some(pages),
            binds: bind.into_iter().chain(scratch_bind).collect(),
            ranges: vec![(old.pool, old.start_page, old.pages)],
            pools: self.pools.clone(),
        };
        if let Some(first_page) = scratch {
            retired.ranges.push((PoolKind::Gart, first_page, old.pages));
        }
        self.fences
            .attach_cleanup(&fence, Box::new(move || retired.release()));
        Ok(Some(fence))
    }

    /// Blit VRAM into fresh host pages, bound at `target` for GART
    /// destinations or staged through `scratch` for SYSTEM ones.
    fn vram_to_host(
        &self,
        state: &mut BoState,
        old: Residency,
        target: Residency,
        scratch: Option<u64>,
    ) -> MemResult<Option<Fence>> {
        let host = HostPages::new(old.pages)?;
        let (bind, scratch_bind) = match scratch {
            Some(first_page) => (None, Some(bind_pages(&self.device, &host, first_page)?)),
            None => (Some(bind_pages(&self.device, &host, target.start_page)?), None),
        };
        let chain = dma::build_chain(
            &self.device,
            &host,
            old.byte_offset(),
            DmaDirection::FromDevice,
        )?;
        let engine = self.pick_engine();
        let head = chain.head();
        let device = self.device.clone();
        let fence = self.fences.emit(engine, move |seq| {
            dma::fire(device.as_ref(), engine, head, DmaDirection::FromDevice, seq);
            Ok(())
        })?;

        state.backing = Backing::Host { pages: host, bind };
        state.residency = Some(target);
        state.last_fence = Some(fence.clone());

        let mut retired = RetiredState {
            chain,
            pages: None,
            binds: scratch_bind.into_iter().collect(),
            ranges: vec![(old.pool, old.start_page, old.pages)],
            pools: self.pools.clone(),
        };
        if let Some(first_page) = scratch {
            retired.ranges.push((PoolKind::Gart, first_page, old.pages));
        }
        self.fences
            .attach_cleanup(&fence, Box::new(move || retired.release()));
        Ok(Some(fence))
    }
}
