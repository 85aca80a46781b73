//! Domain mask to placement translation.
//!
//! Pure data transformation: the same mask always produces the same
//! placement, so retrying a failed allocation is idempotent.

use crate::mm::{Domain, PlaceFlags, PoolKind};

/// One acceptable (pool, caching) choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceEntry {
    pub pool: PoolKind,
    pub flags: PlaceFlags,
}

/// Ordered placement choices for a buffer object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Preferred order, used when the object is idle.
    pub entries: Vec<PlaceEntry>,
    /// Used while the object may be mid-transfer. Excludes the GART pool,
    /// which needs the object quiescent to bind.
    pub busy: Vec<PlaceEntry>,
}

impl Placement {
    /// Add the no-evict attribute to every candidate, for pinned objects.
    #[must_use]
    pub fn pinned(mut self) -> Self {
        for e in self.entries.iter_mut().chain(self.busy.iter_mut()) {
            e.flags |= PlaceFlags::NO_EVICT;
        }
        self
    }

    #[must_use]
    pub fn accepts(&self, pool: PoolKind) -> bool {
        self.entries.iter().any(|e| e.pool == pool)
    }
}

/// Default caching attribute of each pool.
#[must_use]
pub const fn default_caching(pool: PoolKind) -> PlaceFlags {
    match pool {
        PoolKind::System => PlaceFlags::CACHED,
        PoolKind::Gart => PlaceFlags::WRITE_COMBINED,
        PoolKind::Vram => PlaceFlags::WRITE_COMBINED,
        PoolKind::Mmio => PlaceFlags::UNCACHED,
    }
}

/// Translate a domain mask into ordered placement choices, one entry per
/// recognized bit. A mask with no recognized bit falls back to system
/// memory only.
#[must_use]
pub fn compute_placement(domain: Domain) -> Placement {
    let mut entries = Vec::new();
    for pool in [
        PoolKind::Vram,
        PoolKind::Gart,
        PoolKind::System,
        PoolKind::Mmio,
    ] {
        if domain.contains(pool.domain_bit()) {
            entries.push(PlaceEntry {
                pool,
                flags: default_caching(pool),
            });
        }
    }
    if entries.is_empty() {
        entries.push(PlaceEntry {
            pool: PoolKind::System,
            flags: default_caching(PoolKind::System),
        });
    }
    let busy = entries
        .iter()
        .copied()
        .filter(|e| e.pool != PoolKind::Gart)
        .collect();
    Placement { entries, busy }
}
