use crate::error::MemResult;

/// Direction of a DMA mapping, from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads from this memory (host-to-device transfer source).
    ToDevice,
    /// The device writes into this memory (device-to-host transfer target).
    FromDevice,
    /// The device may do both (long-lived aperture bindings).
    Bidirectional,
}

/// Access to one blit-capable device: its register window, its bus/IOMMU
/// mapping facility, its GART page table and its VRAM aperture.
///
/// The memory-management layer is written entirely against this trait;
/// `hw::sim::SimDevice` provides a register-accurate software model for
/// tests and bring-up without hardware.
pub trait BlitDevice: Send + Sync {
    // ===========================================================================================
    // Register window
    // ===========================================================================================

    fn read32(&self, offset: u32) -> u32;

    fn write32(&self, offset: u32, value: u32);

    /// 64-bit write for the address-carrying registers (`REG_MAR`,
    /// `REG_DAR`, `REG_DPR`).
    fn write64(&self, offset: u32, value: u64);

    // ===========================================================================================
    // Bus mappings
    // ===========================================================================================

    /// Map `len` bytes of host memory at `host` for device access and
    /// return the bus address the device must use.
    ///
    /// The caller guarantees `host` stays valid (and writable for
    /// `FromDevice`/`Bidirectional`) until `unmap_single` is called.
    fn map_single(&self, host: *const u8, len: usize, dir: DmaDirection) -> MemResult<u64>;

    /// Release a mapping returned by `map_single`.
    fn unmap_single(&self, bus: u64);

    // ===========================================================================================
    // GART page table
    // ===========================================================================================

    /// Program `pages.len()` consecutive aperture page-table entries
    /// starting at `first_page` with the given bus addresses.
    fn gart_bind(&self, first_page: u64, pages: &[u64]) -> MemResult<()>;

    /// Clear `count` aperture page-table entries starting at `first_page`.
    fn gart_unbind(&self, first_page: u64, count: u64);

    // ===========================================================================================
    // Topology
    // ===========================================================================================

    fn vram_pages(&self) -> u64;

    fn gart_pages(&self) -> u64;

    /// Size of the mappable register window, in pages.
    fn mmio_pages(&self) -> u64;

    // ===========================================================================================
    // CPU access to device memory
    // ===========================================================================================

    /// CPU-visible pointer covering `len` bytes of VRAM at `offset`.
    /// The pointer stays valid for the lifetime of the device.
    fn map_vram(&self, offset: u64, len: usize) -> MemResult<*mut u8>;
}
