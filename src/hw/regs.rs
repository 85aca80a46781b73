//! Register map of the blit DMA engines.
//!
//! Each engine owns one register block of `ENGINE_REG_STRIDE` bytes at
//! `engine_base(engine)`. The programming contract (see `mm::dma::fire`)
//! is order-sensitive: status and mode must be written before the chain
//! head address, and the start bit last.

// ===============================================================================================
// Engine layout
// ===============================================================================================

/// Number of blit engines exposed by the device.
pub const NUM_ENGINES: usize = 2;

/// Byte offset of engine 0's register block.
pub const ENGINE_REG_BASE: u32 = 0xE00;

/// Byte stride between consecutive engine register blocks.
pub const ENGINE_REG_STRIDE: u32 = 0x40;

#[must_use]
pub const fn engine_base(engine: usize) -> u32 {
    ENGINE_REG_BASE + (engine as u32) * ENGINE_REG_STRIDE
}

// Per-engine register offsets, relative to `engine_base`.

/// Memory (bus) address register. Cleared before a chained transfer.
pub const REG_MAR: u32 = 0x00;
/// Device address register. Cleared before a chained transfer.
pub const REG_DAR: u32 = 0x08;
/// Control/status register.
pub const REG_CSR: u32 = 0x10;
/// Mode register.
pub const REG_MR: u32 = 0x14;
/// Byte count register. Unused in chaining mode, cleared for good measure.
pub const REG_BCR: u32 = 0x18;
/// Descriptor pointer register: bus address of the chain head.
pub const REG_DPR: u32 = 0x20;
/// Sequence tag register: tag latched into `REG_SEQ` on completion.
pub const REG_STR: u32 = 0x28;
/// Completed-sequence counter: last tag whose transfer finished.
pub const REG_SEQ: u32 = 0x2C;

// ===============================================================================================
// Control/status bits (REG_CSR)
// ===============================================================================================

/// DMA enable.
pub const CSR_DE: u32 = 1 << 0;
/// Transfer start. Self-clearing.
pub const CSR_TS: u32 = 1 << 1;
/// Transfer abort. Emergency stop; self-clearing.
pub const CSR_TA: u32 = 1 << 2;
/// Transfer done. Write 1 to clear.
pub const CSR_TD: u32 = 1 << 3;
/// Descriptor done. Write 1 to clear.
pub const CSR_DD: u32 = 1 << 4;

// ===============================================================================================
// Mode bits (REG_MR)
// ===============================================================================================

/// Chaining mode: walk the descriptor list at `REG_DPR`.
pub const MR_CM: u32 = 1 << 0;
/// Raise an interrupt when the transfer completes.
pub const MR_TDIE: u32 = 1 << 1;
/// Transfer direction: set = memory-to-device, clear = device-to-memory.
pub const MR_DIR_TO_DEVICE: u32 = 1 << 2;

// ===============================================================================================
// Descriptor chain
// ===============================================================================================

/// End-of-chain sentinel in a descriptor's `next` field (low bit; bus
/// addresses are at least 8-byte aligned).
pub const DESC_EOC: u64 = 1;

/// One hardware transfer descriptor. The engine fetches descriptors over
/// the bus, so every instance must itself be DMA-mapped. Links point at
/// the previously built descriptor; the hardware consumes the chain
/// starting from the last one built.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct BlitDescriptor {
    /// Bus address of the system-memory side of this page.
    pub mem_addr: u64,
    /// Device-local address (e.g. VRAM byte offset) of this page.
    pub dev_addr: u64,
    /// Transfer size in bytes.
    pub size: u32,
    pub pad: u32,
    /// Bus address of the next descriptor, or `DESC_EOC`.
    pub next: u64,
}

// ===============================================================================================
// Fence sequence space
// ===============================================================================================

/// Sequence numbers are 30-bit and wrap.
pub const SEQ_MASK: u32 = (1 << 30) - 1;

/// Half the sequence range, for wraparound-safe ordering tests.
pub const SEQ_HALF_RANGE: u32 = 1 << 29;
