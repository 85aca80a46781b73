//! Memory management for a blit-capable display device: buffer objects
//! placed across VRAM, a GART aperture, system memory and the register
//! window, migrated between pools by fenced DMA descriptor chains.
//!
//! The `hw` layer defines the device contract (register map, bus
//! mappings, aperture table) and a software device model; the `mm` layer
//! builds placement, pooling, migration and fencing on top of it.

pub mod error;
pub mod hw;
pub mod mm;
pub mod utils;

pub use error::{MemError, MemResult};
pub use hw::{BlitDevice, DmaDirection, SimDevice};
pub use mm::{
    BufferObject, Domain, Fence, KernelMap, MemConfig, MemoryManager, PlaceFlags, PoolKind,
};
