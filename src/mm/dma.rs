//! Descriptor chain construction and blit engine programming.

use crate::error::{MemError, MemResult};
use crate::hw::device::{BlitDevice, DmaDirection};
use crate::hw::regs::{
    BlitDescriptor, CSR_DD, CSR_DE, CSR_TA, CSR_TD, CSR_TS, DESC_EOC, MR_CM, MR_DIR_TO_DEVICE,
    MR_TDIE, REG_BCR, REG_CSR, REG_DAR, REG_DPR, REG_MAR, REG_MR, REG_STR, engine_base,
};
use crate::mm::HostPages;
use crate::utils::PAGE_SIZE;
use std::mem::size_of;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DESCS_PER_BLOCK: usize = PAGE_SIZE / size_of::<BlitDescriptor>();

/// One page of descriptor memory plus the per-descriptor bus mappings.
struct DescBlock {
    memory: HostPages,
    maps: Vec<u64>,
}

/// An in-flight scatter-gather chain: the descriptor blocks, every bus
/// mapping taken for them and for the data pages, and the chain head the
/// hardware was (or will be) pointed at.
///
/// The links run backwards: each descriptor points at the one built
/// before it, the first-built descriptor carries the end-of-chain
/// sentinel, and the head handed to hardware is the last-built
/// descriptor. The engine therefore walks the chain tail-first. Dropping
/// the chain releases every mapping.
pub struct Chain {
    device: Arc<dyn BlitDevice>,
    head: u64,
    page_maps: Vec<u64>,
    blocks: Vec<DescBlock>,
}

impl Chain {
    #[must_use]
    pub fn head(&self) -> u64 {
        self.head
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.page_maps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.page_maps.is_empty()
    }

    fn teardown(&mut self) {
        for block in &self.blocks {
            for &bus in &block.maps {
                self.device.unmap_single(bus);
            }
        }
        self.blocks.clear();
        for &bus in &self.page_maps {
            self.device.unmap_single(bus);
        }
        self.page_maps.clear();
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Build a transfer chain covering every page of `pages`.
///
/// `device_base` is the device-local byte address of the first page; it
/// advances by one page per descriptor. Each data page and each
/// descriptor is DMA-mapped individually; on any failure everything
/// mapped so far is released and the old state is untouched.
pub fn build_chain(
    device: &Arc<dyn BlitDevice>,
    pages: &HostPages,
    device_base: u64,
    dir: DmaDirection,
) -> MemResult<Chain> {
    let mut chain = Chain {
        device: device.clone(),
        head: DESC_EOC,
        page_maps: Vec::with_capacity(pages.pages() as usize),
        blocks: Vec::new(),
    };

    let mut prev: u64 = DESC_EOC;
    for i in 0..pages.pages() {
        let bus = device.map_single(pages.page_ptr(i), PAGE_SIZE, dir)?;
        chain.page_maps.push(bus);

        let slot = chain.page_maps.len() - 1;
        if slot % DESCS_PER_BLOCK == 0 {
            chain.blocks.push(DescBlock {
                memory: HostPages::new(1).map_err(|_| MemError::OutOfMemory)?,
                maps: Vec::with_capacity(DESCS_PER_BLOCK),
            });
        }
        let block = chain
            .blocks
            .last_mut()
            .ok_or(MemError::InvalidState("descriptor block missing"))?;

        let desc = BlitDescriptor {
            mem_addr: bus,
            dev_addr: device_base + i * PAGE_SIZE as u64,
            size: PAGE_SIZE as u32,
            pad: 0,
            next: prev,
        };
        let desc_ptr = block
            .memory
            .as_ptr()
            .cast::<BlitDescriptor>()
            .wrapping_add(slot % DESCS_PER_BLOCK);
        // Safety: the block page holds DESCS_PER_BLOCK descriptors and the
        // slot index is reduced modulo that count.
        unsafe {
            desc_ptr.write(desc);
        }

        let desc_bus = device.map_single(
            desc_ptr.cast::<u8>(),
            size_of::<BlitDescriptor>(),
            DmaDirection::ToDevice,
        )?;
        block.maps.push(desc_bus);
        prev = desc_bus;
    }

    // Head is the last descriptor built; the first one built got the
    // end-of-chain sentinel above.
    chain.head = prev;
    if chain.is_empty() {
        return Err(MemError::InvalidSize);
    }
    Ok(chain)
}

// ===============================================================================================
// Engine programming
// ===============================================================================================

/// Point an engine at a chain and start it.
///
/// The write order is a hardware requirement: addresses reset, status
/// (done bits cleared, engine enabled) and mode before the chain head,
/// and the start bit last. `seq` is latched into the completed-sequence
/// counter when the transfer finishes.
pub fn fire(device: &dyn BlitDevice, engine: usize, head: u64, dir: DmaDirection, seq: u32) {
    let base = engine_base(engine);
    device.write64(base + REG_MAR, 0);
    device.write64(base + REG_DAR, 0);
    device.write32(base + REG_CSR, CSR_DD | CSR_TD | CSR_DE);
    let mut mr = MR_CM | MR_TDIE;
    if dir == DmaDirection::ToDevice {
        mr |= MR_DIR_TO_DEVICE;
    }
    device.write32(base + REG_MR, mr);
    device.write32(base + REG_BCR, 0);
    device.write32(base + REG_STR, seq);
    device.write64(base + REG_DPR, head);
    device.write32(base + REG_CSR, CSR_DE | CSR_TS);
}

/// Emergency stop, e.g. at driver unload.
pub fn abort(device: &dyn BlitDevice, engine: usize) {
    device.write32(engine_base(engine) + REG_CSR, CSR_TA);
}

/// Graceful drain: poll until the engine reports no transfer in flight.
pub fn quiesce(device: &dyn BlitDevice, engine: usize, timeout: Duration) -> MemResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if device.read32(engine_base(engine) + REG_CSR) & CSR_TS == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(MemError::WaitTimeout);
        }
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimDevice;

    fn device() -> Arc<dyn BlitDevice> {
        Arc::new(SimDevice::new(16, 16, 0))
    }

    #[test]
    fn first_built_descriptor_carries_sentinel() {
        let dev = device();
        let pages = HostPages::new(3).unwrap();
        let chain = build_chain(&dev, &pages, 0, DmaDirection::ToDevice).unwrap();
        assert_eq!(chain.len(), 3);

        // The head is the descriptor built last; following its links must
        // end at a sentinel after exactly three hops.
        let block = &chain.blocks[0];
        assert_eq!(chain.head(), *block.maps.last().unwrap());
        let first = block.memory.as_ptr().cast::<BlitDescriptor>();
        // Safety: three descriptors were written into the block above.
        let (d0, d2) = unsafe { ((*first), (*first.wrapping_add(2))) };
        assert_eq!(d0.next & DESC_EOC, DESC_EOC);
        assert_eq!(d2.next, block.maps[1]);
    }

    #[test]
    fn device_addresses_advance_by_page() {
        let dev = device();
        let pages = HostPages::new(2).unwrap();
        let chain = build_chain(&dev, &pages, 0x3000, DmaDirection::FromDevice).unwrap();
        let first = chain.blocks[0].memory.as_ptr().cast::<BlitDescriptor>();
        // Safety: two descriptors written.
        let (d0, d1) = unsafe { ((*first), (*first.wrapping_add(1))) };
        assert_eq!(d0.dev_addr, 0x3000);
        assert_eq!(d1.dev_addr, 0x3000 + PAGE_SIZE as u64);
    }

    #[test]
    fn teardown_releases_every_mapping() {
        let sim = Arc::new(SimDevice::new(16, 16, 0));
        let dev: Arc<dyn BlitDevice> = sim.clone();
        let pages = HostPages::new(3).unwrap();
        let chain = build_chain(&dev, &pages, 0, DmaDirection::ToDevice).unwrap();
        drop(chain);
        assert_eq!(sim.unmapped_pages(), 3);
        assert_eq!(sim.unmapped_descs(), 3);
    }

    #[test]
    fn map_failure_rolls_back() {
        let sim = Arc::new(SimDevice::new(16, 16, 0));
        let dev: Arc<dyn BlitDevice> = sim.clone();
        sim.fail_maps_after(3);
        let pages = HostPages::new(4).unwrap();
        assert!(build_chain(&dev, &pages, 0, DmaDirection::ToDevice).is_err());
        // Two data pages and one descriptor were mapped before the failure
        // and must all be released by the drop.
        assert_eq!(sim.unmapped_pages(), 2);
        assert_eq!(sim.unmapped_descs(), 1);
    }
}
