//! Software model of the blit device.
//!
//! Register-accurate enough to exercise the programming contract in
//! `hw::regs`: a start request is honored only after chaining mode and a
//! chain head have been written, the chain is walked from the head
//! backwards through the `next` links, and the sequence tag is latched
//! into the completed-sequence counter when the walk finishes.
//!
//! Completion is immediate by default. `set_manual_completion` parks
//! transfers in a queue instead, so tests can deliver completions (and
//! the interrupt that reports them) out of order or not at all.

use crate::error::{MemError, MemResult};
use crate::hw::device::{BlitDevice, DmaDirection};
use crate::hw::regs::{
    BlitDescriptor, CSR_DD, CSR_DE, CSR_TA, CSR_TD, CSR_TS, DESC_EOC, ENGINE_REG_BASE,
    ENGINE_REG_STRIDE, MR_CM, MR_DIR_TO_DEVICE, MR_TDIE, NUM_ENGINES, REG_BCR, REG_CSR, REG_DAR,
    REG_DPR, REG_MAR, REG_MR, REG_SEQ, REG_STR, SEQ_MASK,
};
use crate::utils::{PAGE_SIZE, pages_to_bytes};
use log::{debug, error};
use std::collections::{BTreeMap, VecDeque};
use std::mem::size_of;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

/// Hook invoked with the engine index whenever a transfer with the
/// interrupt-enable mode bit completes. Stands in for the wired IRQ line.
pub type IrqHook = Box<dyn Fn(usize) + Send + Sync>;

// ===============================================================================================
// Bus and VRAM state
// ===============================================================================================

struct BusMapping {
    host: *mut u8,
    len: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct EngineRegs {
    mar: u64,
    dar: u64,
    csr: u32,
    mr: u32,
    bcr: u32,
    dpr: u64,
    tag: u32,
    seq: u32,
}

struct QueuedTransfer {
    engine: usize,
    head: u64,
    mr: u32,
    tag: u32,
}

struct SimState {
    engines: [EngineRegs; NUM_ENGINES],
    bus: BTreeMap<u64, BusMapping>,
    next_bus: u64,
    gart: Vec<u64>,
    queue: VecDeque<QueuedTransfer>,
}

// Safety: the raw host pointers in the bus map are only dereferenced while
// the mapping exists, and `map_single`'s contract makes the owner keep the
// memory alive exactly that long.
unsafe impl Send for SimState {}

/// Owned byte image standing in for the VRAM BAR. Kept behind a raw
/// pointer so the blit walk and `map_vram` callers can address it without
/// holding the register lock.
struct VramImage {
    ptr: *mut u8,
    len: usize,
}

// Safety: plain memory; all concurrent access is coordinated by the
// memory manager above (nobody reads a region with a blit in flight).
unsafe impl Send for VramImage {}
unsafe impl Sync for VramImage {}

impl VramImage {
    fn new(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed).cast::<u8>();
        Self { ptr, len }
    }
}

impl Drop for VramImage {
    fn drop(&mut self) {
        // Safety: `ptr`/`len` came from `into_raw` of a boxed slice.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr, self.len)));
        }
    }
}

// ===============================================================================================
// Device model
// ===============================================================================================

pub struct SimDevice {
    state: Mutex<SimState>,
    vram: VramImage,
    irq_hook: Mutex<Option<IrqHook>>,
    auto_complete: AtomicBool,
    /// Countdown until `map_single` fails; negative means never.
    fail_maps_after: AtomicI64,
    unmapped_pages: AtomicUsize,
    unmapped_descs: AtomicUsize,
    vram_pages: u64,
    gart_pages: u64,
    mmio_pages: u64,
}

impl SimDevice {
    #[must_use]
    pub fn new(vram_pages: u64, gart_pages: u64, mmio_pages: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                engines: [EngineRegs::default(); NUM_ENGINES],
                bus: BTreeMap::new(),
                next_bus: 0x10_0000,
                gart: vec![0; gart_pages as usize],
                queue: VecDeque::new(),
            }),
            vram: VramImage::new(pages_to_bytes(vram_pages)),
            irq_hook: Mutex::new(None),
            auto_complete: AtomicBool::new(true),
            fail_maps_after: AtomicI64::new(-1),
            unmapped_pages: AtomicUsize::new(0),
            unmapped_descs: AtomicUsize::new(0),
            vram_pages,
            gart_pages,
            mmio_pages,
        }
    }

    /// Register the interrupt delivery hook.
    pub fn set_irq_hook(&self, hook: IrqHook) {
        *self.irq_hook.lock().unwrap() = Some(hook);
    }

    /// Park started transfers instead of completing them inline.
    pub fn set_manual_completion(&self) {
        self.auto_complete.store(false, Ordering::Relaxed);
    }

    /// Number of started-but-uncompleted transfers.
    pub fn pending_transfers(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Complete the oldest parked transfer. Returns false when none is
    /// parked. `raise_irq` controls whether the interrupt hook fires.
    pub fn complete_next(&self, raise_irq: bool) -> bool {
        let Some(xfer) = self.state.lock().unwrap().queue.pop_front() else {
            return false;
        };
        self.execute(xfer, raise_irq);
        true
    }

    pub fn complete_all(&self, raise_irq: bool) {
        while self.complete_next(raise_irq) {}
    }

    /// Preset an engine's completed-sequence counter, for modelling a
    /// device whose counter did not start at zero.
    pub fn preset_seq(&self, engine: usize, seq: u32) {
        self.state.lock().unwrap().engines[engine].seq = seq & SEQ_MASK;
    }

    /// Make the n-th `map_single` call from now fail (0 = the next one).
    pub fn fail_maps_after(&self, n: i64) {
        self.fail_maps_after.store(n, Ordering::Relaxed);
    }

    /// Page-sized bus mappings released so far.
    pub fn unmapped_pages(&self) -> usize {
        self.unmapped_pages.load(Ordering::Relaxed)
    }

    /// Descriptor-sized bus mappings released so far.
    pub fn unmapped_descs(&self) -> usize {
        self.unmapped_descs.load(Ordering::Relaxed)
    }

    pub fn gart_entry(&self, page: u64) -> u64 {
        self.state.lock().unwrap().gart[page as usize]
    }

    /// Copy out of the VRAM image, for content checks.
    pub fn read_vram(&self, offset: u64, buf: &mut [u8]) {
        assert!(offset as usize + buf.len() <= self.vram.len);
        // Safety: bounds asserted above; callers only read quiescent VRAM.
        unsafe {
            ptr::copy_nonoverlapping(self.vram.ptr.add(offset as usize), buf.as_mut_ptr(), buf.len());
        }
    }

    // ===========================================================================================
    // Transfer execution
    // ===========================================================================================

    fn execute(&self, xfer: QueuedTransfer, raise_irq: bool) {
        let mut walked = true;
        {
            let mut st = self.state.lock().unwrap();
            let mut addr = xfer.head;
            loop {
                let Some(desc_host) =
                    Self::bus_to_host(&st, addr, size_of::<BlitDescriptor>())
                else {
                    error!("sim: descriptor fetch from unmapped bus address {addr:#x}");
                    walked = false;
                    break;
                };
                // Safety: bus_to_host checked the mapping covers the
                // descriptor; descriptors are 8-byte aligned by the builder.
                let desc = unsafe { ptr::read(desc_host.cast::<BlitDescriptor>()) };
                if !self.copy_one(&st, &desc, xfer.mr) {
                    walked = false;
                    break;
                }
                if desc.next & DESC_EOC != 0 {
                    break;
                }
                addr = desc.next;
            }

            let engine_idle = !st.queue.iter().any(|q| q.engine == xfer.engine);
            let e = &mut st.engines[xfer.engine];
            if walked {
                e.seq = xfer.tag;
                e.csr |= CSR_TD | CSR_DD;
            }
            if engine_idle {
                e.csr &= !CSR_TS;
            }
        }

        if walked && raise_irq && xfer.mr & MR_TDIE != 0 {
            if let Some(hook) = self.irq_hook.lock().unwrap().as_ref() {
                hook(xfer.engine);
            }
        }
    }

    fn copy_one(&self, st: &SimState, desc: &BlitDescriptor, mr: u32) -> bool {
        let len = desc.size as usize;
        if desc.dev_addr as usize + len > self.vram.len {
            error!("sim: blit past end of VRAM at {:#x}", desc.dev_addr);
            return false;
        }
        let Some(host) = Self::bus_to_host(st, desc.mem_addr, len) else {
            error!("sim: blit touches unmapped bus address {:#x}", desc.mem_addr);
            return false;
        };
        // Safety: `host` covers `len` bytes per the bus map; the VRAM range
        // was bounds-checked above.
        unsafe {
            let dev = self.vram.ptr.add(desc.dev_addr as usize);
            if mr & MR_DIR_TO_DEVICE != 0 {
                ptr::copy_nonoverlapping(host, dev, len);
            } else {
                ptr::copy_nonoverlapping(dev, host, len);
            }
        }
        true
    }

    fn bus_to_host(st: &SimState, bus: u64, len: usize) -> Option<*mut u8> {
        let (&base, mapping) = st.bus.range(..=bus).next_back()?;
        let offset = (bus - base) as usize;
        if offset + len > mapping.len {
            return None;
        }
        // Safety: offset is within the mapped length.
        Some(unsafe { mapping.host.add(offset) })
    }

    fn complete_pending(&self) {
        loop {
            let xfer = self.state.lock().unwrap().queue.pop_front();
            match xfer {
                Some(x) => self.execute(x, true),
                None => break,
            }
        }
    }

    fn decode(offset: u32) -> Option<(usize, u32)> {
        if offset < ENGINE_REG_BASE {
            return None;
        }
        let rel = offset - ENGINE_REG_BASE;
        let engine = (rel / ENGINE_REG_STRIDE) as usize;
        if engine >= NUM_ENGINES {
            return None;
        }
        Some((engine, rel % ENGINE_REG_STRIDE))
    }
}

impl BlitDevice for SimDevice {
    fn read32(&self, offset: u32) -> u32 {
        let Some((engine, reg)) = Self::decode(offset) else {
            return 0;
        };
        let st = self.state.lock().unwrap();
        let e = &st.engines[engine];
        match reg {
            REG_CSR => e.csr,
            REG_MR => e.mr,
            REG_BCR => e.bcr,
            REG_STR => e.tag,
            REG_SEQ => e.seq,
            _ => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let Some((engine, reg)) = Self::decode(offset) else {
            return;
        };
        let mut start = false;
        {
            let mut st = self.state.lock().unwrap();
            match reg {
                REG_CSR => {
                    {
                        let e = &mut st.engines[engine];
                        // Done bits are write-1-to-clear.
                        e.csr &= !(value & (CSR_TD | CSR_DD));
                        if value & CSR_DE != 0 {
                            e.csr |= CSR_DE;
                        } else {
                            e.csr &= !CSR_DE;
                        }
                    }
                    if value & CSR_TA != 0 {
                        debug!("sim: abort on engine {engine}");
                        st.engines[engine].csr &= !CSR_TS;
                        st.queue.retain(|q| q.engine != engine);
                    } else if value & CSR_TS != 0 {
                        let e = st.engines[engine];
                        // A start is only honored once mode and chain head
                        // are programmed; anything else is a hung engine.
                        if e.csr & CSR_DE != 0 && e.mr & MR_CM != 0 && e.dpr != 0 {
                            st.engines[engine].csr |= CSR_TS;
                            st.queue.push_back(QueuedTransfer {
                                engine,
                                head: e.dpr,
                                mr: e.mr,
                                tag: e.tag,
                            });
                            start = true;
                        } else {
                            error!("sim: start before mode/chain head on engine {engine}");
                        }
                    }
                }
                REG_MR => st.engines[engine].mr = value,
                REG_BCR => st.engines[engine].bcr = value,
                REG_STR => st.engines[engine].tag = value & SEQ_MASK,
                _ => {}
            }
        }
        if start && self.auto_complete.load(Ordering::Relaxed) {
            self.complete_pending();
        }
    }

    fn write64(&self, offset: u32, value: u64) {
        let Some((engine, reg)) = Self::decode(offset) else {
            return;
        };
        let mut st = self.state.lock().unwrap();
        let e = &mut st.engines[engine];
        match reg {
            REG_MAR => e.mar = value,
            REG_DAR => e.dar = value,
            REG_DPR => e.dpr = value,
            _ => {}
        }
    }

    fn map_single(&self, host: *const u8, len: usize, _dir: DmaDirection) -> MemResult<u64> {
        let remaining = self.fail_maps_after.load(Ordering::Relaxed);
        if remaining >= 0 {
            self.fail_maps_after.store(remaining - 1, Ordering::Relaxed);
            if remaining == 0 {
                return Err(MemError::DeviceFault("bus mapping exhausted".into()));
            }
        }
        let mut st = self.state.lock().unwrap();
        let bus = (st.next_bus + 63) & !63;
        st.next_bus = bus + len as u64;
        st.bus.insert(
            bus,
            BusMapping {
                host: host.cast_mut(),
                len,
            },
        );
        Ok(bus)
    }

    fn unmap_single(&self, bus: u64) {
        let removed = self.state.lock().unwrap().bus.remove(&bus);
        match removed {
            Some(m) if m.len == PAGE_SIZE => {
                self.unmapped_pages.fetch_add(1, Ordering::Relaxed);
            }
            Some(m) if m.len == size_of::<BlitDescriptor>() => {
                self.unmapped_descs.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {}
            None => error!("sim: unmap of untracked bus address {bus:#x}"),
        }
    }

    fn gart_bind(&self, first_page: u64, pages: &[u64]) -> MemResult<()> {
        let mut st = self.state.lock().unwrap();
        let end = first_page as usize + pages.len();
        if end > st.gart.len() {
            return Err(MemError::DeviceFault("gart bind out of range".into()));
        }
        for (i, &bus) in pages.iter().enumerate() {
            let slot = first_page as usize + i;
            if st.gart[slot] != 0 {
                return Err(MemError::DeviceFault("gart slot already bound".into()));
            }
            st.gart[slot] = bus;
        }
        Ok(())
    }

    fn gart_unbind(&self, first_page: u64, count: u64) {
        let mut st = self.state.lock().unwrap();
        for slot in first_page..first_page + count {
            st.gart[slot as usize] = 0;
        }
    }

    fn vram_pages(&self) -> u64 {
        self.vram_pages
    }

    fn gart_pages(&self) -> u64 {
        self.gart_pages
    }

    fn mmio_pages(&self) -> u64 {
        self.mmio_pages
    }

    fn map_vram(&self, offset: u64, len: usize) -> MemResult<*mut u8> {
        if offset as usize + len > self.vram.len {
            return Err(MemError::DeviceFault("vram mapping out of range".into()));
        }
        // Safety: bounds checked; the image lives as long as the device.
        Ok(unsafe { self.vram.ptr.add(offset as usize) })
    }
}
