//! Per-engine fence pool: wrapping sequence numbers, a pending table, and
//! interrupt-driven signaling.

use crate::error::{MemError, MemResult};
use crate::hw::device::BlitDevice;
use crate::hw::regs::{
    CSR_DD, CSR_TD, NUM_ENGINES, REG_CSR, REG_SEQ, SEQ_HALF_RANGE, SEQ_MASK, engine_base,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// How often a blocked waiter re-reads the completed-sequence counter in
/// case the interrupt was lost.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

type Cleanup = Box<dyn FnOnce() + Send>;

/// `true` when the completed counter `observed` covers `seq`, allowing for
/// the 30-bit wrap.
#[must_use]
pub const fn seq_covers(observed: u32, seq: u32) -> bool {
    observed.wrapping_sub(seq) & SEQ_MASK <= SEQ_HALF_RANGE
}

struct PendingFence {
    cleanup: Option<Cleanup>,
}

struct FenceInner {
    next_seq: [u32; NUM_ENGINES],
    pending: HashMap<u64, PendingFence>,
}

const fn key(engine: usize, seq: u32) -> u64 {
    ((engine as u64) << 32) | seq as u64
}

/// Handle to one submitted transfer. Cheap to clone; all state lives in
/// the pool's pending table.
#[derive(Clone)]
pub struct Fence {
    pool: Arc<FencePool>,
    engine: usize,
    seq: u32,
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("engine", &self.engine)
            .field("seq", &self.seq)
            .finish()
    }
}

impl Fence {
    #[must_use]
    pub fn engine(&self) -> usize {
        self.engine
    }

    #[must_use]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    #[must_use]
    pub fn signaled(&self) -> bool {
        self.pool.signaled(self)
    }

    /// Block until signaled. `None` uses the pool's default timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> MemResult<()> {
        self.pool.wait(self, timeout)
    }
}

pub struct FencePool {
    device: Arc<dyn BlitDevice>,
    inner: Mutex<FenceInner>,
    cv: Condvar,
    default_timeout: Duration,
}

impl FencePool {
    #[must_use]
    pub fn new(device: Arc<dyn BlitDevice>, default_timeout: Duration) -> Self {
        Self {
            device,
            inner: Mutex::new(FenceInner {
                next_seq: [1; NUM_ENGINES],
                pending: HashMap::new(),
            }),
            cv: Condvar::new(),
            default_timeout,
        }
    }

    /// Allocate the next sequence on `engine`, register it as pending,
    /// then run `emit_fn` with the sequence number outside the pool lock.
    ///
    /// If the emit callback fails the entry is withdrawn and the error
    /// surfaced; nothing was submitted, so there is nothing to clean up.
    /// Cleanup for the in-flight resources is attached separately with
    /// `attach_cleanup` once submission has actually happened.
    pub fn emit<F>(self: &Arc<Self>, engine: usize, emit_fn: F) -> MemResult<Fence>
    where
        F: FnOnce(u32) -> MemResult<()>,
    {
        let seq = {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.next_seq[engine];
            inner.next_seq[engine] = seq.wrapping_add(1) & SEQ_MASK;
            inner
                .pending
                .insert(key(engine, seq), PendingFence { cleanup: None });
            seq
        };

        if let Err(err) = emit_fn(seq) {
            self.inner.lock().unwrap().pending.remove(&key(engine, seq));
            return Err(err);
        }

        Ok(Fence {
            pool: self.clone(),
            engine,
            seq,
        })
    }

    /// Attach the resource-release closure for `fence`. If the fence has
    /// already signaled (the transfer completed between emit and here) the
    /// cleanup runs immediately on this thread.
    pub fn attach_cleanup(&self, fence: &Fence, cleanup: Cleanup) {
        let run_now = {
            let mut inner = self.inner.lock().unwrap();
            match inner.pending.get_mut(&key(fence.engine, fence.seq)) {
                Some(entry) => {
                    entry.cleanup = Some(cleanup);
                    None
                }
                None => Some(cleanup),
            }
        };
        if let Some(cleanup) = run_now {
            cleanup();
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Preset an engine's sequence counter, for bring-up and wrap testing.
    /// Only valid while the engine has nothing pending.
    pub fn preset_sequence(&self, engine: usize, seq: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq[engine] = seq & SEQ_MASK;
    }

    fn is_pending(&self, fence: &Fence) -> bool {
        self.inner
            .lock()
            .unwrap()
            .pending
            .contains_key(&key(fence.engine, fence.seq))
    }

    /// Lazily resolve against the device counter, then report.
    #[must_use]
    pub fn signaled(&self, fence: &Fence) -> bool {
        if !self.is_pending(fence) {
            return true;
        }
        self.poll_engine(fence.engine);
        !self.is_pending(fence)
    }

    /// Re-read the engine's completed-sequence counter and retire whatever
    /// it covers. Used by waiters as a fallback for lost interrupts.
    pub fn poll_engine(&self, engine: usize) {
        let observed = self.device.read32(engine_base(engine) + REG_SEQ) & SEQ_MASK;
        self.process(engine, observed);
    }

    /// Interrupt entry point. Returns `true` if the engine had a done bit
    /// set (the interrupt was ours) and it was acknowledged.
    pub fn on_engine_interrupt(&self, engine: usize) -> bool {
        let base = engine_base(engine);
        let csr = self.device.read32(base + REG_CSR);
        let done = csr & (CSR_TD | CSR_DD);
        if done == 0 {
            return false;
        }
        let observed = self.device.read32(base + REG_SEQ) & SEQ_MASK;
        // Ack before processing so a completion racing in behind us raises
        // a fresh interrupt instead of being folded into this ack.
        self.device.write32(base + REG_CSR, done);
        self.process(engine, observed);
        true
    }

    /// Retire every pending fence on `engine` covered by `observed`,
    /// oldest first. Cleanups run after the pool lock is dropped; they
    /// only release resources, never allocate.
    fn process(&self, engine: usize, observed: u32) {
        let mut ripe: Vec<(u32, Option<Cleanup>)> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let keys: Vec<u64> = inner
                .pending
                .keys()
                .copied()
                .filter(|&k| {
                    (k >> 32) as usize == engine && seq_covers(observed, (k & 0xFFFF_FFFF) as u32)
                })
                .collect();
            for k in keys {
                if let Some(entry) = inner.pending.remove(&k) {
                    ripe.push(((k & 0xFFFF_FFFF) as u32, entry.cleanup));
                }
            }
        }
        if ripe.is_empty() {
            return;
        }
        // Largest wrap distance from `observed` = submitted earliest.
        ripe.sort_by_key(|&(seq, _)| std::cmp::Reverse(observed.wrapping_sub(seq) & SEQ_MASK));
        for (seq, cleanup) in ripe {
            log::debug!("fence engine {engine} seq {seq} signaled");
            if let Some(cleanup) = cleanup {
                cleanup();
            }
        }
        self.cv.notify_all();
    }

    /// Block until `fence` signals or the timeout expires. A timeout
    /// leaves the entry pending: a late interrupt still resolves it.
    pub fn wait(&self, fence: &Fence, timeout: Option<Duration>) -> MemResult<()> {
        let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);
        let k = key(fence.engine, fence.seq);
        loop {
            if self.signaled(fence) {
                return Ok(());
            }
            let inner = self.inner.lock().unwrap();
            if !inner.pending.contains_key(&k) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                drop(inner);
                log::warn!(
                    "timed out waiting for fence engine {} seq {}",
                    fence.engine,
                    fence.seq
                );
                return Err(MemError::WaitTimeout);
            }
            let slice = (deadline - now).min(WAIT_POLL_INTERVAL);
            drop(self.cv.wait_timeout(inner, slice).unwrap().0);
        }
    }

    /// Force every pending fence terminal without consulting the device.
    /// Shutdown path: the engines are assumed drained or aborted.
    pub fn flush_all(&self) {
        let drained: Vec<(u64, Option<Cleanup>)> = {
            let mut inner = self.inner.lock().unwrap();
            let mut drained: Vec<(u64, Option<Cleanup>)> = inner
                .pending
                .drain()
                .map(|(k, e)| (k, e.cleanup))
                .collect();
            drained.sort_by_key(|&(k, _)| k);
            drained
        };
        if !drained.is_empty() {
            log::warn!("force-flushing {} pending fences", drained.len());
        }
        for (_, cleanup) in drained {
            if let Some(cleanup) = cleanup {
                cleanup();
            }
        }
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> (Arc<SimDevice>, Arc<FencePool>) {
        let sim = Arc::new(SimDevice::new(16, 16, 0));
        let dev: Arc<dyn BlitDevice> = sim.clone();
        let pool = Arc::new(FencePool::new(dev, Duration::from_millis(50)));
        (sim, pool)
    }

    #[test]
    fn coverage_is_wraparound_safe() {
        assert!(seq_covers(5, 5));
        assert!(seq_covers(6, 5));
        assert!(!seq_covers(4, 5));
        // Counter wrapped: a small observed value still covers sequences
        // issued just below the wrap point.
        assert!(seq_covers(2, SEQ_MASK - 1));
        assert!(!seq_covers(SEQ_MASK - 1, 2));
    }

    #[test]
    fn emit_failure_withdraws_entry() {
        let (_sim, pool) = pool();
        let err = pool.emit(0, |_seq| Err(MemError::OutOfMemory));
        assert!(matches!(err, Err(MemError::OutOfMemory)));
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn cleanup_attached_after_signal_runs_immediately() {
        let (sim, pool) = pool();
        let fence = pool.emit(0, |_seq| Ok(())).unwrap();
        sim.preset_seq(0, fence.seq());
        pool.poll_engine(0);
        assert!(fence.signaled());
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        pool.attach_cleanup(&fence, Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_leaves_entry_pending() {
        let (sim, pool) = pool();
        let fence = pool.emit(0, |_seq| Ok(())).unwrap();
        assert!(matches!(
            fence.wait(Some(Duration::from_millis(5))),
            Err(MemError::WaitTimeout)
        ));
        assert_eq!(pool.pending_count(), 1);
        // Late completion still resolves it.
        sim.preset_seq(0, fence.seq());
        pool.poll_engine(0);
        assert!(fence.signaled());
    }

    #[test]
    fn flush_runs_every_cleanup() {
        let (_sim, pool) = pool();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fence = pool.emit(1, |_seq| Ok(())).unwrap();
            let r = ran.clone();
            pool.attach_cleanup(&fence, Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.flush_all();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(pool.pending_count(), 0);
    }
}
