// TX Completion Ring
//
// Hands finished transmit descriptors from the TX-complete interrupt to the
// bottom half, which releases their bus mappings outside interrupt context.
//
// Key responsibilities:
// - Interrupt producer: record (interface, descriptor, mapping, tick) and
//   publish it; never blocks, never frees
// - Bottom-half consumer: unmap in bounded batches and keep the
//   pending-work flag honest
// - Watchdog support: consistent (head, tail) snapshots through the
//   sequence counter and generation-checked timeout flagging
// - Overflow recovery support: release mappings of stale entries in place
//
// Ownership:
// - The mapping lives in the slot from publish until a consumer takes it.
//   Drain and stale recovery both hold the consumer role, so a mapping is
//   released by exactly one of them
// - A refused enqueue returns the mapping to the interrupt handler; it is
//   never freed in place
//
// Slot state word: `generation << 1 | timed_out`. The generation is the
// free-running position the slot was published at, so the watchdog's
// compare-and-swap fails on a slot that was recycled after it looked.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::error::ConfigResult;
use crate::hal::{DescriptorIndex, InterfaceId, MappingSubsystem};
use crate::irq::InterruptControl;
use crate::ring::{check_capacity, RoleClaim};
use crate::seqlock::{ReadPath, SeqCount};
use crate::tick::{ticks_between, Tick};
use crate::{log_debug, log_warn};

const LOG_ORIGIN: &str = "txc";

const TIMED_OUT: u64 = 1;
const VACANT: u64 = u64::MAX;

struct CompletionEntry<H> {
    interface: AtomicU8,
    descriptor: AtomicU16,
    enqueue_tick: AtomicU32,
    state: AtomicU64,
    mapping: UnsafeCell<Option<H>>,
}

impl<H> CompletionEntry<H> {
    fn vacant() -> Self {
        Self {
            interface: AtomicU8::new(0),
            descriptor: AtomicU16::new(0),
            enqueue_tick: AtomicU32::new(0),
            state: AtomicU64::new(VACANT),
            mapping: UnsafeCell::new(None),
        }
    }
}

#[inline]
fn generation(position: usize) -> u64 {
    (position as u64) << 1
}

/// Consistent view of the ring indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub head: usize,
    pub tail: usize,
    pub sequence: u32,
    pub path: ReadPath,
}

impl RingSnapshot {
    pub fn occupancy(&self) -> usize {
        self.head.wrapping_sub(self.tail)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionStats {
    pub completed: u32,
    pub overflowed: u32,
    pub refused_nested: u32,
    pub processed: u32,
    pub timed_out_released: u32,
    pub flagged: u32,
    pub recovered: u32,
    pub snapshot_fallbacks: u32,
}

pub struct CompletionRing<H> {
    slots: Box<[CompletionEntry<H>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    seq: SeqCount,
    overflow: AtomicBool,
    pending: AtomicBool,
    producing: AtomicBool,
    consuming: AtomicBool,

    completed: AtomicU32,
    overflowed: AtomicU32,
    refused_nested: AtomicU32,
    processed: AtomicU32,
    timed_out_released: AtomicU32,
    flagged: AtomicU32,
    recovered: AtomicU32,
    snapshot_fallbacks: AtomicU32,
}

// The mapping cell is only touched by the claimed producer before publish
// and by the claimed consumer after publish.
unsafe impl<H: Send> Send for CompletionRing<H> {}
unsafe impl<H: Send> Sync for CompletionRing<H> {}

impl<H> CompletionRing<H> {
    pub fn new(capacity: usize) -> ConfigResult<Self> {
        check_capacity("completion ring", capacity)?;

        let slots: Vec<CompletionEntry<H>> = (0..capacity).map(|_| CompletionEntry::vacant()).collect();

        Ok(Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            seq: SeqCount::new(),
            overflow: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            producing: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
            completed: AtomicU32::new(0),
            overflowed: AtomicU32::new(0),
            refused_nested: AtomicU32::new(0),
            processed: AtomicU32::new(0),
            timed_out_released: AtomicU32::new(0),
            flagged: AtomicU32::new(0),
            recovered: AtomicU32::new(0),
            snapshot_fallbacks: AtomicU32::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        self.head.load(Ordering::Acquire).wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn overflow_pending(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Clears and returns the overflow flag. Cleared before recovery runs
    /// so an overflow during the sweep schedules another one.
    pub fn take_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn rearm_overflow(&self) {
        self.overflow.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> CompletionStats {
        CompletionStats {
            completed: self.completed.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            refused_nested: self.refused_nested.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            timed_out_released: self.timed_out_released.load(Ordering::Relaxed),
            flagged: self.flagged.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            snapshot_fallbacks: self.snapshot_fallbacks.load(Ordering::Relaxed),
        }
    }

    fn refuse(&self, mapping: H) -> Result<(), H> {
        self.overflowed.fetch_add(1, Ordering::Relaxed);
        self.overflow.store(true, Ordering::Release);
        Err(mapping)
    }

    /// Interrupt context only. On a full ring, or when another producer is
    /// mid-update, the mapping is handed back and the overflow flag is set.
    pub fn try_enqueue(
        &self,
        interface: InterfaceId,
        descriptor: DescriptorIndex,
        mapping: H,
        now: Tick,
    ) -> Result<(), H> {
        let Some(_claim) = RoleClaim::try_acquire(&self.producing) else {
            self.refused_nested.fetch_add(1, Ordering::Relaxed);
            return self.refuse(mapping);
        };

        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity() {
            return self.refuse(mapping);
        }

        let slot = &self.slots[head & self.mask];

        self.seq.write_begin();
        slot.interface.store(interface, Ordering::Relaxed);
        slot.descriptor.store(descriptor, Ordering::Relaxed);
        slot.enqueue_tick.store(now, Ordering::Relaxed);
        unsafe {
            *slot.mapping.get() = Some(mapping);
        }
        slot.state.store(generation(head), Ordering::Release);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        self.seq.write_end();

        self.completed.fetch_add(1, Ordering::Relaxed);
        self.pending.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Bottom half only. Releases up to `max_batch` mappings in FIFO order
    /// and returns how many entries were retired. Returns 0 without touching
    /// the ring if another consumer is running.
    pub fn drain<M>(&self, mapper: &mut M, max_batch: usize) -> usize
    where
        M: MappingSubsystem<Handle = H> + ?Sized,
    {
        let Some(_claim) = RoleClaim::try_acquire(&self.consuming) else {
            return 0;
        };

        let mut processed = 0;
        while processed < max_batch {
            let tail = self.tail.load(Ordering::Relaxed);
            if self.head.load(Ordering::Acquire) == tail {
                break;
            }

            let slot = &self.slots[tail & self.mask];
            let timed_out = slot.state.load(Ordering::Acquire) & TIMED_OUT != 0;
            let interface = slot.interface.load(Ordering::Relaxed);
            let descriptor = slot.descriptor.load(Ordering::Relaxed);
            let mapping = unsafe { (*slot.mapping.get()).take() };
            self.tail.store(tail.wrapping_add(1), Ordering::Release);

            if let Some(mapping) = mapping {
                if timed_out {
                    self.timed_out_released.fetch_add(1, Ordering::Relaxed);
                    log_warn!(
                        LOG_ORIGIN,
                        "releasing timed-out transfer if={} desc={}",
                        interface,
                        descriptor
                    );
                }
                mapper.unmap(mapping);
            }
            processed += 1;
        }

        self.processed.fetch_add(processed as u32, Ordering::Relaxed);

        if self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Relaxed) {
            self.pending.store(false, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Relaxed) {
                self.pending.store(true, Ordering::SeqCst);
            }
        }

        processed
    }

    /// Usable from any context. Never blocks the producer; after the retry
    /// ceiling it reads with interrupts masked and counts the fallback.
    pub fn snapshot<I: InterruptControl + ?Sized>(&self, irq: &I) -> RingSnapshot {
        let ((tail, head, sequence), path) = self.seq.read(irq, || {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            (tail, head, self.seq.sequence())
        });

        if path == ReadPath::Fallback {
            self.snapshot_fallbacks.fetch_add(1, Ordering::Relaxed);
        }

        RingSnapshot {
            head,
            tail,
            sequence,
            path,
        }
    }

    /// Marks live entries in `snapshot` older than `timeout` ticks. Reads
    /// slot metadata only; never touches a mapping. Returns the number of
    /// entries newly flagged.
    pub fn flag_timeouts(&self, snapshot: &RingSnapshot, now: Tick, timeout: u32, modulus: u32) -> usize {
        let mut flagged = 0;
        let span = snapshot.occupancy().min(self.capacity());

        for offset in 0..span {
            let position = snapshot.tail.wrapping_add(offset);
            let slot = &self.slots[position & self.mask];
            let live = generation(position);

            if slot.state.load(Ordering::Acquire) != live {
                continue;
            }
            let start = slot.enqueue_tick.load(Ordering::Relaxed);
            if ticks_between(start, now, modulus) <= timeout {
                continue;
            }
            if slot
                .state
                .compare_exchange(live, live | TIMED_OUT, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                flagged += 1;
            }
        }

        self.flagged.fetch_add(flagged as u32, Ordering::Relaxed);
        flagged
    }

    /// Overflow recovery over the software ring: releases the mappings of
    /// entries older than `timeout` and flags them. The entries stay queued
    /// and are retired by the next drain without a second release.
    /// `None` if a drain currently holds the consumer role.
    pub fn recover_stale<M>(&self, mapper: &mut M, now: Tick, timeout: u32, modulus: u32) -> Option<usize>
    where
        M: MappingSubsystem<Handle = H> + ?Sized,
    {
        let _claim = RoleClaim::try_acquire(&self.consuming)?;

        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let mut released = 0;

        let mut position = tail;
        while position != head {
            let slot = &self.slots[position & self.mask];
            let start = slot.enqueue_tick.load(Ordering::Relaxed);

            if ticks_between(start, now, modulus) > timeout {
                if let Some(mapping) = unsafe { (*slot.mapping.get()).take() } {
                    slot.state.fetch_or(TIMED_OUT, Ordering::AcqRel);
                    mapper.unmap(mapping);
                    released += 1;
                }
            }
            position = position.wrapping_add(1);
        }

        if released > 0 {
            self.recovered.fetch_add(released as u32, Ordering::Relaxed);
            log_debug!(LOG_ORIGIN, "released {} stale completion mappings", released);
        }
        Some(released)
    }

    /// Timed-out flag of the entry at `position`, if it is still live.
    pub fn is_flagged(&self, position: usize) -> Option<bool> {
        let state = self.slots[position & self.mask].state.load(Ordering::Acquire);
        (state & !TIMED_OUT == generation(position)).then_some(state & TIMED_OUT != 0)
    }
}

impl<H> Drop for CompletionRing<H> {
    fn drop(&mut self) {
        // Leftover handles are dropped, not unmapped; detach drains first.
        for slot in self.slots.iter_mut() {
            slot.mapping.get_mut().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::SimulatedInterrupts;
    use crate::testing::{Handle, RecordingMapper};
    use crate::tick::TICKS_PER_DAY;

    #[test]
    fn full_ring_refuses_and_returns_mapping() {
        let ring = CompletionRing::new(4).unwrap();
        for i in 0..4 {
            ring.try_enqueue(0, i, Handle(i as u32), 0).unwrap();
        }
        assert_eq!(ring.try_enqueue(0, 4, Handle(4), 0), Err(Handle(4)));
        assert_eq!(ring.stats().overflowed, 1);
        assert!(ring.take_overflow());
        assert!(!ring.take_overflow());
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn drain_releases_in_order_and_clears_pending() {
        let ring = CompletionRing::new(8).unwrap();
        let mut mapper = RecordingMapper::default();
        for i in 0..5 {
            ring.try_enqueue(1, i, Handle(i as u32), 0).unwrap();
        }
        assert!(ring.has_pending());

        assert_eq!(ring.drain(&mut mapper, 3), 3);
        assert!(ring.has_pending());
        assert_eq!(ring.drain(&mut mapper, 16), 2);
        assert!(!ring.has_pending());
        assert_eq!(mapper.unmapped, vec![0, 1, 2, 3, 4]);
        assert_eq!(ring.stats().processed, 5);
    }

    #[test]
    fn drain_refuses_reentry() {
        let ring = CompletionRing::new(4).unwrap();
        let mut mapper = RecordingMapper::default();
        ring.try_enqueue(0, 0, Handle(0), 0).unwrap();

        let claim = RoleClaim::try_acquire(&ring.consuming).unwrap();
        assert_eq!(ring.drain(&mut mapper, 16), 0);
        drop(claim);
        assert_eq!(ring.drain(&mut mapper, 16), 1);
    }

    #[test]
    fn flag_only_after_timeout_elapses() {
        let ring = CompletionRing::new(4).unwrap();
        let irq = SimulatedInterrupts::new();
        ring.try_enqueue(0, 0, Handle(0), 100).unwrap();

        let snap = ring.snapshot(&irq);
        assert_eq!(ring.flag_timeouts(&snap, 192, 92, TICKS_PER_DAY), 0);
        assert_eq!(ring.is_flagged(0), Some(false));
        assert_eq!(ring.flag_timeouts(&snap, 193, 92, TICKS_PER_DAY), 1);
        assert_eq!(ring.is_flagged(0), Some(true));
        // Already flagged entries are not counted twice.
        assert_eq!(ring.flag_timeouts(&snap, 300, 92, TICKS_PER_DAY), 0);
    }

    #[test]
    fn stale_snapshot_never_flags_recycled_slot() {
        let ring = CompletionRing::new(2).unwrap();
        let irq = SimulatedInterrupts::new();
        let mut mapper = RecordingMapper::default();

        ring.try_enqueue(0, 0, Handle(0), 0).unwrap();
        let stale = ring.snapshot(&irq);

        ring.drain(&mut mapper, 16);
        ring.try_enqueue(0, 1, Handle(1), 0).unwrap();
        ring.try_enqueue(0, 2, Handle(2), 0).unwrap();

        // Position 0 now holds the entry published at position 2.
        assert_eq!(ring.flag_timeouts(&stale, 1000, 92, TICKS_PER_DAY), 0);
        assert_eq!(ring.is_flagged(2), Some(false));
    }

    #[test]
    fn recovery_and_drain_release_each_mapping_once() {
        let ring = CompletionRing::new(8).unwrap();
        let mut mapper = RecordingMapper::default();
        ring.try_enqueue(0, 0, Handle(10), 0).unwrap();
        ring.try_enqueue(0, 1, Handle(11), 50).unwrap();
        ring.try_enqueue(0, 2, Handle(12), 150).unwrap();

        assert_eq!(ring.recover_stale(&mut mapper, 160, 92, TICKS_PER_DAY), Some(2));
        assert_eq!(ring.recover_stale(&mut mapper, 160, 92, TICKS_PER_DAY), Some(0));
        assert_eq!(ring.drain(&mut mapper, 16), 3);

        let mut released = mapper.unmapped.clone();
        released.sort_unstable();
        assert_eq!(released, vec![10, 11, 12]);
        assert_eq!(ring.stats().recovered, 2);
    }

    #[test]
    fn nested_producer_is_refused() {
        let ring = CompletionRing::new(4).unwrap();
        let claim = RoleClaim::try_acquire(&ring.producing).unwrap();
        assert_eq!(ring.try_enqueue(0, 0, Handle(1), 0), Err(Handle(1)));
        drop(claim);
        assert_eq!(ring.stats().refused_nested, 1);
        assert!(ring.overflow_pending());
    }

    #[test]
    fn snapshot_during_write_falls_back() {
        let ring: CompletionRing<Handle> = CompletionRing::new(4).unwrap();
        let irq = SimulatedInterrupts::new();
        ring.seq.write_begin();
        let snap = ring.snapshot(&irq);
        assert_eq!(snap.path, ReadPath::Fallback);
        assert_eq!(ring.stats().snapshot_fallbacks, 1);
        ring.seq.write_end();
        assert!(matches!(ring.snapshot(&irq).path, ReadPath::Optimistic { .. }));
    }
}
