// Deferred Resource Release
//
// Some release calls (region unlocks in the memory manager) must never run
// in interrupt context. Interrupt handlers park them here and the mainline
// performs them later with interrupts enabled.
//
// Design:
// - Small fixed ring; index updates happen inside an interrupt-masked
//   critical section so a nested interrupt cannot interleave with them
// - A vacant slot holds `None`
// - Processing copies one record out under the section, leaves it, then
//   performs the release, so the masked window never covers the slow call

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{ConfigResult, DeferredError};
use crate::irq::{InterruptControl, IrqGuard};
use crate::ring::{check_capacity, RoleClaim};

/// Record parked for the mainline. `None` marks a vacant slot.
#[derive(Debug)]
pub struct DeferredRelease<R> {
    resource: Option<R>,
}

struct ReleaseRing<R> {
    slots: Box<[DeferredRelease<R>]>,
    head: usize,
    tail: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeferredStats {
    pub queued: u32,
    pub processed: u32,
    pub refused: u32,
}

pub struct DeferredReleaseQueue<R> {
    ring: Mutex<ReleaseRing<R>>,
    mask: usize,
    running: AtomicBool,
    queued: AtomicU32,
    processed: AtomicU32,
    refused: AtomicU32,
}

impl<R> DeferredReleaseQueue<R> {
    pub fn new(capacity: usize) -> ConfigResult<Self> {
        check_capacity("deferred release ring", capacity)?;

        let slots: Vec<DeferredRelease<R>> = (0..capacity).map(|_| DeferredRelease { resource: None }).collect();

        Ok(Self {
            ring: Mutex::new(ReleaseRing {
                slots: slots.into_boxed_slice(),
                head: 0,
                tail: 0,
            }),
            mask: capacity - 1,
            running: AtomicBool::new(false),
            queued: AtomicU32::new(0),
            processed: AtomicU32::new(0),
            refused: AtomicU32::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn len<I: InterruptControl + ?Sized>(&self, irq: &I) -> usize {
        let _guard = IrqGuard::new(irq);
        let ring = self.ring.lock();
        ring.head.wrapping_sub(ring.tail)
    }

    pub fn stats(&self) -> DeferredStats {
        DeferredStats {
            queued: self.queued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }

    /// Interrupt-safe. A full ring hands the resource back.
    pub fn queue_deferred<I: InterruptControl + ?Sized>(&self, irq: &I, resource: R) -> Result<(), R> {
        let _guard = IrqGuard::new(irq);
        let mut ring = self.ring.lock();

        if ring.head.wrapping_sub(ring.tail) > self.mask {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return Err(resource);
        }

        let index = ring.head & self.mask;
        ring.slots[index].resource = Some(resource);
        ring.head = ring.head.wrapping_add(1);
        self.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn take_one<I: InterruptControl + ?Sized>(&self, irq: &I) -> Option<R> {
        let _guard = IrqGuard::new(irq);
        let mut ring = self.ring.lock();

        while ring.tail != ring.head {
            let index = ring.tail & self.mask;
            ring.tail = ring.tail.wrapping_add(1);
            if let Some(resource) = ring.slots[index].resource.take() {
                return Some(resource);
            }
        }
        None
    }

    /// Mainline only. Performs every parked release and returns how many
    /// ran. Refuses to start with interrupts disabled or while another
    /// invocation is in progress.
    pub fn process_deferred<I, F>(&self, irq: &I, mut release: F) -> Result<usize, DeferredError>
    where
        I: InterruptControl + ?Sized,
        F: FnMut(R),
    {
        if !irq.are_enabled() {
            return Err(DeferredError::InterruptsDisabled);
        }
        let Some(_claim) = RoleClaim::try_acquire(&self.running) else {
            return Err(DeferredError::Busy);
        };

        let mut count = 0;
        while let Some(resource) = self.take_one(irq) {
            release(resource);
            count += 1;
        }

        self.processed.fetch_add(count as u32, Ordering::Relaxed);
        Ok(count)
    }
}
