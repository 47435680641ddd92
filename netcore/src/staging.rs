// RX Staging Buffer Pool
//
// Fixed pool of pre-allocated frame buffers. The receive interrupt takes a
// buffer from the freelist, copies the frame in, and hands the buffer id to
// the bottom half, which frees it as soon as the frame has been moved on.
//
// Design:
// - All buffers are allocated at construction; the interrupt path never
//   touches the heap
// - Freelist is a LIFO stack of slot indices behind a `spin::Mutex`, only
//   ever locked with interrupts masked
// - `StagingId` is move-only: holding one is the right to use and free
//   that slot, so a buffer cannot be freed twice through the public API
// - `in_use` is still tracked per slot and checked on free; a mismatch is
//   counted and the free is ignored

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{ConfigError, ConfigResult};
use crate::hal::InterfaceId;
use crate::irq::{InterruptControl, IrqGuard};

/// Ownership token for one staging slot.
#[derive(Debug, PartialEq, Eq)]
pub struct StagingId(u16);

impl StagingId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub struct StagingBuffer {
    data: Box<[u8]>,
    used: usize,
    source: InterfaceId,
    in_use: bool,
}

impl StagingBuffer {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            used: 0,
            source: 0,
            in_use: false,
        }
    }

    pub fn frame(&self) -> &[u8] {
        &self.data[..self.used]
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn source_interface(&self) -> InterfaceId {
        self.source
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }
}

pub struct StagingPool {
    slots: Box<[Mutex<StagingBuffer>]>,
    free: Mutex<Vec<u16>>,
    buffer_size: usize,
    exhausted: AtomicU32,
    invalid_frees: AtomicU32,
}

impl StagingPool {
    pub fn new(count: usize, buffer_size: usize) -> ConfigResult<Self> {
        if count == 0 {
            return Err(ConfigError::Zero { name: "staging buffers" });
        }
        if buffer_size == 0 {
            return Err(ConfigError::Zero {
                name: "staging buffer size",
            });
        }
        if count > u16::MAX as usize {
            return Err(ConfigError::TooLarge {
                name: "staging buffers",
                value: count,
                max: u16::MAX as usize,
            });
        }

        let slots: Vec<Mutex<StagingBuffer>> = (0..count)
            .map(|_| Mutex::new(StagingBuffer::new(buffer_size)))
            .collect();
        // Lowest index on top of the stack.
        let free: Vec<u16> = (0..count as u16).rev().collect();

        Ok(Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new(free),
            buffer_size,
            exhausted: AtomicU32::new(0),
            invalid_frees: AtomicU32::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn available<I: InterruptControl + ?Sized>(&self, irq: &I) -> usize {
        let _guard = IrqGuard::new(irq);
        self.free.lock().len()
    }

    pub fn exhausted(&self) -> u32 {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn invalid_frees(&self) -> u32 {
        self.invalid_frees.load(Ordering::Relaxed)
    }

    /// Interrupt-safe. `None` and an exhaustion count when the pool is
    /// empty; buffers already in use are not touched.
    pub fn alloc<I: InterruptControl + ?Sized>(&self, irq: &I) -> Option<StagingId> {
        let index = {
            let _guard = IrqGuard::new(irq);
            self.free.lock().pop()
        };

        let Some(index) = index else {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let mut slot = self.slots[index as usize].lock();
        slot.in_use = true;
        slot.used = 0;
        Some(StagingId(index))
    }

    /// Copy a frame into an allocated buffer. The length is checked before
    /// any byte is written; on `Err` the buffer is unchanged.
    pub fn fill(&self, id: &StagingId, frame: &[u8], source: InterfaceId) -> Result<(), usize> {
        if frame.len() > self.buffer_size {
            return Err(frame.len());
        }

        let mut slot = self.slots[id.index()].lock();
        slot.data[..frame.len()].copy_from_slice(frame);
        slot.used = frame.len();
        slot.source = source;
        Ok(())
    }

    pub fn with_buffer<R>(&self, id: &StagingId, f: impl FnOnce(&StagingBuffer) -> R) -> R {
        let slot = self.slots[id.index()].lock();
        f(&slot)
    }

    pub fn free<I: InterruptControl + ?Sized>(&self, irq: &I, id: StagingId) {
        let index = id.0;
        {
            let mut slot = self.slots[index as usize].lock();
            if !slot.in_use {
                self.invalid_frees.fetch_add(1, Ordering::Relaxed);
                return;
            }
            slot.in_use = false;
            slot.used = 0;
        }

        let _guard = IrqGuard::new(irq);
        self.free.lock().push(index);
    }

    #[cfg(test)]
    fn forge(index: u16) -> StagingId {
        StagingId(index)
    }
}
