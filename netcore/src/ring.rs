// Fixed-Capacity SPSC Ring
//
// Lock-free single-producer/single-consumer circular buffer shared between
// an interrupt handler (producer) and the cooperative mainline (consumer).
//
// Design:
// - Power-of-two capacity; slot index is `counter & mask`
// - `head` and `tail` are free-running counters, so every slot is usable
//   and occupancy is simply `head - tail` (wrapping)
// - Each index has exactly one writer: the producer owns `head`, the
//   consumer owns `tail`
// - Release on publish, Acquire on observe
//
// Safety:
// - A role claim flag per side refuses a nested producer (interrupt
//   nesting) or a re-entrant consumer instead of letting two contexts
//   share one role
// - A full ring refuses the value and hands it back; nothing is overwritten

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::error::{ConfigError, ConfigResult};

pub fn check_capacity(name: &'static str, capacity: usize) -> ConfigResult<()> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(ConfigError::NotPowerOfTwo {
            name,
            value: capacity,
        });
    }
    Ok(())
}

/// Exclusive claim on a ring role, released on drop.
pub(crate) struct RoleClaim<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RoleClaim<'a> {
    #[inline]
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(Self { flag })
        }
    }
}

impl Drop for RoleClaim<'_> {
    #[inline]
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SpscRing<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    producing: AtomicBool,
    consuming: AtomicBool,
    full_events: AtomicU32,
}

// Slots are only touched by the claimed producer (before publish) or the
// claimed consumer (after publish).
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    pub fn new(name: &'static str, capacity: usize) -> ConfigResult<Self> {
        check_capacity(name, capacity)?;

        let slots: Vec<UnsafeCell<MaybeUninit<T>>> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Ok(Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            producing: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
            full_events: AtomicU32::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub fn full_events(&self) -> u32 {
        self.full_events.load(Ordering::Relaxed)
    }

    /// Producer side. Hands the value back if the ring is full or the
    /// producer role is already held.
    pub fn push(&self, value: T) -> Result<(), T> {
        let Some(_claim) = RoleClaim::try_acquire(&self.producing) else {
            return Err(value);
        };

        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity() {
            self.full_events.fetch_add(1, Ordering::Relaxed);
            return Err(value);
        }

        unsafe {
            (*self.slots[head & self.mask].get()).write(value);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<T> {
        let _claim = RoleClaim::try_acquire(&self.consuming)?;

        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }

        let value = unsafe { (*self.slots[tail & self.mask].get()).assume_init_read() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let mut tail = *self.tail.get_mut();
        while tail != head {
            unsafe {
                self.slots[tail & self.mask].get_mut().assume_init_drop();
            }
            tail = tail.wrapping_add(1);
        }
    }
}
