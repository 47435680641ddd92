// Auxiliary Frame Memory
//
// Large received frames are promoted out of the staging pool into a
// secondary memory area so staging can be recycled quickly. On the target
// that area sits behind a move API (copy in, copy out) rather than being
// directly addressable; `AuxiliaryMemory` captures exactly that shape.
//
// `AuxPool` is a heap-backed implementation with fixed-size slots tracked
// in a bitmap (one bit per slot: 0 = free, 1 = allocated) and a next-fit
// hint, for targets without a dedicated extended-memory manager and for
// tests.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::CoreConfig;
use crate::error::AuxError;

pub trait AuxiliaryMemory {
    type Slot;

    fn alloc(&mut self, len: usize) -> Result<Self::Slot, AuxError>;
    fn copy_in(&mut self, slot: &Self::Slot, data: &[u8]) -> Result<(), AuxError>;
    /// Copies the stored frame into `out` and returns its length.
    fn copy_out(&mut self, slot: &Self::Slot, out: &mut [u8]) -> Result<usize, AuxError>;
    fn free(&mut self, slot: Self::Slot);
}

#[derive(Debug, PartialEq, Eq)]
pub struct AuxSlot(u32);

impl AuxSlot {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

pub struct AuxPool {
    storage: Box<[u8]>,
    lengths: Vec<usize>,
    bitmap: Vec<u8>,
    slot_size: usize,
    next_free_hint: usize,
    allocated: usize,
}

impl AuxPool {
    pub fn new(slots: usize, slot_size: usize) -> Self {
        Self {
            storage: vec![0u8; slots * slot_size].into_boxed_slice(),
            lengths: vec![0; slots],
            bitmap: vec![0u8; slots.div_ceil(8)],
            slot_size,
            next_free_hint: 0,
            allocated: 0,
        }
    }

    /// `aux_slots` slots, each large enough for one staging buffer.
    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.aux_slots, config.staging_buffer_size)
    }

    pub fn slots(&self) -> usize {
        self.lengths.len()
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    #[inline]
    fn is_allocated(&self, index: usize) -> bool {
        self.bitmap[index / 8] & (1 << (index % 8)) != 0
    }

    #[inline]
    fn set_allocated(&mut self, index: usize, allocated: bool) {
        let mask = 1 << (index % 8);
        if allocated {
            self.bitmap[index / 8] |= mask;
        } else {
            self.bitmap[index / 8] &= !mask;
        }
    }

    fn check(&self, slot: &AuxSlot) -> Result<usize, AuxError> {
        let index = slot.index();
        if index >= self.slots() || !self.is_allocated(index) {
            return Err(AuxError::InvalidSlot(slot.0));
        }
        Ok(index)
    }

    fn range(&self, index: usize) -> core::ops::Range<usize> {
        let start = index * self.slot_size;
        start..start + self.slot_size
    }
}

impl AuxiliaryMemory for AuxPool {
    type Slot = AuxSlot;

    fn alloc(&mut self, len: usize) -> Result<AuxSlot, AuxError> {
        if len > self.slot_size {
            return Err(AuxError::TooLarge {
                len,
                capacity: self.slot_size,
            });
        }

        let total = self.slots();
        for step in 0..total {
            let index = (self.next_free_hint + step) % total;
            if !self.is_allocated(index) {
                self.set_allocated(index, true);
                self.lengths[index] = 0;
                self.next_free_hint = (index + 1) % total;
                self.allocated += 1;
                return Ok(AuxSlot(index as u32));
            }
        }
        Err(AuxError::Exhausted)
    }

    fn copy_in(&mut self, slot: &AuxSlot, data: &[u8]) -> Result<(), AuxError> {
        let index = self.check(slot)?;
        if data.len() > self.slot_size {
            return Err(AuxError::TooLarge {
                len: data.len(),
                capacity: self.slot_size,
            });
        }

        let range = self.range(index);
        self.storage[range.start..range.start + data.len()].copy_from_slice(data);
        self.lengths[index] = data.len();
        Ok(())
    }

    fn copy_out(&mut self, slot: &AuxSlot, out: &mut [u8]) -> Result<usize, AuxError> {
        let index = self.check(slot)?;
        let len = self.lengths[index];
        if len > out.len() {
            return Err(AuxError::TooLarge {
                len,
                capacity: out.len(),
            });
        }

        let start = self.range(index).start;
        out[..len].copy_from_slice(&self.storage[start..start + len]);
        Ok(len)
    }

    fn free(&mut self, slot: AuxSlot) {
        let Ok(index) = self.check(&slot) else {
            return;
        };
        self.set_allocated(index, false);
        self.lengths[index] = 0;
        self.allocated -= 1;
    }
}
