// Sequence Counter (seqlock)
//
// Lets a read-only third context (the watchdog) take a consistent view of
// state owned by an interrupt producer without ever blocking it.
//
// Protocol:
// - Writer: `write_begin` (sequence becomes odd), update fields,
//   `write_end` (sequence becomes even again)
// - Reader: sample the sequence; odd means a write is in flight, retry;
//   read the fields; fence; re-sample; a changed sequence means the read
//   overlapped a write, retry
// - Retries are bounded. Past the ceiling the reader falls back to an
//   interrupt-masked read and the fallback is counted, because reaching it
//   means the producer was interrupted mid-update far longer than expected

use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::arch;
use crate::irq::{InterruptControl, IrqGuard};

pub const MAX_READ_RETRIES: u32 = 256;

#[derive(Debug)]
pub struct SeqCount {
    sequence: AtomicU32,
}

/// How a consistent read was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPath {
    Optimistic { retries: u32 },
    Fallback,
}

impl SeqCount {
    pub const fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    #[inline]
    pub fn write_begin(&self) {
        let seq = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
    }

    #[inline]
    pub fn write_end(&self) {
        let seq = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(1), Ordering::Release);
    }

    /// `None` while a write is in progress.
    #[inline]
    pub fn read_begin(&self) -> Option<u32> {
        let seq = self.sequence.load(Ordering::Acquire);
        if seq & 1 != 0 {
            None
        } else {
            Some(seq)
        }
    }

    #[inline]
    pub fn read_validate(&self, start: u32) -> bool {
        fence(Ordering::Acquire);
        self.sequence.load(Ordering::Relaxed) == start
    }

    /// Bounded optimistic read. `Err(())` after `max_retries` failed
    /// attempts; the caller decides how to fall back.
    pub fn try_read<T>(&self, max_retries: u32, mut read: impl FnMut() -> T) -> Result<(T, u32), ()> {
        let mut retries = 0;
        loop {
            if let Some(start) = self.read_begin() {
                let value = read();
                if self.read_validate(start) {
                    return Ok((value, retries));
                }
            }

            retries += 1;
            if retries > max_retries {
                return Err(());
            }
            arch::relax();
        }
    }

    /// Optimistic read with the interrupt-masked escape hatch.
    pub fn read<T, I>(&self, irq: &I, read: impl FnMut() -> T) -> (T, ReadPath)
    where
        I: InterruptControl + ?Sized,
    {
        let mut read = read;
        match self.try_read(MAX_READ_RETRIES, &mut read) {
            Ok((value, retries)) => (value, ReadPath::Optimistic { retries }),
            Err(()) => {
                let _guard = IrqGuard::new(irq);
                (read(), ReadPath::Fallback)
            }
        }
    }
}

impl Default for SeqCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::SimulatedInterrupts;
    use core::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn odd_sequence_forces_retry() {
        let seq = SeqCount::new();
        seq.write_begin();
        assert!(seq.read_begin().is_none());
        assert!(seq.try_read(4, || 7).is_err());
        seq.write_end();
        assert_eq!(seq.try_read(4, || 7), Ok((7, 0)));
    }

    #[test]
    fn overlapping_write_invalidates_read() {
        let seq = SeqCount::new();
        let start = seq.read_begin().unwrap();
        seq.write_begin();
        seq.write_end();
        assert!(!seq.read_validate(start));
    }

    #[test]
    fn stuck_writer_takes_fallback_path() {
        let seq = SeqCount::new();
        let irq = SimulatedInterrupts::new();
        seq.write_begin();
        let (value, path) = seq.read(&irq, || 3);
        assert_eq!(value, 3);
        assert_eq!(path, ReadPath::Fallback);
        assert!(irq.are_enabled());
        assert_eq!(irq.masked_sections(), 1);
    }

    #[test]
    fn concurrent_reader_never_sees_torn_pair() {
        let seq = Arc::new(SeqCount::new());
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));

        let writer = {
            let (seq, a, b) = (seq.clone(), a.clone(), b.clone());
            thread::spawn(move || {
                for i in 1..=50_000u64 {
                    seq.write_begin();
                    a.store(i, Ordering::Relaxed);
                    b.store(i * 2, Ordering::Relaxed);
                    seq.write_end();
                }
            })
        };

        let sample = || (a.load(Ordering::Relaxed), b.load(Ordering::Relaxed));
        while !writer.is_finished() {
            if let Ok(((x, y), _)) = seq.try_read(MAX_READ_RETRIES, sample) {
                assert_eq!(y, x * 2);
            }
        }
        writer.join().unwrap();

        let ((x, y), retries) = seq.try_read(0, sample).unwrap();
        assert_eq!((x, y, retries), (50_000, 100_000, 0));
    }
}
