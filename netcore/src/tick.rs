// Tick Source
//
// Coarse, wrapping timestamp used for every age calculation in the core.
// The reference hardware timer is the 18.2 Hz PC tick, which wraps once a
// day at 0x1800B0 ticks; durations are always computed modulo that period
// so a scan straddling midnight still measures ages correctly.
//
// Public interface:
// - `TickSource` for the external clock
// - `ticks_between` / `ms_to_ticks` helpers
// - `TickCounter`, a timer-interrupt driven source usable on the target and
//   settable from tests

use core::sync::atomic::{AtomicU32, Ordering};

pub type Tick = u32;

/// PC timer ticks per day (24h at ~18.2065 Hz).
pub const TICKS_PER_DAY: u32 = 0x1800B0;

/// Microseconds per PC timer tick.
pub const TICK_PERIOD_US: u32 = 54_925;

pub trait TickSource {
    fn now(&self) -> Tick;

    /// Wraparound period. Every value returned by `now` is below it.
    fn modulus(&self) -> u32;
}

#[inline]
pub fn ticks_between(start: Tick, now: Tick, modulus: u32) -> u32 {
    let m = modulus as u64;
    ((now as u64 % m + m - start as u64 % m) % m) as u32
}

/// Rounded up so a timeout never fires early.
#[inline]
pub const fn ms_to_ticks(ms: u32) -> u32 {
    let us = ms as u64 * 1000;
    us.div_ceil(TICK_PERIOD_US as u64) as u32
}

/// Tick counter advanced by the timer interrupt.
#[derive(Debug)]
pub struct TickCounter {
    ticks: AtomicU32,
    modulus: u32,
}

impl TickCounter {
    pub const fn new(modulus: u32) -> Self {
        Self {
            ticks: AtomicU32::new(0),
            modulus,
        }
    }

    pub const fn daily() -> Self {
        Self::new(TICKS_PER_DAY)
    }

    /// Timer interrupt hook.
    pub fn on_timer_interrupt(&self) {
        self.advance(1);
    }

    pub fn advance(&self, ticks: u32) {
        let modulus = self.modulus;
        let _ = self
            .ticks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(((t as u64 + ticks as u64) % modulus as u64) as u32)
            });
    }

    pub fn set(&self, tick: Tick) {
        self.ticks.store(tick % self.modulus, Ordering::Release);
    }
}

impl TickSource for TickCounter {
    fn now(&self) -> Tick {
        self.ticks.load(Ordering::Acquire)
    }

    fn modulus(&self) -> u32 {
        self.modulus
    }
}

impl<T: TickSource + ?Sized> TickSource for &T {
    fn now(&self) -> Tick {
        (**self).now()
    }

    fn modulus(&self) -> u32 {
        (**self).modulus()
    }
}
