// Interrupt Masking
//
// Scoped critical sections for code shared between interrupt handlers and
// the cooperative mainline.
//
// Key features:
// - `InterruptControl` abstracts the CPU interrupt flag so the core runs on
//   bare metal (`CpuInterrupts`) and hosted (`SimulatedInterrupts`)
// - `IrqGuard` disables interrupts on construction and restores the prior
//   state on drop, on every exit path
// - `without_interrupts` runs a closure inside a guard

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch;

pub trait InterruptControl {
    fn are_enabled(&self) -> bool;
    fn disable(&self);
    fn enable(&self);
}

/// The real CPU interrupt flag. Only usable in ring 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuInterrupts;

impl InterruptControl for CpuInterrupts {
    #[inline(always)]
    fn are_enabled(&self) -> bool {
        arch::interrupts_enabled()
    }

    #[inline(always)]
    fn disable(&self) {
        arch::disable_interrupts();
    }

    #[inline(always)]
    fn enable(&self) {
        arch::enable_interrupts();
    }
}

/// Software interrupt flag for hosted builds and tests.
#[derive(Debug)]
pub struct SimulatedInterrupts {
    enabled: AtomicBool,
    masked_sections: AtomicU32,
}

impl SimulatedInterrupts {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            masked_sections: AtomicU32::new(0),
        }
    }

    /// Number of times interrupts went from enabled to disabled.
    pub fn masked_sections(&self) -> u32 {
        self.masked_sections.load(Ordering::Relaxed)
    }
}

impl Default for SimulatedInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptControl for SimulatedInterrupts {
    fn are_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            self.masked_sections.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }
}

/// Interrupts stay masked for the lifetime of the guard.
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct IrqGuard<'a, I: InterruptControl + ?Sized> {
    ctl: &'a I,
    was_enabled: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a, I: InterruptControl + ?Sized> IrqGuard<'a, I> {
    #[inline(always)]
    pub fn new(ctl: &'a I) -> Self {
        let was_enabled = ctl.are_enabled();
        ctl.disable();
        Self {
            ctl,
            was_enabled,
            _not_send: PhantomData,
        }
    }

    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl<I: InterruptControl + ?Sized> Drop for IrqGuard<'_, I> {
    #[inline(always)]
    fn drop(&mut self) {
        if self.was_enabled {
            self.ctl.enable();
        }
    }
}

#[inline(always)]
pub fn without_interrupts<I, F, R>(ctl: &I, f: F) -> R
where
    I: InterruptControl + ?Sized,
    F: FnOnce() -> R,
{
    let _guard = IrqGuard::new(ctl);
    f()
}
