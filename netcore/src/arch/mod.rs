// Architecture Abstraction Layer
//
// Minimal CPU primitives used by the packet core: reading and toggling the
// interrupt flag, and a relax hint for bounded retry loops.
//
// Design principles:
// - Architecture-specific code is isolated behind `cfg(target_arch)` gates
// - All functions are small and `#[inline(always)]`
// - Unsupported architectures degrade to no-ops; the simulated interrupt
//   controller in `irq` is the intended backend there
//
// Correctness and safety notes:
// - `interrupts_enabled` only reads RFLAGS and is safe at any privilege level
// - `disable_interrupts`/`enable_interrupts` execute `cli`/`sti` and fault
//   outside ring 0; hosted builds must not route through them

#[inline(always)]
pub fn interrupts_enabled() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::instructions::interrupts::are_enabled()
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        true
    }
}

#[inline(always)]
pub fn disable_interrupts() {
    #[cfg(target_arch = "x86_64")]
    x86_64::instructions::interrupts::disable();
}

#[inline(always)]
pub fn enable_interrupts() {
    #[cfg(target_arch = "x86_64")]
    x86_64::instructions::interrupts::enable();
}

#[inline(always)]
pub fn relax() {
    core::hint::spin_loop();
}
