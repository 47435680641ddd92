// netcore: Packet TX/RX Concurrency Core
//
// The part of a network-interface driver that sits between the interrupt
// handlers and the protocol stack on a single-core, non-preemptive system.
// Interrupt handlers do the minimum (record a completion, stage a frame,
// park a release) and the mainline bottom half does everything that may
// take unbounded time.
//
// Key responsibilities:
// - TX completion ring from the interrupt producer to the bottom half
// - Sequence-counter snapshots for a watchdog running in a third context
// - Deferred release of resources that must not be freed in an interrupt
// - RX staging, promotion to auxiliary memory and protocol dispatch
// - Four-level priority transmit queues with flow-control hysteresis
// - Stuck-transfer detection and overflow recovery
//
// Design and implementation:
// - `no_std` plus `alloc`; every buffer is sized at attach time
// - Each ring has exactly one producer role and one consumer role,
//   enforced at runtime by claim flags
// - Hardware, mapping, dispatch and auxiliary memory are traits in `hal`
//   and `auxmem`; the core only moves the handles they hand out
// - Interrupt masking goes through `irq::InterruptControl` so the same
//   code runs on bare metal and in hosted tests
//
// Public interface:
// - `PacketCore` interrupt entry points (`on_interrupt_*`, `watchdog_scan`)
// - `Driver` mainline operations (`run_deferred_work`, `submit_tx`,
//   `flush_tx`, `poll_receive`, `stats`, `detach`)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod auxmem;
pub mod completion;
pub mod config;
pub mod deferred;
pub mod driver;
pub mod error;
pub mod hal;
pub mod irq;
pub mod log;
pub mod ring;
pub mod rx;
pub mod seqlock;
pub mod staging;
pub mod tick;
pub mod txq;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use auxmem::{AuxPool, AuxSlot, AuxiliaryMemory};
pub use config::CoreConfig;
pub use driver::{CoreStats, DetachReport, Driver, FlushReport, PacketCore, WorkReport};
pub use error::{
    AttachError, AuxError, ConfigError, DeferredError, DispatchError, Dropped, HwError, MapError, SendError,
};
pub use hal::{
    DescriptorIndex, InterfaceId, MappingSubsystem, NicOps, OrphanedDescriptor, ProtocolDispatch, ReceivedFrame,
};
pub use irq::{CpuInterrupts, InterruptControl, IrqGuard, SimulatedInterrupts};
pub use tick::{Tick, TickCounter, TickSource};
pub use txq::{Priority, QueueStats};
