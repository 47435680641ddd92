// Packet Core and Driver Front-End
//
// `PacketCore` is the state shared between interrupt handlers and the
// mainline. It is built once, lives as long as the adapter, and is only
// ever reached through `&self`.
//
// `Driver` is the mainline half. It borrows the core and owns the
// collaborators that may block or take unbounded time: the mapping
// subsystem, the hardware operations, protocol dispatch, auxiliary memory
// and the priority transmit queues.
//
// Key responsibilities:
// - Interrupt entry points: TX complete, RX frame, deferred release,
//   watchdog scan. Bounded, non-blocking, silent
// - Deferred work: overflow recovery, completion drain, deferred releases,
//   RX dispatch, all under per-call bounds
// - Transmit path: submit with admission control, flush to hardware
// - Lifecycle: one driver per core; detach performs an emergency drain so
//   every mapping and buffer is released before the collaborators drop
//
// Safety:
// - Interrupt entry points refuse work while no driver is attached; a
//   refused TX completion hands its mapping back to the descriptor owner
// - The stats snapshot is taken with interrupts masked so counters from
//   different rings describe the same instant

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::auxmem::AuxiliaryMemory;
use crate::completion::{CompletionRing, CompletionStats};
use crate::config::CoreConfig;
use crate::deferred::{DeferredReleaseQueue, DeferredStats};
use crate::error::{AttachError, ConfigResult, DeferredError, Dropped};
use crate::hal::{DescriptorIndex, InterfaceId, MappingSubsystem, NicOps, ProtocolDispatch};
use crate::irq::{InterruptControl, IrqGuard};
use crate::rx::{RxCaptureStats, RxDispatchStats, RxDispatcher, RxDrain, RxPipeline};
use crate::tick::TickSource;
use crate::txq::{HealthReport, Priority, QueueStats, TxQueues};
use crate::watchdog::{RecoveryReport, ScanReport, Watchdog, WatchdogStats};
use crate::{log_debug, log_info, log_warn};

const LOG_ORIGIN: &str = "netcore";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStats {
    pub completion: CompletionStats,
    pub deferred: DeferredStats,
    pub rx_capture: RxCaptureStats,
    pub rx_dispatch: RxDispatchStats,
    pub watchdog: WatchdogStats,
    pub staging_invalid_frees: u32,
    pub refused_detached: u32,
}

/// What one `run_deferred_work` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkReport {
    pub recovery: Option<RecoveryReport>,
    pub completions: usize,
    /// Entries still queued after the batch limit was reached.
    pub completions_left: bool,
    pub releases: usize,
    pub rx: RxDrain,
}

impl WorkReport {
    /// Whether anything was left for a later call.
    pub fn more_pending(&self) -> bool {
        self.completions_left || self.rx.yielded || self.recovery.is_some_and(|r| r.deferred)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub send_failures: usize,
    pub map_failures: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetachReport {
    pub completions: usize,
    pub orphans: usize,
    pub releases: usize,
    /// Why parked releases could not run. They stay queued and are
    /// performed by the next attached driver's deferred work.
    pub deferred_error: Option<DeferredError>,
    pub releases_left: usize,
    pub rx_discarded: usize,
    pub tx_discarded: usize,
}

pub struct PacketCore<M: MappingSubsystem, C: TickSource, I: InterruptControl> {
    config: CoreConfig,
    clock: C,
    irq: I,
    completions: CompletionRing<M::Handle>,
    deferred: DeferredReleaseQueue<M::Region>,
    rx: RxPipeline,
    watchdog: Watchdog,
    attached: AtomicBool,
    refused_detached: AtomicU32,
}

impl<M: MappingSubsystem, C: TickSource, I: InterruptControl> PacketCore<M, C, I> {
    pub fn new(mut config: CoreConfig, clock: C, irq: I) -> ConfigResult<Self> {
        // The clock is authoritative for the wrap period.
        config.tick_modulus = clock.modulus();
        config.validate()?;

        Ok(Self {
            completions: CompletionRing::new(config.completion_capacity)?,
            deferred: DeferredReleaseQueue::new(config.deferred_release_capacity)?,
            rx: RxPipeline::new(&config)?,
            watchdog: Watchdog::new(config.tx_timeout_ticks, clock.modulus()),
            attached: AtomicBool::new(false),
            refused_detached: AtomicU32::new(0),
            config,
            clock,
            irq,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn interrupts(&self) -> &I {
        &self.irq
    }

    pub fn completions(&self) -> &CompletionRing<M::Handle> {
        &self.completions
    }

    pub fn rx(&self) -> &RxPipeline {
        &self.rx
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    fn refuse_detached(&self) -> bool {
        if self.is_attached() {
            return false;
        }
        self.refused_detached.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// TX-complete interrupt. On `Err` the mapping must go back into the
    /// descriptor it came from; overflow recovery reclaims it from there.
    pub fn on_interrupt_tx_complete(
        &self,
        interface: InterfaceId,
        descriptor: DescriptorIndex,
        mapping: M::Handle,
    ) -> Result<(), M::Handle> {
        if self.refuse_detached() {
            return Err(mapping);
        }
        self.completions
            .try_enqueue(interface, descriptor, mapping, self.clock.now())
    }

    /// RX interrupt. Returns whether the frame was queued for dispatch.
    pub fn on_interrupt_rx_frame(&self, frame: &[u8], interface: InterfaceId) -> bool {
        if self.refuse_detached() {
            return false;
        }
        self.rx.capture(&self.irq, frame, interface)
    }

    /// Park a region release that must not run in interrupt context. A
    /// full queue, or no attached driver, hands the region back.
    pub fn on_interrupt_release(&self, region: M::Region) -> Result<(), M::Region> {
        if self.refuse_detached() {
            return Err(region);
        }
        self.deferred.queue_deferred(&self.irq, region)
    }

    /// Timer-driven stuck-transfer scan. Does not log.
    pub fn watchdog_scan(&self) -> ScanReport {
        self.watchdog
            .scan(&self.completions, &self.irq, self.clock.now())
    }

    /// Interrupt-side counters. `Driver::stats` adds the mainline ones.
    fn shared_stats(&self) -> CoreStats {
        CoreStats {
            completion: self.completions.stats(),
            deferred: self.deferred.stats(),
            rx_capture: self.rx.stats(),
            watchdog: self.watchdog.stats(),
            staging_invalid_frees: self.rx.staging().invalid_frees(),
            refused_detached: self.refused_detached.load(Ordering::Relaxed),
            ..CoreStats::default()
        }
    }
}

pub struct Driver<'a, M, N, D, A, C, I>
where
    M: MappingSubsystem,
    N: NicOps<Mapping = M::Handle>,
    D: ProtocolDispatch,
    A: AuxiliaryMemory,
    C: TickSource,
    I: InterruptControl,
{
    core: &'a PacketCore<M, C, I>,
    mapper: M,
    nic: N,
    dispatch: D,
    rx: RxDispatcher<A>,
    txq: TxQueues,
    poll_buf: Box<[u8]>,
}

impl<'a, M, N, D, A, C, I> Driver<'a, M, N, D, A, C, I>
where
    M: MappingSubsystem,
    N: NicOps<Mapping = M::Handle>,
    D: ProtocolDispatch,
    A: AuxiliaryMemory,
    C: TickSource,
    I: InterruptControl,
{
    pub fn attach(
        core: &'a PacketCore<M, C, I>,
        mapper: M,
        nic: N,
        dispatch: D,
        aux: A,
    ) -> Result<Self, AttachError> {
        if core.attached.swap(true, Ordering::AcqRel) {
            return Err(AttachError::AlreadyAttached);
        }

        let config = &core.config;
        log_info!(
            LOG_ORIGIN,
            "attached: {} completion slots, {} staging buffers, timeout {} ticks",
            config.completion_capacity,
            config.staging_buffers,
            config.tx_timeout_ticks
        );

        Ok(Self {
            core,
            mapper,
            nic,
            dispatch,
            rx: RxDispatcher::new(config, aux),
            txq: TxQueues::new(config),
            poll_buf: vec![0u8; config.staging_buffer_size].into_boxed_slice(),
        })
    }

    pub fn core(&self) -> &'a PacketCore<M, C, I> {
        self.core
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    pub fn nic(&self) -> &N {
        &self.nic
    }

    pub fn nic_mut(&mut self) -> &mut N {
        &mut self.nic
    }

    pub fn dispatch(&self) -> &D {
        &self.dispatch
    }

    pub fn tx_queues(&self) -> &TxQueues {
        &self.txq
    }

    /// Bottom half. Every step is bounded: one completion batch, the
    /// deferred ring (fixed capacity), and the RX tick budget.
    pub fn run_deferred_work(&mut self) -> WorkReport {
        let core = self.core;
        let mut report = WorkReport::default();

        if core.completions.take_overflow() {
            report.recovery = Some(self.recover_overflow());
        }

        report.completions = core
            .completions
            .drain(&mut self.mapper, core.config.completion_batch);
        report.completions_left = core.completions.has_pending();

        let mapper = &mut self.mapper;
        match core
            .deferred
            .process_deferred(&core.irq, |region| mapper.release_region(region))
        {
            Ok(released) => report.releases = released,
            Err(err) => log_debug!(LOG_ORIGIN, "deferred releases postponed: {}", err),
        }

        report.rx = self
            .rx
            .drain(&core.rx, &core.irq, &core.clock, &mut self.dispatch);

        report
    }

    fn recover_overflow(&mut self) -> RecoveryReport {
        let core = self.core;
        log_warn!(
            LOG_ORIGIN,
            "completion ring overflowed ({} total), recovering",
            core.completions.stats().overflowed
        );
        core.watchdog.recover_overflow(
            &core.completions,
            &mut self.nic,
            &mut self.mapper,
            core.clock.now(),
        )
    }

    /// Watchdog scan from the mainline, with its findings logged.
    pub fn watchdog(&self) -> ScanReport {
        let scan = self.core.watchdog_scan();
        self.core.watchdog.report(&scan);
        scan
    }

    pub fn submit_tx(&mut self, frame: &[u8], priority: Priority) -> Result<(), Dropped> {
        let now = self.core.clock.now();
        self.txq.check_health(now);
        self.txq.submit(frame, priority, now)
    }

    /// Hand up to `max` queued frames to the hardware, highest priority
    /// first. Every dequeued frame is consumed whether or not it was sent.
    pub fn flush_tx(&mut self, max: usize) -> FlushReport {
        let mut report = FlushReport::default();

        for _ in 0..max {
            let Some(frame) = self.txq.dequeue(self.core.clock.now()) else {
                break;
            };

            let mapping = match self.mapper.map_for_transfer(frame.data()) {
                Ok(mapping) => mapping,
                Err(err) => {
                    log_warn!(LOG_ORIGIN, "cannot map {} byte frame: {}", frame.len(), err);
                    report.map_failures += 1;
                    continue;
                }
            };

            match self.nic.send(frame.data(), mapping) {
                Ok(()) => report.sent += 1,
                Err(err) => {
                    log_warn!(LOG_ORIGIN, "send failed: {}", err.kind);
                    self.mapper.unmap(err.mapping);
                    report.send_failures += 1;
                }
            }
        }

        if report.sent > 0 {
            log_debug!(LOG_ORIGIN, "flushed {} frames", report.sent);
        }
        report
    }

    /// Flush with the configured per-call limit.
    pub fn flush_tx_default(&mut self) -> FlushReport {
        self.flush_tx(self.core.config.tx_flush_limit)
    }

    /// Pull up to `limit` frames from the adapter through the capture path.
    /// For interfaces without a receive interrupt. Frames longer than a
    /// staging buffer are dropped and counted as oversize.
    pub fn poll_receive(&mut self, limit: usize) -> usize {
        let core = self.core;
        let mut queued = 0;

        for _ in 0..limit {
            let Some(received) = self.nic.receive(&mut self.poll_buf) else {
                break;
            };
            if received.len > self.poll_buf.len() {
                core.rx.reject_oversize();
                log_debug!(
                    LOG_ORIGIN,
                    "dropped {} byte frame from if={}",
                    received.len,
                    received.interface
                );
                continue;
            }
            if core
                .rx
                .capture(&core.irq, &self.poll_buf[..received.len], received.interface)
            {
                queued += 1;
            }
        }
        queued
    }

    pub fn check_queue_health(&mut self) -> Option<HealthReport> {
        self.txq.check_health(self.core.clock.now())
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.txq.stats()
    }

    pub fn stats(&self) -> CoreStats {
        let _guard = IrqGuard::new(&self.core.irq);
        CoreStats {
            rx_dispatch: self.rx.stats(),
            ..self.core.shared_stats()
        }
    }

    /// Stop accepting interrupt work and release everything still held.
    pub fn detach(mut self) -> DetachReport {
        let core = self.core;
        core.attached.store(false, Ordering::Release);

        let mut report = DetachReport::default();
        let capacity = core.completions.capacity();
        loop {
            let drained = core.completions.drain(&mut self.mapper, capacity);
            report.completions += drained;
            if drained == 0 {
                break;
            }
        }

        while let Some(orphan) = self.nic.reclaim_completed() {
            self.mapper.unmap(orphan.mapping);
            report.orphans += 1;
        }
        core.completions.take_overflow();

        let mapper = &mut self.mapper;
        match core
            .deferred
            .process_deferred(&core.irq, |region| mapper.release_region(region))
        {
            Ok(released) => report.releases = released,
            Err(err) => {
                report.deferred_error = Some(err);
                report.releases_left = core.deferred.len(&core.irq);
                log_warn!(
                    LOG_ORIGIN,
                    "{} deferred releases left queued: {}",
                    report.releases_left,
                    err
                );
            }
        }

        report.rx_discarded = self.rx.discard_backlog(&core.rx, &core.irq);
        log_warn!(LOG_ORIGIN, "emergency draining transmit queues");
        report.tx_discarded = self.txq.emergency_drain();

        log_info!(
            LOG_ORIGIN,
            "detached: {} completions, {} orphans, {} releases, {} rx and {} tx frames dropped",
            report.completions,
            report.orphans,
            report.releases,
            report.rx_discarded,
            report.tx_discarded
        );
        report
    }
}

impl<M, N, D, A, C, I> Drop for Driver<'_, M, N, D, A, C, I>
where
    M: MappingSubsystem,
    N: NicOps<Mapping = M::Handle>,
    D: ProtocolDispatch,
    A: AuxiliaryMemory,
    C: TickSource,
    I: InterruptControl,
{
    fn drop(&mut self) {
        // Without a driver nothing would ever drain what interrupts queue.
        self.core.attached.store(false, Ordering::Release);
    }
}
