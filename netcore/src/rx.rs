// RX Staging-to-Dispatch Pipeline
//
// Frame lifecycle: Captured -> {Promoted | Conventional} -> Dispatched -> Freed
//
// Interrupt half (`RxPipeline`):
// - Take a staging buffer, bounds-check, copy, queue the buffer id on the
//   dispatch ring. Every failure is a counted drop with the buffer returned
//
// Mainline half (`RxDispatcher`):
// - Frames at or above the promotion threshold move to auxiliary memory and
//   are read back into a scratch buffer for dispatch
// - Smaller frames are copied into a working buffer
// - Either way the staging buffer is freed before the protocol handler
//   runs, so a slow handler never starves the interrupt of buffers
// - If neither path has room the frame is dispatched straight from staging;
//   nothing is lost, the fallback is counted
// - Draining is time-boxed in ticks and yields once the budget is spent

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::auxmem::AuxiliaryMemory;
use crate::config::CoreConfig;
use crate::error::{ConfigResult, DispatchError};
use crate::hal::{InterfaceId, ProtocolDispatch};
use crate::irq::InterruptControl;
use crate::log_debug;
use crate::ring::SpscRing;
use crate::staging::{StagingId, StagingPool};
use crate::tick::{ticks_between, TickSource};

const LOG_ORIGIN: &str = "rx";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxCaptureStats {
    pub captured: u32,
    pub staging_exhausted: u32,
    pub oversize: u32,
    pub ring_full: u32,
}

pub struct RxPipeline {
    staging: StagingPool,
    ring: SpscRing<StagingId>,
    captured: AtomicU32,
    oversize: AtomicU32,
    ring_full: AtomicU32,
}

impl RxPipeline {
    pub fn new(config: &CoreConfig) -> ConfigResult<Self> {
        Ok(Self {
            staging: StagingPool::new(config.staging_buffers, config.staging_buffer_size)?,
            ring: SpscRing::new("rx dispatch ring", config.rx_dispatch_capacity)?,
            captured: AtomicU32::new(0),
            oversize: AtomicU32::new(0),
            ring_full: AtomicU32::new(0),
        })
    }

    pub fn staging(&self) -> &StagingPool {
        &self.staging
    }

    /// Frames captured but not yet dispatched.
    pub fn backlog(&self) -> usize {
        self.ring.len()
    }

    pub fn stats(&self) -> RxCaptureStats {
        RxCaptureStats {
            captured: self.captured.load(Ordering::Relaxed),
            staging_exhausted: self.staging.exhausted(),
            oversize: self.oversize.load(Ordering::Relaxed),
            ring_full: self.ring_full.load(Ordering::Relaxed),
        }
    }

    /// Interrupt context. Returns whether the frame was queued.
    pub fn capture<I: InterruptControl + ?Sized>(&self, irq: &I, frame: &[u8], source: InterfaceId) -> bool {
        let Some(id) = self.staging.alloc(irq) else {
            return false;
        };

        if self.staging.fill(&id, frame, source).is_err() {
            self.oversize.fetch_add(1, Ordering::Relaxed);
            self.staging.free(irq, id);
            return false;
        }

        if let Err(id) = self.ring.push(id) {
            self.ring_full.fetch_add(1, Ordering::Relaxed);
            self.staging.free(irq, id);
            return false;
        }

        self.captured.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Counts a frame dropped for length before it reached capture.
    pub(crate) fn reject_oversize(&self) {
        self.oversize.fetch_add(1, Ordering::Relaxed);
    }

    fn next(&self) -> Option<StagingId> {
        self.ring.pop()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxDispatchStats {
    pub dispatched: u32,
    pub promoted: u32,
    pub aux_alloc_failures: u32,
    pub aux_copy_failures: u32,
    pub aux_read_failures: u32,
    pub working_fallbacks: u32,
    pub dispatch_errors: u32,
    pub budget_yields: u32,
    pub discarded: u32,
}

/// Result of one drain call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxDrain {
    pub dispatched: usize,
    pub yielded: bool,
}

pub struct RxDispatcher<A: AuxiliaryMemory> {
    aux: A,
    working: Vec<Box<[u8]>>,
    scratch: Box<[u8]>,
    promotion_threshold: usize,
    budget_ticks: u32,
    stats: RxDispatchStats,
}

impl<A: AuxiliaryMemory> RxDispatcher<A> {
    pub fn new(config: &CoreConfig, aux: A) -> Self {
        let working = (0..config.working_buffers)
            .map(|_| vec![0u8; config.promotion_threshold].into_boxed_slice())
            .collect();

        Self {
            aux,
            working,
            scratch: vec![0u8; config.staging_buffer_size].into_boxed_slice(),
            promotion_threshold: config.promotion_threshold,
            budget_ticks: config.rx_budget_ticks,
            stats: RxDispatchStats::default(),
        }
    }

    pub fn stats(&self) -> RxDispatchStats {
        self.stats
    }

    pub fn aux(&self) -> &A {
        &self.aux
    }

    /// Dispatch queued frames until the ring is empty or the tick budget
    /// is spent.
    pub fn drain<I, C, D>(&mut self, pipeline: &RxPipeline, irq: &I, clock: &C, dispatch: &mut D) -> RxDrain
    where
        I: InterruptControl + ?Sized,
        C: TickSource + ?Sized,
        D: ProtocolDispatch + ?Sized,
    {
        let start = clock.now();
        let mut report = RxDrain::default();

        loop {
            if ticks_between(start, clock.now(), clock.modulus()) > self.budget_ticks {
                report.yielded = !pipeline.ring.is_empty();
                if report.yielded {
                    self.stats.budget_yields += 1;
                    log_debug!(LOG_ORIGIN, "budget spent, {} frames left", pipeline.backlog());
                }
                break;
            }

            let Some(id) = pipeline.next() else {
                break;
            };
            self.process(pipeline, irq, dispatch, id);
            report.dispatched += 1;
        }

        report
    }

    /// Drop everything still queued. Used on detach.
    pub fn discard_backlog<I: InterruptControl + ?Sized>(&mut self, pipeline: &RxPipeline, irq: &I) -> usize {
        let mut discarded = 0;
        while let Some(id) = pipeline.next() {
            pipeline.staging.free(irq, id);
            discarded += 1;
        }
        self.stats.discarded += discarded as u32;
        discarded
    }

    fn process<I, D>(&mut self, pipeline: &RxPipeline, irq: &I, dispatch: &mut D, id: StagingId)
    where
        I: InterruptControl + ?Sized,
        D: ProtocolDispatch + ?Sized,
    {
        let (len, source) = pipeline.staging.with_buffer(&id, |buf| (buf.len(), buf.source_interface()));

        if len >= self.promotion_threshold {
            self.promote(pipeline, irq, dispatch, id, len, source);
        } else {
            self.conventional(pipeline, irq, dispatch, id, len, source);
        }
    }

    fn promote<I, D>(
        &mut self,
        pipeline: &RxPipeline,
        irq: &I,
        dispatch: &mut D,
        id: StagingId,
        len: usize,
        source: InterfaceId,
    ) where
        I: InterruptControl + ?Sized,
        D: ProtocolDispatch + ?Sized,
    {
        let slot = match self.aux.alloc(len) {
            Ok(slot) => slot,
            Err(_) => {
                self.stats.aux_alloc_failures += 1;
                return self.from_staging(pipeline, irq, dispatch, id, source);
            }
        };

        let aux = &mut self.aux;
        if pipeline
            .staging
            .with_buffer(&id, |buf| aux.copy_in(&slot, buf.frame()))
            .is_err()
        {
            self.aux.free(slot);
            self.stats.aux_copy_failures += 1;
            return self.from_staging(pipeline, irq, dispatch, id, source);
        }

        pipeline.staging.free(irq, id);
        self.stats.promoted += 1;

        match self.aux.copy_out(&slot, &mut self.scratch) {
            Ok(n) => {
                let result = dispatch.dispatch(&self.scratch[..n], source);
                self.record(result);
            }
            Err(err) => {
                self.stats.aux_read_failures += 1;
                log_debug!(LOG_ORIGIN, "promoted frame lost on read back: {}", err);
            }
        }
        self.aux.free(slot);
    }

    fn conventional<I, D>(
        &mut self,
        pipeline: &RxPipeline,
        irq: &I,
        dispatch: &mut D,
        id: StagingId,
        len: usize,
        source: InterfaceId,
    ) where
        I: InterruptControl + ?Sized,
        D: ProtocolDispatch + ?Sized,
    {
        let Some(mut buf) = self.working.pop() else {
            self.stats.working_fallbacks += 1;
            return self.from_staging(pipeline, irq, dispatch, id, source);
        };

        pipeline
            .staging
            .with_buffer(&id, |staged| buf[..len].copy_from_slice(staged.frame()));
        pipeline.staging.free(irq, id);

        let result = dispatch.dispatch(&buf[..len], source);
        self.working.push(buf);
        self.record(result);
    }

    fn from_staging<I, D>(&mut self, pipeline: &RxPipeline, irq: &I, dispatch: &mut D, id: StagingId, source: InterfaceId)
    where
        I: InterruptControl + ?Sized,
        D: ProtocolDispatch + ?Sized,
    {
        let result = pipeline
            .staging
            .with_buffer(&id, |buf| dispatch.dispatch(buf.frame(), source));
        pipeline.staging.free(irq, id);
        self.record(result);
    }

    fn record(&mut self, result: Result<(), DispatchError>) {
        match result {
            Ok(()) => self.stats.dispatched += 1,
            Err(err) => {
                self.stats.dispatch_errors += 1;
                log_debug!(LOG_ORIGIN, "dispatch refused frame: {}", err);
            }
        }
    }
}
