// Stuck-Transfer Watchdog
//
// Periodic, read-mostly scan of the completion ring plus the overflow
// recovery sweeps.
//
// Scan:
// - Takes a consistent (head, tail) snapshot through the sequence counter
// - Flags entries older than the TX timeout; flagged entries are logged
//   when the bottom half releases them
// - Never frees a mapping, never touches hardware state, never blocks the
//   interrupt producer. Safe to call from the timer interrupt
//
// Overflow recovery (mainline, after the ring refused a completion):
// - Sweep (a): completed hardware descriptors that still own a mapping are
//   the completions the ring refused; release them
// - Sweep (b): software ring entries older than the timeout lose their
//   mapping now instead of waiting for the bottom half
// - Both sweeps only ever take a mapping out of the single place that owns
//   it, so running them twice releases nothing twice

use core::sync::atomic::{AtomicU32, Ordering};

use crate::completion::{CompletionRing, RingSnapshot};
use crate::hal::{MappingSubsystem, NicOps};
use crate::irq::InterruptControl;
use crate::seqlock::ReadPath;
use crate::tick::Tick;
use crate::{log_debug, log_info, log_warn};

const LOG_ORIGIN: &str = "wdog";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub snapshot: RingSnapshot,
    pub flagged: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub orphans_released: usize,
    pub stale_released: usize,
    /// The software sweep found the consumer role taken and was skipped;
    /// the overflow flag has been re-armed.
    pub deferred: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogStats {
    pub scans: u32,
    pub recoveries: u32,
    pub orphans_released: u32,
}

pub struct Watchdog {
    timeout_ticks: u32,
    modulus: u32,
    scans: AtomicU32,
    recoveries: AtomicU32,
    orphans_released: AtomicU32,
}

impl Watchdog {
    pub fn new(timeout_ticks: u32, modulus: u32) -> Self {
        Self {
            timeout_ticks,
            modulus,
            scans: AtomicU32::new(0),
            recoveries: AtomicU32::new(0),
            orphans_released: AtomicU32::new(0),
        }
    }

    pub fn timeout_ticks(&self) -> u32 {
        self.timeout_ticks
    }

    pub fn stats(&self) -> WatchdogStats {
        WatchdogStats {
            scans: self.scans.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            orphans_released: self.orphans_released.load(Ordering::Relaxed),
        }
    }

    /// Flags timed-out completions. Does not log.
    pub fn scan<H, I>(&self, ring: &CompletionRing<H>, irq: &I, now: Tick) -> ScanReport
    where
        I: InterruptControl + ?Sized,
    {
        let snapshot = ring.snapshot(irq);
        let flagged = ring.flag_timeouts(&snapshot, now, self.timeout_ticks, self.modulus);
        self.scans.fetch_add(1, Ordering::Relaxed);
        ScanReport { snapshot, flagged }
    }

    /// Mainline logging for a scan taken elsewhere.
    pub fn report(&self, scan: &ScanReport) {
        if scan.flagged > 0 {
            log_warn!(
                LOG_ORIGIN,
                "{} transfers exceeded {} ticks",
                scan.flagged,
                self.timeout_ticks
            );
        }
        if scan.snapshot.path == ReadPath::Fallback {
            log_debug!(
                LOG_ORIGIN,
                "snapshot needed masked fallback at sequence {}",
                scan.snapshot.sequence
            );
        }
    }

    /// Runs both recovery sweeps. Mainline only.
    pub fn recover_overflow<N, M>(
        &self,
        ring: &CompletionRing<M::Handle>,
        nic: &mut N,
        mapper: &mut M,
        now: Tick,
    ) -> RecoveryReport
    where
        N: NicOps<Mapping = M::Handle> + ?Sized,
        M: MappingSubsystem + ?Sized,
    {
        let mut report = RecoveryReport::default();

        while let Some(orphan) = nic.reclaim_completed() {
            log_debug!(
                LOG_ORIGIN,
                "reclaiming orphaned mapping if={} desc={}",
                orphan.interface,
                orphan.descriptor
            );
            mapper.unmap(orphan.mapping);
            report.orphans_released += 1;
        }

        match ring.recover_stale(mapper, now, self.timeout_ticks, self.modulus) {
            Some(released) => report.stale_released = released,
            None => {
                ring.rearm_overflow();
                report.deferred = true;
            }
        }

        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.orphans_released
            .fetch_add(report.orphans_released as u32, Ordering::Relaxed);
        log_info!(
            LOG_ORIGIN,
            "overflow recovery: {} orphaned, {} stale mappings released",
            report.orphans_released,
            report.stale_released
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::OrphanedDescriptor;
    use crate::irq::SimulatedInterrupts;
    use crate::testing::{Handle, MockNic, RecordingMapper};
    use crate::tick::TICKS_PER_DAY;

    #[test]
    fn scan_boundary_across_midnight() {
        let ring = CompletionRing::new(8).unwrap();
        let irq = SimulatedInterrupts::new();
        let watchdog = Watchdog::new(92, TICKS_PER_DAY);
        let start = TICKS_PER_DAY - 40;
        ring.try_enqueue(0, 0, Handle(0), start).unwrap();

        // start + 92 wraps to 52.
        assert_eq!(watchdog.scan(&ring, &irq, 52).flagged, 0);
        assert_eq!(watchdog.scan(&ring, &irq, 53).flagged, 1);
        assert_eq!(watchdog.stats().scans, 2);
    }

    #[test]
    fn scan_never_releases_mappings() {
        let ring = CompletionRing::new(8).unwrap();
        let irq = SimulatedInterrupts::new();
        let watchdog = Watchdog::new(10, TICKS_PER_DAY);
        let mut mapper = RecordingMapper::default();
        ring.try_enqueue(0, 0, Handle(5), 0).unwrap();

        watchdog.scan(&ring, &irq, 1000);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.drain(&mut mapper, 16), 1);
        assert_eq!(mapper.unmapped, vec![5]);
        assert_eq!(ring.stats().timed_out_released, 1);
    }

    #[test]
    fn recovery_releases_orphans_and_stale_entries_once() {
        let ring = CompletionRing::new(2).unwrap();
        let watchdog = Watchdog::new(92, TICKS_PER_DAY);
        let mut mapper = RecordingMapper::default();
        let mut nic = MockNic::default();

        ring.try_enqueue(0, 0, Handle(1), 0).unwrap();
        ring.try_enqueue(0, 1, Handle(2), 0).unwrap();
        let refused = ring.try_enqueue(0, 2, Handle(3), 0).unwrap_err();
        nic.orphans.push_back(OrphanedDescriptor {
            interface: 0,
            descriptor: 2,
            mapping: refused,
        });

        assert!(ring.take_overflow());
        let first = watchdog.recover_overflow(&ring, &mut nic, &mut mapper, 200);
        assert_eq!((first.orphans_released, first.stale_released), (1, 2));

        let second = watchdog.recover_overflow(&ring, &mut nic, &mut mapper, 200);
        assert_eq!((second.orphans_released, second.stale_released), (0, 0));

        ring.drain(&mut mapper, 16);
        let mut released = mapper.unmapped.clone();
        released.sort_unstable();
        assert_eq!(released, vec![1, 2, 3]);
    }
}
