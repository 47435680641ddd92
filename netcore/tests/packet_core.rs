mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use common::{init_logging, Adapter, Mapper, Mapping, Stack};
use netcore::config::CoreConfig;
use netcore::tick::TICKS_PER_DAY;
use netcore::{
    AuxPool, Driver, OrphanedDescriptor, PacketCore, Priority, SimulatedInterrupts, TickCounter, TickSource,
};

type Core = PacketCore<Mapper, TickCounter, SimulatedInterrupts>;

fn core_with(config: CoreConfig) -> Core {
    PacketCore::new(config, TickCounter::daily(), SimulatedInterrupts::new()).unwrap()
}

fn attach<'a>(core: &'a Core, adapter: Adapter) -> Driver<'a, Mapper, Adapter, Stack, AuxPool, TickCounter, SimulatedInterrupts> {
    let aux = AuxPool::from_config(core.config());
    Driver::attach(core, Mapper::default(), adapter, Stack::default(), aux).unwrap()
}

#[test]
fn completion_ring_holds_exactly_its_capacity() {
    init_logging();
    let core = core_with(CoreConfig::default());
    let _driver = attach(&core, Adapter::default());

    for i in 0..128u16 {
        assert!(core.on_interrupt_tx_complete(0, i, Mapping(i as u32)).is_ok());
    }
    let refused = core.on_interrupt_tx_complete(0, 128, Mapping(128));
    assert_eq!(refused, Err(Mapping(128)));

    let stats = core.completions().stats();
    assert_eq!(stats.overflowed, 1);
    assert_eq!(stats.completed, 128);
    assert_eq!(core.completions().len(), 128);
}

#[test]
fn refused_completion_is_recovered_from_its_descriptor() {
    init_logging();
    let core = core_with(CoreConfig::default());
    let adapter = Adapter::default();
    let descriptors = adapter.descriptors.clone();
    let mut driver = attach(&core, adapter);

    for i in 0..128u16 {
        core.on_interrupt_tx_complete(0, i, Mapping(i as u32)).unwrap();
    }
    let mapping = core.on_interrupt_tx_complete(1, 5, Mapping(999)).unwrap_err();
    descriptors.lock().unwrap().push_back(OrphanedDescriptor {
        interface: 1,
        descriptor: 5,
        mapping,
    });

    let first = driver.run_deferred_work();
    let recovery = first.recovery.expect("overflow triggers recovery");
    assert_eq!(recovery.orphans_released, 1);
    assert_eq!(first.completions, 16);

    while driver.run_deferred_work().completions > 0 {}

    let unmapped: HashSet<u32> = driver.mapper().unmapped.iter().copied().collect();
    assert_eq!(unmapped.len(), 129);
    assert_eq!(driver.mapper().unmapped.len(), 129);
    assert!(unmapped.contains(&999));
}

#[test]
fn every_mapping_released_once_under_concurrent_interrupts() {
    init_logging();
    const TRANSFERS: u32 = 20_000;

    let core = core_with(CoreConfig::default());
    let adapter = Adapter::default();
    let descriptors = adapter.descriptors.clone();
    let mut driver = attach(&core, adapter);
    let producer_done = AtomicBool::new(false);
    let stop_watchdog = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..TRANSFERS {
                // Holding the descriptor lock makes refuse-and-park atomic, as
                // it is inside a real interrupt handler.
                let mut parked = descriptors.lock().unwrap();
                if let Err(mapping) = core.on_interrupt_tx_complete(0, (i % 128) as u16, Mapping(i)) {
                    parked.push_back(OrphanedDescriptor {
                        interface: 0,
                        descriptor: (i % 128) as u16,
                        mapping,
                    });
                }
                drop(parked);
                if i % 64 == 0 {
                    core.clock().on_timer_interrupt();
                }
            }
            producer_done.store(true, Ordering::Release);
        });

        s.spawn(|| {
            while !stop_watchdog.load(Ordering::Acquire) {
                let scan = core.watchdog_scan();
                assert!(scan.snapshot.occupancy() <= 128);
                thread::yield_now();
            }
        });

        loop {
            let done = producer_done.load(Ordering::Acquire);
            driver.run_deferred_work();
            if done
                && core.completions().is_empty()
                && !core.completions().overflow_pending()
                && descriptors.lock().unwrap().is_empty()
            {
                break;
            }
        }
        stop_watchdog.store(true, Ordering::Release);
    });

    let released = &driver.mapper().unmapped;
    let unique: HashSet<u32> = released.iter().copied().collect();
    assert_eq!(released.len(), TRANSFERS as usize);
    assert_eq!(unique.len(), TRANSFERS as usize);
}

#[test]
fn watchdog_flags_after_timeout_across_midnight() {
    init_logging();
    let core = core_with(CoreConfig::default());
    let mut driver = attach(&core, Adapter::default());
    let timeout = core.config().tx_timeout_ticks;

    let start = TICKS_PER_DAY - 30;
    core.clock().set(start);
    core.on_interrupt_tx_complete(2, 1, Mapping(1)).unwrap();

    core.clock().advance(timeout);
    assert_eq!(driver.watchdog().flagged, 0);
    assert!(core.clock().now() < start);

    core.clock().advance(1);
    assert_eq!(driver.watchdog().flagged, 1);

    // Flagging never releases; the bottom half does.
    assert!(driver.mapper().unmapped.is_empty());
    driver.run_deferred_work();
    assert_eq!(driver.mapper().unmapped, vec![1]);
    assert_eq!(driver.stats().completion.timed_out_released, 1);
}

#[test]
fn urgent_frames_reach_hardware_before_low() {
    init_logging();
    let core = core_with(CoreConfig::default());
    let mut driver = attach(&core, Adapter::default());

    driver.submit_tx(b"low", Priority::Low).unwrap();
    for i in 0..4u8 {
        driver.submit_tx(&[b'u', i], Priority::Urgent).unwrap();
    }

    let report = driver.flush_tx_default();
    assert_eq!(report.sent, 5);
    let sent = &driver.nic().sent;
    assert!(sent[..4].iter().all(|frame| frame[0] == b'u'));
    assert_eq!(sent[4], b"low".to_vec());
}

#[test]
fn failed_send_releases_mapping_immediately() {
    init_logging();
    let core = core_with(CoreConfig::default());
    let mut driver = attach(&core, Adapter {
        fail_sends: true,
        ..Adapter::default()
    });

    driver.submit_tx(b"frame", Priority::Normal).unwrap();
    let report = driver.flush_tx(8);
    assert_eq!(report.send_failures, 1);
    assert_eq!(driver.mapper().unmapped, vec![1]);
}

#[test]
fn flow_control_follows_watermarks() {
    init_logging();
    let config = CoreConfig {
        tx_queue_sizes: [64, 100, 64, 32],
        ..CoreConfig::default()
    };
    let core = core_with(config);
    let mut driver = attach(&core, Adapter::default());

    for _ in 0..91 {
        driver.submit_tx(&[0u8; 60], Priority::Normal).unwrap();
    }
    assert!(driver.queue_stats().flow_control_active);
    assert_eq!(driver.queue_stats().backpressure_events, 1);

    driver.flush_tx(6);
    assert_eq!(driver.queue_stats().usage_percent[Priority::Normal.index()], 85);
    assert!(driver.queue_stats().flow_control_active);

    // Average usage over the four queues reaches 20% at 80 frames.
    driver.flush_tx(5);
    assert!(driver.queue_stats().flow_control_active);
    driver.flush_tx(1);
    assert!(!driver.queue_stats().flow_control_active);
}

#[test]
fn flow_control_holds_while_queues_refill() {
    init_logging();
    let config = CoreConfig {
        tx_queue_sizes: [100; 4],
        ..CoreConfig::default()
    };
    let core = core_with(config);
    let mut driver = attach(&core, Adapter::default());

    for _ in 0..50 {
        driver.submit_tx(&[0u8; 60], Priority::Low).unwrap();
    }
    for _ in 0..91 {
        driver.submit_tx(&[3u8; 60], Priority::Urgent).unwrap();
    }
    assert!(driver.queue_stats().flow_control_active);

    // Urgent drains first; average usage stays at 25%.
    driver.flush_tx(41);
    assert_eq!(driver.queue_stats().count, [50, 0, 0, 50]);
    assert!(driver.queue_stats().flow_control_active);

    for _ in 0..35 {
        driver.submit_tx(&[3u8; 60], Priority::Urgent).unwrap();
    }
    let stats = driver.queue_stats();
    assert_eq!(stats.usage_percent[Priority::Urgent.index()], 85);
    assert!(stats.flow_control_active);
    assert_eq!(stats.backpressure_events, 1);
}

#[test]
fn polled_frame_longer_than_staging_is_dropped() {
    init_logging();
    let core = core_with(CoreConfig::default());
    let mut adapter = Adapter::default();
    adapter.rx.push_back((vec![0xAA; 2000], 0));
    adapter.rx.push_back((vec![0xBB; 64], 1));
    let mut driver = attach(&core, adapter);

    assert_eq!(driver.poll_receive(4), 1);
    driver.run_deferred_work();

    assert_eq!(driver.dispatch().frames, vec![(vec![0xBB; 64], 1)]);
    assert_eq!(driver.stats().rx_capture.oversize, 1);
}

/// Dispatch target that records how many staging buffers were free when
/// each frame arrived.
struct StagingCounter<'a> {
    core: &'a Core,
    free_at_dispatch: Vec<usize>,
}

impl netcore::ProtocolDispatch for StagingCounter<'_> {
    fn dispatch(&mut self, _frame: &[u8], _source: u8) -> Result<(), netcore::DispatchError> {
        let core = self.core;
        self.free_at_dispatch
            .push(core.rx().staging().available(core.interrupts()));
        Ok(())
    }
}

#[test]
fn threshold_frame_is_promoted_with_staging_already_free() {
    init_logging();
    let core = core_with(CoreConfig::default());
    let threshold = core.config().promotion_threshold;
    let counter = StagingCounter {
        core: &core,
        free_at_dispatch: Vec::new(),
    };
    let aux = AuxPool::from_config(core.config());
    let mut driver = Driver::attach(&core, Mapper::default(), Adapter::default(), counter, aux).unwrap();

    assert!(core.on_interrupt_rx_frame(&vec![0x42; threshold], 0));
    assert!(core.on_interrupt_rx_frame(&vec![0x42; threshold - 1], 0));
    driver.run_deferred_work();

    // Both frames left staging before their handler ran.
    assert_eq!(driver.dispatch().free_at_dispatch, vec![15, 16]);
    assert_eq!(driver.stats().rx_dispatch.promoted, 1);
}

#[test]
fn staging_exhaustion_preserves_captured_frames() {
    init_logging();
    let core = core_with(CoreConfig::default());
    let mut driver = attach(&core, Adapter::default());
    let buffers = core.config().staging_buffers;

    for i in 0..buffers {
        assert!(core.on_interrupt_rx_frame(&[i as u8; 64], i as u8));
    }
    assert!(!core.on_interrupt_rx_frame(&[0xFF; 64], 0));
    assert_eq!(driver.stats().rx_capture.staging_exhausted, 1);

    driver.run_deferred_work();
    let frames = &driver.dispatch().frames;
    assert_eq!(frames.len(), buffers);
    for (i, (frame, source)) in frames.iter().enumerate() {
        assert_eq!(*source, i as u8);
        assert!(frame.iter().all(|&b| b == i as u8));
    }
}

#[test]
fn detach_unmaps_in_flight_transmissions() {
    init_logging();
    let core = core_with(CoreConfig::default());
    let mut driver = attach(&core, Adapter::default());

    for _ in 0..3 {
        driver.submit_tx(b"payload", Priority::High).unwrap();
    }
    driver.flush_tx_default();
    driver.submit_tx(b"queued", Priority::Low).unwrap();
    core.on_interrupt_release(77).unwrap();

    let report = driver.detach();
    assert_eq!(report.orphans, 3);
    assert_eq!(report.tx_discarded, 1);
    assert_eq!(report.releases, 1);
    assert!(!core.is_attached());
    assert!(core.on_interrupt_tx_complete(0, 0, Mapping(5)).is_err());
}
