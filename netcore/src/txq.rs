// Priority Transmit Queues
//
// Four strict-priority FIFOs between protocol code and the transmitter.
//
// Key responsibilities:
// - Admission: empty and oversize frames are refused up front; a full
//   queue may evict from strictly lower queues, lowest first. High and
//   normal only evict once usage across all queues passes 95% and 90%
// - Dequeue: urgent drains completely before high, high before normal,
//   normal before low
// - Flow control with hysteresis: on when any queue passes the high
//   watermark, off only when the average over all queues drops below the
//   low watermark
// - Health: rate-limited usage and staleness checks, followed by an
//   advisory resize analysis when problems are found
//
// Design:
// - Priority ladder mirrors the scheduler's run queues: index 0 is the
//   lowest priority, dequeue walks from the top
// - A frame admitted by eviction takes the slot the eviction freed, so its
//   own queue may go past `max_count`; the total across queues never
//   exceeds the sum of the limits
// - Mainline only. Nothing here is touched from interrupt context

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;

use crate::config::{CoreConfig, MAX_FRAME_LEN};
use crate::error::Dropped;
use crate::tick::{ticks_between, Tick};
use crate::{log_debug, log_info, log_warn};

const LOG_ORIGIN: &str = "txq";

pub const PRIORITY_LEVELS: usize = 4;

const RESIZE_EXPAND_USAGE: u32 = 90;
const RESIZE_EXPAND_MAX: usize = 512;
const RESIZE_SHRINK_USAGE: u32 = 10;
const RESIZE_SHRINK_MIN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    /// Lowest first.
    pub const ALL: [Priority; PRIORITY_LEVELS] = [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether a full queue of this priority may evict lower-priority
    /// frames, given the usage across all queues. The target queue is
    /// already full, so its own usage says nothing.
    fn may_evict(self, usage: u32) -> bool {
        match self {
            Priority::Urgent => true,
            Priority::High => usage > 95,
            Priority::Normal => usage > 90,
            Priority::Low => false,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = Dropped;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Urgent),
            other => Err(Dropped::InvalidPriority(other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    data: Vec<u8>,
    priority: Priority,
    submit_tick: Tick,
}

impl TxFrame {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn submit_tick(&self) -> Tick {
        self.submit_tick
    }
}

pub struct PriorityQueue {
    frames: VecDeque<TxFrame>,
    max_count: usize,
    dropped: u32,
}

impl PriorityQueue {
    fn new(max_count: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(max_count),
            max_count,
            dropped: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.frames.len()
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.max_count
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn usage_percent(&self) -> u32 {
        if self.max_count == 0 {
            return 0;
        }
        (self.frames.len() * 100 / self.max_count) as u32
    }

    fn oldest(&self) -> Option<&TxFrame> {
        self.frames.front()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowControlState {
    pub active: bool,
    pub last_transition_tick: Tick,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// All per-priority arrays are indexed by `Priority::index`.
    pub count: [usize; PRIORITY_LEVELS],
    pub max_count: [usize; PRIORITY_LEVELS],
    pub usage_percent: [u32; PRIORITY_LEVELS],
    pub dropped: [u32; PRIORITY_LEVELS],
    pub queue_full_events: u32,
    pub backpressure_events: u32,
    pub priority_drops: u32,
    pub adaptive_resizes: u32,
    pub emergency_drained: u32,
    pub flow_control_active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResizeAdvice {
    #[default]
    Keep,
    Expand,
    Shrink,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub high_usage: [bool; PRIORITY_LEVELS],
    pub stale: [bool; PRIORITY_LEVELS],
    /// Present only when issues were found and the resize analysis was
    /// not rate-limited.
    pub resize: Option<[ResizeAdvice; PRIORITY_LEVELS]>,
}

impl HealthReport {
    pub fn has_issues(&self) -> bool {
        self.high_usage.iter().chain(self.stale.iter()).any(|&issue| issue)
    }
}

pub struct TxQueues {
    queues: [PriorityQueue; PRIORITY_LEVELS],
    flow: FlowControlState,
    high_watermark: u32,
    low_watermark: u32,
    eviction_limit: usize,
    modulus: u32,

    health_interval: u32,
    resize_interval: u32,
    stale_ticks: u32,
    usage_warn: u32,
    last_health: Option<Tick>,
    last_resize: Option<Tick>,

    queue_full_events: u32,
    backpressure_events: u32,
    priority_drops: u32,
    adaptive_resizes: u32,
    emergency_drained: u32,
}

impl TxQueues {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            queues: config.tx_queue_sizes.map(PriorityQueue::new),
            flow: FlowControlState::default(),
            high_watermark: config.flow_high_watermark,
            low_watermark: config.flow_low_watermark,
            eviction_limit: config.eviction_limit,
            modulus: config.tick_modulus,
            health_interval: config.health_interval_ticks,
            resize_interval: config.resize_interval_ticks,
            stale_ticks: config.stale_frame_ticks,
            usage_warn: config.queue_usage_warn,
            last_health: None,
            last_resize: None,
            queue_full_events: 0,
            backpressure_events: 0,
            priority_drops: 0,
            adaptive_resizes: 0,
            emergency_drained: 0,
        }
    }

    pub fn queue(&self, priority: Priority) -> &PriorityQueue {
        &self.queues[priority.index()]
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(PriorityQueue::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(PriorityQueue::is_empty)
    }

    pub fn flow_control(&self) -> FlowControlState {
        self.flow
    }

    pub fn submit(&mut self, frame: &[u8], priority: Priority, now: Tick) -> Result<(), Dropped> {
        if frame.is_empty() {
            return Err(Dropped::EmptyFrame);
        }
        if frame.len() > MAX_FRAME_LEN {
            return Err(Dropped::Oversize {
                len: frame.len(),
                max: MAX_FRAME_LEN,
            });
        }

        let target = priority.index();
        if self.queues[target].is_full() {
            let usage = self.aggregate_usage();
            let freed = if priority.may_evict(usage) {
                self.evict_below(priority)
            } else {
                0
            };

            if freed == 0 {
                self.queue_full_events += 1;
                self.queues[target].dropped += 1;
                log_debug!(LOG_ORIGIN, "{} queue full, frame dropped", priority);
                return Err(Dropped::QueueFull(priority));
            }
        }

        self.queues[target].frames.push_back(TxFrame {
            data: frame.to_vec(),
            priority,
            submit_tick: now,
        });
        self.update_flow_control(now);
        Ok(())
    }

    /// Evicts up to the eviction limit from queues strictly below
    /// `priority`, lowest first.
    fn evict_below(&mut self, priority: Priority) -> usize {
        let mut evicted = 0;

        for lower in Priority::ALL.iter().take_while(|&&p| p < priority) {
            let queue = &mut self.queues[lower.index()];
            while evicted < self.eviction_limit && queue.frames.pop_front().is_some() {
                queue.dropped += 1;
                evicted += 1;
            }
            if evicted >= self.eviction_limit {
                break;
            }
        }

        if evicted > 0 {
            self.priority_drops += evicted as u32;
            log_info!(
                LOG_ORIGIN,
                "evicted {} lower priority frames for {} queue",
                evicted,
                priority
            );
        }
        evicted
    }

    /// Highest-priority frame, oldest first within a priority.
    pub fn dequeue(&mut self, now: Tick) -> Option<TxFrame> {
        let frame = self
            .queues
            .iter_mut()
            .rev()
            .find_map(|queue| queue.frames.pop_front())?;
        self.update_flow_control(now);
        Some(frame)
    }

    /// Frames queued over total capacity, in percent.
    fn aggregate_usage(&self) -> u32 {
        let capacity: usize = self.queues.iter().map(PriorityQueue::max_count).sum();
        if capacity == 0 {
            return 0;
        }
        (self.len() * 100 / capacity) as u32
    }

    fn average_usage(&self) -> u32 {
        let total: u32 = self.queues.iter().map(PriorityQueue::usage_percent).sum();
        total / PRIORITY_LEVELS as u32
    }

    fn update_flow_control(&mut self, now: Tick) {
        if !self.flow.active {
            let peak = self.queues.iter().map(PriorityQueue::usage_percent).max().unwrap_or(0);
            if peak > self.high_watermark {
                self.flow = FlowControlState {
                    active: true,
                    last_transition_tick: now,
                };
                self.backpressure_events += 1;
                log_info!(LOG_ORIGIN, "flow control on, queue usage {}%", peak);
            }
        } else {
            let average = self.average_usage();
            if average < self.low_watermark {
                self.flow = FlowControlState {
                    active: false,
                    last_transition_tick: now,
                };
                log_info!(LOG_ORIGIN, "flow control off, average usage {}%", average);
            }
        }
    }

    /// Rate-limited health check. `None` if the previous check was less
    /// than one health interval ago.
    pub fn check_health(&mut self, now: Tick) -> Option<HealthReport> {
        if let Some(last) = self.last_health {
            if ticks_between(last, now, self.modulus) < self.health_interval {
                return None;
            }
        }
        self.last_health = Some(now);

        let mut report = HealthReport::default();
        for priority in Priority::ALL {
            let queue = &self.queues[priority.index()];
            let usage = queue.usage_percent();
            if usage > self.usage_warn {
                log_warn!(LOG_ORIGIN, "{} queue usage high: {}%", priority, usage);
                report.high_usage[priority.index()] = true;
            }

            if let Some(oldest) = queue.oldest() {
                let age = ticks_between(oldest.submit_tick, now, self.modulus);
                if age > self.stale_ticks {
                    log_warn!(LOG_ORIGIN, "stale frames in {} queue, age {} ticks", priority, age);
                    report.stale[priority.index()] = true;
                }
            }
        }

        if report.has_issues() {
            report.resize = self.analyze_resize(now);
        }
        Some(report)
    }

    /// Advisory only; queue limits are never changed.
    fn analyze_resize(&mut self, now: Tick) -> Option<[ResizeAdvice; PRIORITY_LEVELS]> {
        if let Some(last) = self.last_resize {
            if ticks_between(last, now, self.modulus) < self.resize_interval {
                return None;
            }
        }
        self.last_resize = Some(now);

        let mut advice = [ResizeAdvice::Keep; PRIORITY_LEVELS];
        for priority in Priority::ALL {
            let queue = &self.queues[priority.index()];
            let usage = queue.usage_percent();

            if usage > RESIZE_EXPAND_USAGE && queue.max_count < RESIZE_EXPAND_MAX {
                log_info!(LOG_ORIGIN, "{} queue consistently full ({}%), expansion advised", priority, usage);
                advice[priority.index()] = ResizeAdvice::Expand;
                self.adaptive_resizes += 1;
            } else if usage < RESIZE_SHRINK_USAGE && queue.max_count > RESIZE_SHRINK_MIN {
                log_info!(LOG_ORIGIN, "{} queue underused ({}%), shrink advised", priority, usage);
                advice[priority.index()] = ResizeAdvice::Shrink;
                self.adaptive_resizes += 1;
            }
        }
        Some(advice)
    }

    /// Discards every queued frame. Returns how many were dropped.
    pub fn emergency_drain(&mut self) -> usize {
        let mut total = 0;
        for priority in Priority::ALL {
            let queue = &mut self.queues[priority.index()];
            let drained = queue.frames.len();
            queue.frames.clear();
            if drained > 0 {
                log_info!(LOG_ORIGIN, "drained {} frames from {} queue", drained, priority);
            }
            total += drained;
        }

        self.emergency_drained += total as u32;
        self.flow.active = false;
        total
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            queue_full_events: self.queue_full_events,
            backpressure_events: self.backpressure_events,
            priority_drops: self.priority_drops,
            adaptive_resizes: self.adaptive_resizes,
            emergency_drained: self.emergency_drained,
            flow_control_active: self.flow.active,
            ..QueueStats::default()
        };

        for (i, queue) in self.queues.iter().enumerate() {
            stats.count[i] = queue.count();
            stats.max_count[i] = queue.max_count();
            stats.usage_percent[i] = queue.usage_percent();
            stats.dropped[i] = queue.dropped();
        }
        stats
    }
}
