// Error Types
//
// One flat enum per concern. Interrupt-context entry points never return
// these; they only bump counters. Mainline calls return them and the caller
// decides whether to retry, log, or give up.

use thiserror::Error;

use crate::txq::Priority;

/// Rejected `CoreConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} capacity {value} is not a nonzero power of two")]
    NotPowerOfTwo { name: &'static str, value: usize },
    #[error("{name} must be nonzero")]
    Zero { name: &'static str },
    #[error("{name} value {value} exceeds {max}")]
    TooLarge { name: &'static str, value: usize, max: usize },
    #[error("completion ring capacity {capacity} below in-flight descriptor total {required}")]
    CompletionRingTooSmall { capacity: usize, required: usize },
    #[error("low watermark {low}% must be below high watermark {high}%")]
    WatermarkOrder { low: u32, high: u32 },
    #[error("watermark {0}% out of range")]
    WatermarkRange(u32),
    #[error("staging buffer size {size} smaller than promotion threshold {threshold}")]
    StagingTooSmall { size: usize, threshold: usize },
}

/// Outbound frame refused by the priority queue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Dropped {
    #[error("priority {0:?} queue full")]
    QueueFull(Priority),
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame of {len} bytes exceeds {max}")]
    Oversize { len: usize, max: usize },
    #[error("invalid priority {0}")]
    InvalidPriority(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("packet core already has a driver attached")]
    AlreadyAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeferredError {
    #[error("interrupts disabled, release deferred")]
    InterruptsDisabled,
    #[error("deferred release already running")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuxError {
    #[error("auxiliary memory exhausted")]
    Exhausted,
    #[error("auxiliary slot {0} invalid")]
    InvalidSlot(u32),
    #[error("{len} bytes do not fit auxiliary slot of {capacity}")]
    TooLarge { len: usize, capacity: usize },
    #[error("auxiliary memory move failed")]
    MoveFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no protocol handler for frame")]
    NoHandler,
    #[error("malformed frame")]
    Malformed,
    #[error("frame not addressed to this station")]
    NotForUs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("no mapping resources available")]
    Exhausted,
    #[error("buffer crosses a DMA boundary")]
    Boundary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HwError {
    #[error("transmitter busy")]
    Busy,
    #[error("link down")]
    LinkDown,
    #[error("adapter fault")]
    Fault,
}

/// Failed hardware hand-off. The mapping comes back so it can be released.
#[derive(Debug, Error)]
#[error("send failed: {kind}")]
pub struct SendError<H> {
    pub kind: HwError,
    pub mapping: H,
}

pub type ConfigResult<T> = Result<T, ConfigError>;
