// Core Configuration
//
// Sizing and tuning parameters fixed at driver attach. Defaults describe
// an ISA-era setup: 8 interfaces with 16-slot TX descriptor rings, the
// 18.2 Hz PC timer, 1518-byte frames, and a 200-byte copybreak.

use crate::error::{ConfigError, ConfigResult};
use crate::ring::check_capacity;
use crate::tick::{ms_to_ticks, TICKS_PER_DAY};

pub const MAX_FRAME_LEN: usize = 1518;

pub const MAX_INTERFACES: usize = 8;
pub const TX_DESCRIPTORS_PER_INTERFACE: usize = 16;
pub const COMPLETION_RING_CAPACITY: usize = 128;
pub const COMPLETION_BATCH: usize = 16;
pub const TX_TIMEOUT_MS: u32 = 5000;

pub const DEFERRED_RELEASE_CAPACITY: usize = 16;

pub const RX_DISPATCH_CAPACITY: usize = 32;
pub const STAGING_BUFFERS: usize = 16;
pub const WORKING_BUFFERS: usize = 16;
pub const AUX_SLOTS: usize = 8;
pub const PROMOTION_THRESHOLD: usize = 200;
pub const RX_BUDGET_TICKS: u32 = 2;

pub const TX_QUEUE_URGENT: usize = 32;
pub const TX_QUEUE_HIGH: usize = 64;
pub const TX_QUEUE_NORMAL: usize = 128;
pub const TX_QUEUE_LOW: usize = 64;
pub const FLOW_HIGH_WATERMARK: u32 = 90;
pub const FLOW_LOW_WATERMARK: u32 = 20;
pub const EVICTION_LIMIT: usize = 5;
pub const TX_FLUSH_LIMIT: usize = 32;
pub const HEALTH_INTERVAL_MS: u32 = 100;
pub const RESIZE_INTERVAL_MS: u32 = 10_000;
pub const STALE_FRAME_MS: u32 = 5000;
pub const QUEUE_USAGE_WARN: u32 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    pub interfaces: usize,
    pub tx_descriptors_per_interface: usize,
    pub completion_capacity: usize,
    pub completion_batch: usize,
    pub tx_timeout_ticks: u32,
    pub tick_modulus: u32,

    pub deferred_release_capacity: usize,

    pub rx_dispatch_capacity: usize,
    pub staging_buffers: usize,
    pub staging_buffer_size: usize,
    pub working_buffers: usize,
    pub aux_slots: usize,
    pub promotion_threshold: usize,
    pub rx_budget_ticks: u32,

    /// Indexed by priority: low, normal, high, urgent.
    pub tx_queue_sizes: [usize; 4],
    pub flow_high_watermark: u32,
    pub flow_low_watermark: u32,
    pub eviction_limit: usize,
    pub tx_flush_limit: usize,
    pub health_interval_ticks: u32,
    pub resize_interval_ticks: u32,
    pub stale_frame_ticks: u32,
    pub queue_usage_warn: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            interfaces: MAX_INTERFACES,
            tx_descriptors_per_interface: TX_DESCRIPTORS_PER_INTERFACE,
            completion_capacity: COMPLETION_RING_CAPACITY,
            completion_batch: COMPLETION_BATCH,
            tx_timeout_ticks: ms_to_ticks(TX_TIMEOUT_MS),
            tick_modulus: TICKS_PER_DAY,

            deferred_release_capacity: DEFERRED_RELEASE_CAPACITY,

            rx_dispatch_capacity: RX_DISPATCH_CAPACITY,
            staging_buffers: STAGING_BUFFERS,
            staging_buffer_size: MAX_FRAME_LEN,
            working_buffers: WORKING_BUFFERS,
            aux_slots: AUX_SLOTS,
            promotion_threshold: PROMOTION_THRESHOLD,
            rx_budget_ticks: RX_BUDGET_TICKS,

            tx_queue_sizes: [TX_QUEUE_LOW, TX_QUEUE_NORMAL, TX_QUEUE_HIGH, TX_QUEUE_URGENT],
            flow_high_watermark: FLOW_HIGH_WATERMARK,
            flow_low_watermark: FLOW_LOW_WATERMARK,
            eviction_limit: EVICTION_LIMIT,
            tx_flush_limit: TX_FLUSH_LIMIT,
            health_interval_ticks: ms_to_ticks(HEALTH_INTERVAL_MS),
            resize_interval_ticks: ms_to_ticks(RESIZE_INTERVAL_MS),
            stale_frame_ticks: ms_to_ticks(STALE_FRAME_MS),
            queue_usage_warn: QUEUE_USAGE_WARN,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        check_capacity("completion ring", self.completion_capacity)?;
        check_capacity("deferred release ring", self.deferred_release_capacity)?;
        check_capacity("rx dispatch ring", self.rx_dispatch_capacity)?;

        let in_flight = self.interfaces * self.tx_descriptors_per_interface;
        if self.completion_capacity < in_flight {
            return Err(ConfigError::CompletionRingTooSmall {
                capacity: self.completion_capacity,
                required: in_flight,
            });
        }

        let nonzero = [
            ("completion batch", self.completion_batch),
            ("staging buffers", self.staging_buffers),
            ("staging buffer size", self.staging_buffer_size),
            ("tick modulus", self.tick_modulus as usize),
            ("tx flush limit", self.tx_flush_limit),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        if self.tx_queue_sizes.iter().any(|&size| size == 0) {
            return Err(ConfigError::Zero { name: "tx queue size" });
        }
        if self.staging_buffers > u16::MAX as usize {
            return Err(ConfigError::TooLarge {
                name: "staging buffers",
                value: self.staging_buffers,
                max: u16::MAX as usize,
            });
        }

        if self.flow_high_watermark > 100 {
            return Err(ConfigError::WatermarkRange(self.flow_high_watermark));
        }
        if self.flow_low_watermark >= self.flow_high_watermark {
            return Err(ConfigError::WatermarkOrder {
                low: self.flow_low_watermark,
                high: self.flow_high_watermark,
            });
        }

        if self.staging_buffer_size < self.promotion_threshold {
            return Err(ConfigError::StagingTooSmall {
                size: self.staging_buffer_size,
                threshold: self.promotion_threshold,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = CoreConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.tx_timeout_ticks, 92);
        assert_eq!(config.completion_capacity, 128);
    }

    #[test]
    fn completion_ring_must_cover_in_flight_descriptors() {
        let config = CoreConfig {
            completion_capacity: 64,
            ..CoreConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::CompletionRingTooSmall {
                capacity: 64,
                required: 128,
            })
        );
    }

    #[test]
    fn watermarks_must_leave_hysteresis_band() {
        let config = CoreConfig {
            flow_low_watermark: 90,
            ..CoreConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::WatermarkOrder { .. })));
    }

    #[test]
    fn ring_capacities_are_powers_of_two() {
        let config = CoreConfig {
            rx_dispatch_capacity: 48,
            ..CoreConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NotPowerOfTwo { .. })));
    }
}
