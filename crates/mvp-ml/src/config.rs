//! Kernel configuration.

use crate::pooling::{area_ratio_policy, PoolingPolicy};
use tracing::debug;

/// Default ceiling on the number of taps averaged by one output.
pub const DEFAULT_MAX_AVG_FILTER_COUNT: usize = 512;

/// Default element count below which `clamp_i8` runs on the host.
pub const DEFAULT_CLAMP_HOST_THRESHOLD: usize = 64;

/// Tunables shared by every kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Largest averaged window. Long fp16 sums lose precision against
    /// large-magnitude averages.
    pub max_avg_filter_count: usize,

    /// Vectors shorter than this are clamped by the CPU.
    pub clamp_host_threshold: usize,

    /// Pre-scale convolution inputs into scratch, trading memory for one
    /// multiply per tap.
    pub optimize_for_speed: bool,

    /// Wait for each program before building the next.
    pub wait_each_program: bool,

    /// Allow paired-lane walks where alignment permits.
    pub lane_packing: bool,

    /// Average pooling strategy selection.
    pub pooling_policy: PoolingPolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_avg_filter_count: DEFAULT_MAX_AVG_FILTER_COUNT,
            clamp_host_threshold: DEFAULT_CLAMP_HOST_THRESHOLD,
            optimize_for_speed: false,
            wait_each_program: false,
            lane_packing: true,
            pooling_policy: area_ratio_policy,
        }
    }
}

impl KernelConfig {
    /// Default configuration.
    pub fn new() -> Self {
        let config = Self::default();
        debug!("Kernel config: {config:?}");
        config
    }

    /// Set the averaged-window ceiling.
    #[must_use]
    pub const fn with_max_avg_filter_count(mut self, count: usize) -> Self {
        self.max_avg_filter_count = count;
        self
    }

    /// Set the host clamp threshold.
    #[must_use]
    pub const fn with_clamp_host_threshold(mut self, threshold: usize) -> Self {
        self.clamp_host_threshold = threshold;
        self
    }

    /// Enable convolution input pre-scaling.
    #[must_use]
    pub const fn with_optimize_for_speed(mut self, enabled: bool) -> Self {
        self.optimize_for_speed = enabled;
        self
    }

    /// Serialize programs.
    #[must_use]
    pub const fn with_wait_each_program(mut self, enabled: bool) -> Self {
        self.wait_each_program = enabled;
        self
    }

    /// Enable or disable paired-lane walks.
    #[must_use]
    pub const fn with_lane_packing(mut self, enabled: bool) -> Self {
        self.lane_packing = enabled;
        self
    }

    /// Replace the average pooling policy.
    #[must_use]
    pub const fn with_pooling_policy(mut self, policy: PoolingPolicy) -> Self {
        self.pooling_policy = policy;
        self
    }
}
