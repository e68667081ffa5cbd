//! Sampler configuration.

use std::time::Duration;

/// Shortest allowed period between two capture cycles. Every cycle suspends
/// the whole runtime, so shorter periods are clamped up to this.
pub const MIN_SAMPLING_PERIOD: Duration = Duration::from_millis(1000);

pub const DEFAULT_SAMPLING_PERIOD: Duration = Duration::from_millis(10_000);

/// Configuration for the thread sampler and the allocation sampler.
///
/// Defaults keep the steady-state memory overhead under roughly 1 MiB in
/// typical processes; frame name lengths are the largest variable.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Time between capture cycles. Never below [`MIN_SAMPLING_PERIOD`].
    pub sampling_period: Duration,
    /// Capacity of the stable (token + module) name cache. Default: 5000.
    pub function_name_cache_capacity: usize,
    /// Capacity of the per-suspension name cache. Default: 2000.
    pub volatile_name_cache_capacity: usize,
    /// Bytes reserved up front for each batch buffer. Default: 20 KiB.
    pub buffer_initial_capacity: usize,
    /// Hard cap on one encoded batch. Default: 200 KiB.
    pub buffer_max_size: usize,
    /// Longest string written, in UTF-16 units. Default: 512.
    pub max_string_length: usize,
    /// Distinct frame codes per buffer before frames are re-defined inline.
    /// Default: 10 000.
    pub max_codes_per_buffer: usize,
    /// Allocation samples admitted per sub-sampling cycle. Default: 200.
    pub allocation_samples_per_cycle: u32,
    /// Length of one allocation sub-sampling cycle. Default: 60 s.
    pub allocation_cycle: Duration,
    /// Cap on pending, unread allocation sample bytes. Default: 200 KiB.
    pub allocation_buffer_max_size: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sampling_period: DEFAULT_SAMPLING_PERIOD,
            function_name_cache_capacity: 5000,
            volatile_name_cache_capacity: 2000,
            buffer_initial_capacity: 20 * 1024,
            buffer_max_size: 200 * 1024,
            max_string_length: 512,
            max_codes_per_buffer: 10_000,
            allocation_samples_per_cycle: 200,
            allocation_cycle: Duration::from_secs(60),
            allocation_buffer_max_size: 200 * 1024,
        }
    }
}

impl SamplerConfig {
    pub fn with_sampling_period(mut self, period: Duration) -> Self {
        self.sampling_period = period.max(MIN_SAMPLING_PERIOD);
        self
    }

    pub fn with_name_cache_capacities(mut self, stable: usize, volatile: usize) -> Self {
        self.function_name_cache_capacity = stable.max(1);
        self.volatile_name_cache_capacity = volatile.max(1);
        self
    }

    pub fn with_buffer_limits(mut self, initial_capacity: usize, max_size: usize) -> Self {
        self.buffer_max_size = max_size;
        self.buffer_initial_capacity = initial_capacity.min(max_size);
        self
    }

    pub fn with_max_string_length(mut self, units: usize) -> Self {
        self.max_string_length = units.min(i16::MAX as usize);
        self
    }

    pub fn with_max_codes_per_buffer(mut self, codes: usize) -> Self {
        // Codes are written as i16 and one slot is kept for the overflow code.
        self.max_codes_per_buffer = codes.min(i16::MAX as usize - 1);
        self
    }

    pub fn with_allocation_sampling(mut self, per_cycle: u32, cycle: Duration) -> Self {
        self.allocation_samples_per_cycle = per_cycle;
        self.allocation_cycle = cycle.max(Duration::from_millis(1));
        self
    }

    pub fn with_allocation_buffer_max_size(mut self, max_size: usize) -> Self {
        self.allocation_buffer_max_size = max_size;
        self
    }

    /// Encoder limits derived from this configuration.
    pub fn encoder_limits(&self) -> EncoderLimits {
        EncoderLimits {
            max_size: self.buffer_max_size,
            max_string_length: self.max_string_length,
            max_codes: self.max_codes_per_buffer,
        }
        .clamped()
    }
}

/// Size limits applied by one [`SampleWriter`](crate::sampling::format::SampleWriter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderLimits {
    pub max_size: usize,
    pub max_string_length: usize,
    pub max_codes: usize,
}

impl EncoderLimits {
    /// Limits the wire format can express: string lengths and frame codes are
    /// `i16`, and the first code past `max_codes` must still be positive.
    pub fn clamped(self) -> Self {
        Self {
            max_size: self.max_size,
            max_string_length: self.max_string_length.min(i16::MAX as usize),
            max_codes: self.max_codes.min(i16::MAX as usize - 1),
        }
    }
}

impl Default for EncoderLimits {
    fn default() -> Self {
        SamplerConfig::default().encoder_limits()
    }
}
