//! Allocation sampling.
//!
//! Each admitted allocation is encoded on the allocating thread, together with
//! that thread's current stack, and appended to one shared byte buffer that the
//! consumer drains with [`AllocationBuffer::read_into`].

use crate::sampling::clock::Clock;
use crate::sampling::config::{EncoderLimits, SamplerConfig};
use crate::sampling::format::SampleWriter;
use crate::sampling::records::SamplingStatistics;
use crate::sampling::registry::ThreadRegistry;
use crate::sampling::runtime::ManagedRuntime;
use crate::sampling::scheduler::record_stack;
use crate::sampling::subsampler::AllocationSubSampler;
use crate::sampling::symbols::FunctionNameResolver;
use parking_lot::Mutex;
use tracing::{debug, warn};
use widestring::U16Str;

/// One allocation reported by the runtime.
#[derive(Debug, Clone, Copy)]
pub struct AllocationEvent<'a> {
    pub size: u64,
    pub type_name: &'a U16Str,
}

/// Bounded append-only byte buffer for encoded allocation samples.
pub struct AllocationBuffer {
    bytes: Mutex<Vec<u8>>,
    max_size: usize,
}

impl AllocationBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            bytes: Mutex::new(Vec::new()),
            max_size,
        }
    }

    /// Append one encoded sample. A sample that would bring the buffer to or
    /// past its cap is dropped whole. Returns whether it was kept.
    pub fn append(&self, sample: &[u8]) -> bool {
        if sample.is_empty() {
            return false;
        }
        let mut bytes = self.bytes.lock();
        if bytes.len() + sample.len() >= self.max_size {
            drop(bytes);
            warn!(
                target: "stack_sampler::allocation",
                len = sample.len(),
                max_size = self.max_size,
                "allocation sample buffer full, dropping sample"
            );
            return false;
        }
        bytes.extend_from_slice(sample);
        true
    }

    /// Copy up to `dest.len()` pending bytes into `dest` and clear the buffer.
    /// Returns the number of bytes copied.
    pub fn read_into(&self, dest: &mut [u8]) -> usize {
        if dest.is_empty() {
            return 0;
        }
        let mut bytes = self.bytes.lock();
        let n = bytes.len().min(dest.len());
        dest[..n].copy_from_slice(&bytes[..n]);
        bytes.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct AllocationSampler {
    subsampler: Mutex<AllocationSubSampler>,
    buffer: AllocationBuffer,
    limits: EncoderLimits,
}

impl AllocationSampler {
    pub fn new(config: &SamplerConfig, clock: &dyn Clock) -> Self {
        Self::with_subsampler(
            config,
            AllocationSubSampler::new(
                config.allocation_samples_per_cycle,
                config.allocation_cycle,
                clock.now(),
            ),
        )
    }

    pub fn with_subsampler(config: &SamplerConfig, subsampler: AllocationSubSampler) -> Self {
        Self {
            subsampler: Mutex::new(subsampler),
            buffer: AllocationBuffer::new(config.allocation_buffer_max_size),
            limits: config.encoder_limits(),
        }
    }

    pub fn buffer(&self) -> &AllocationBuffer {
        &self.buffer
    }

    /// Handle one allocation on the allocating thread. Returns whether a
    /// sample was recorded.
    pub fn tick(
        &self,
        runtime: &dyn ManagedRuntime,
        clock: &dyn Clock,
        registry: &ThreadRegistry,
        resolver: &Mutex<FunctionNameResolver>,
        event: AllocationEvent<'_>,
    ) -> bool {
        if !self.subsampler.lock().should_sample_at(clock.now()) {
            return false;
        }
        let thread = match runtime.current_thread_id() {
            Ok(thread) => thread,
            Err(err) => {
                debug!(target: "stack_sampler::allocation", %err, "could not identify allocating thread");
                return false;
            }
        };

        let mut writer = SampleWriter::new(self.limits);
        {
            let guard = registry.lock_for_capture();
            let mut resolver = resolver.lock();
            // Function ids from an unsuspended walk are not kept past this sample.
            resolver.begin_cycle();
            writer.allocation_sample(
                clock.unix_millis(),
                event.size,
                event.type_name,
                &guard.state(thread),
                &guard.span_context(thread),
            );
            let mut stats = SamplingStatistics::default();
            if let Err(err) = record_stack(runtime, thread, &mut resolver, &mut writer, &mut stats) {
                debug!(target: "stack_sampler::allocation", %err, thread = thread.as_u64(), "stack walk failed");
            }
            writer.end_sample();
        }
        self.buffer.append(writer.as_bytes())
    }
}
