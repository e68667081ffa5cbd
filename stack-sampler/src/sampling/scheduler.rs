//! The capture cycle and the background thread that drives it.
//!
//! One cycle: check for a free exchange slot, take the registry locks,
//! suspend the runtime, write one sample per managed thread, resume, and
//! publish the finished batch. A cycle that has started suspending always
//! runs through resume, whatever the collaborators do.

use crate::sampling::allocation::{AllocationEvent, AllocationSampler};
use crate::sampling::clock::{Clock, SystemClock, micros_i32};
use crate::sampling::config::SamplerConfig;
use crate::sampling::error::{RuntimeError, SamplerError};
use crate::sampling::exchange::{BufferExchange, PublishOutcome};
use crate::sampling::format::SampleWriter;
use crate::sampling::ids::ThreadId;
use crate::sampling::records::SamplingStatistics;
use crate::sampling::registry::{CaptureGuard, SpanContext, ThreadRegistry};
use crate::sampling::runtime::ManagedRuntime;
use crate::sampling::symbols::FunctionNameResolver;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use widestring::U16Str;

/// Longest uninterrupted sleep of the sampling thread, bounding how long a
/// stop request waits.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Both exchange slots were full; nothing was captured.
    Skipped,
    Published {
        len: usize,
        stats: SamplingStatistics,
    },
    /// Captured, but the exchange filled up before the batch could be handed over.
    Dropped,
}

/// State shared by the sampling thread, the runtime's notification callbacks
/// and the consumer.
struct SamplingCore {
    runtime: Arc<dyn ManagedRuntime>,
    clock: Arc<dyn Clock>,
    config: SamplerConfig,
    registry: ThreadRegistry,
    exchange: BufferExchange,
    resolver: Mutex<FunctionNameResolver>,
    allocations: AllocationSampler,
}

/// Cheap, cloneable entry point into a sampler.
///
/// Lifecycle notifications, span context updates and allocation ticks come in
/// through here from arbitrary threads; the consumer drains batches through
/// [`read_thread_samples`](Self::read_thread_samples) and
/// [`read_allocation_samples`](Self::read_allocation_samples).
#[derive(Clone)]
pub struct SamplerHandle {
    core: Arc<SamplingCore>,
}

impl SamplerHandle {
    pub fn new(runtime: Arc<dyn ManagedRuntime>, config: SamplerConfig) -> Self {
        Self::with_clock(runtime, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        runtime: Arc<dyn ManagedRuntime>,
        clock: Arc<dyn Clock>,
        config: SamplerConfig,
    ) -> Self {
        let allocations = AllocationSampler::new(&config, clock.as_ref());
        Self::with_allocation_sampler(runtime, clock, config, allocations)
    }

    /// Use a pre-built allocation sampler, e.g. one with a seeded sub-sampler.
    pub fn with_allocation_sampler(
        runtime: Arc<dyn ManagedRuntime>,
        clock: Arc<dyn Clock>,
        config: SamplerConfig,
        allocations: AllocationSampler,
    ) -> Self {
        let resolver = FunctionNameResolver::new(
            config.function_name_cache_capacity,
            config.volatile_name_cache_capacity,
        );
        Self {
            core: Arc::new(SamplingCore {
                runtime,
                clock,
                config,
                registry: ThreadRegistry::new(),
                exchange: BufferExchange::new(),
                resolver: Mutex::new(resolver),
                allocations,
            }),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.core.registry
    }

    pub fn thread_created(&self, thread: ThreadId) {
        self.core.registry.thread_created(thread);
    }

    pub fn thread_destroyed(&self, thread: ThreadId) {
        self.core.registry.thread_destroyed(thread);
    }

    pub fn thread_assigned_to_os_thread(&self, thread: ThreadId, os_thread_id: u32) {
        self.core.registry.thread_assigned_to_os_thread(thread, os_thread_id);
    }

    pub fn thread_name_changed(&self, thread: ThreadId, name: &U16Str) {
        self.core.registry.thread_name_changed(thread, name);
    }

    /// Record the span the calling thread is now working on.
    pub fn set_span_context(
        &self,
        trace_id_high: u64,
        trace_id_low: u64,
        span_id: u64,
        managed_thread_id: i32,
    ) {
        match self.core.runtime.current_thread_id() {
            Ok(thread) => self.core.registry.set_span_context(
                thread,
                SpanContext {
                    trace_id_high,
                    trace_id_low,
                    span_id,
                    managed_thread_id,
                },
            ),
            Err(err) => {
                debug!(target: "stack_sampler::scheduler", %err, "could not identify thread for span context");
            }
        }
    }

    /// Called on the allocating thread. Returns whether the allocation was
    /// sampled.
    pub fn allocation_tick(&self, size: u64, type_name: &U16Str) -> bool {
        let core = &*self.core;
        core.allocations.tick(
            core.runtime.as_ref(),
            core.clock.as_ref(),
            &core.registry,
            &core.resolver,
            AllocationEvent { size, type_name },
        )
    }

    /// Move the oldest finished batch into `dest`. Returns the number of bytes
    /// copied; 0 when no batch is pending.
    pub fn read_thread_samples(&self, dest: &mut [u8]) -> usize {
        if dest.is_empty() {
            warn!(target: "stack_sampler::scheduler", "read_thread_samples called with an empty destination");
            return 0;
        }
        self.core.exchange.consume_into(dest)
    }

    pub fn read_allocation_samples(&self, dest: &mut [u8]) -> usize {
        self.core.allocations.buffer().read_into(dest)
    }

    /// Run one capture cycle on the calling thread.
    pub fn run_cycle(&self) -> CycleOutcome {
        self.core.run_cycle()
    }
}

impl SamplingCore {
    fn run_cycle(&self) -> CycleOutcome {
        if !self.exchange.may_produce() {
            warn!(target: "stack_sampler::scheduler", "consumer has not drained previous batches, skipping sampling period");
            return CycleOutcome::Skipped;
        }

        let mut writer = SampleWriter::with_capacity(
            self.config.buffer_initial_capacity,
            self.config.encoder_limits(),
        );
        writer.start_batch(self.clock.unix_millis());
        let mut stats = SamplingStatistics::default();

        {
            // Lock order: state, context, then names. Taken before suspending
            // so no suspended thread can be holding them.
            let registry = self.registry.lock_for_capture();
            let mut resolver = self.resolver.lock();
            resolver.begin_cycle();

            let suspend_start = self.clock.now();
            // A panic in suspend counts as a failed freeze; resume still runs.
            let captured = catch_unwind(AssertUnwindSafe(|| {
                if let Err(err) = self.runtime.suspend() {
                    warn!(target: "stack_sampler::scheduler", %err, "could not suspend runtime");
                    return;
                }
                capture_threads(
                    self.runtime.as_ref(),
                    &registry,
                    &mut resolver,
                    &mut writer,
                    &mut stats,
                );
            }));
            if let Err(panic) = captured {
                error!(
                    target: "stack_sampler::scheduler",
                    panic = panic_message(panic.as_ref()),
                    "capture pass panicked, publishing partial batch"
                );
            }
            match catch_unwind(AssertUnwindSafe(|| self.runtime.resume())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(target: "stack_sampler::scheduler", %err, "could not resume runtime");
                }
                Err(panic) => {
                    error!(
                        target: "stack_sampler::scheduler",
                        panic = panic_message(panic.as_ref()),
                        "resume panicked"
                    );
                }
            }
            stats.suspend_micros =
                micros_i32(self.clock.now().saturating_duration_since(suspend_start));
        }

        writer.end_batch();
        writer.write_final_stats(&stats);
        debug!(
            target: "stack_sampler::scheduler",
            suspend_micros = stats.suspend_micros,
            threads = stats.thread_count,
            frames = stats.frame_count,
            name_cache_misses = stats.name_cache_misses,
            len = writer.len(),
            truncated = writer.is_truncated(),
            "sampling cycle complete"
        );

        let len = writer.len();
        match self.exchange.publish(writer.into_bytes()) {
            PublishOutcome::Stored => CycleOutcome::Published { len, stats },
            PublishOutcome::Dropped => CycleOutcome::Dropped,
        }
    }

    fn run_loop(&self, stop: &AtomicBool) {
        let period = self.config.sampling_period;
        let mut next_cycle = self.clock.now() + period;
        while !stop.load(Ordering::Acquire) {
            let now = self.clock.now();
            if now < next_cycle {
                self.clock.sleep((next_cycle - now).min(STOP_POLL_INTERVAL));
                continue;
            }
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.run_cycle())) {
                error!(
                    target: "stack_sampler::scheduler",
                    panic = panic_message(panic.as_ref()),
                    "sampling cycle panicked"
                );
            }
            next_cycle = self.clock.now() + period;
        }
    }
}

/// Write one sample per managed thread. Runs while the runtime is suspended.
fn capture_threads(
    runtime: &dyn ManagedRuntime,
    registry: &CaptureGuard<'_>,
    resolver: &mut FunctionNameResolver,
    writer: &mut SampleWriter,
    stats: &mut SamplingStatistics,
) {
    let threads = match runtime.enumerate_threads() {
        Ok(threads) => threads,
        Err(err) => {
            debug!(target: "stack_sampler::scheduler", %err, "could not enumerate threads");
            return;
        }
    };
    for thread in threads {
        stats.thread_count += 1;
        writer.start_sample(&registry.state(thread), &registry.span_context(thread));
        if let Err(err) = record_stack(runtime, thread, resolver, writer, stats) {
            debug!(target: "stack_sampler::scheduler", %err, thread = thread.as_u64(), "stack walk failed");
        }
        writer.end_sample();
    }
}

/// Walk `thread`'s stack, writing one frame per visited function into the
/// currently open sample.
pub(crate) fn record_stack(
    runtime: &dyn ManagedRuntime,
    thread: ThreadId,
    resolver: &mut FunctionNameResolver,
    writer: &mut SampleWriter,
    stats: &mut SamplingStatistics,
) -> Result<(), RuntimeError> {
    runtime.walk_stack(thread, &mut |function, frame| {
        let name = resolver.lookup(runtime, function, frame, stats);
        writer.record_frame(function, &name);
        stats.frame_count += 1;
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Background stack sampler.
pub struct ThreadSampler;

impl ThreadSampler {
    /// Start sampling on a dedicated thread named `stack-sampler`.
    pub fn start(
        runtime: Arc<dyn ManagedRuntime>,
        config: SamplerConfig,
    ) -> Result<SamplerGuard, SamplerError> {
        Self::start_with_handle(SamplerHandle::new(runtime, config))
    }

    /// Start the sampling thread for an existing handle.
    pub fn start_with_handle(handle: SamplerHandle) -> Result<SamplerGuard, SamplerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let thread = {
            let core = handle.core.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("stack-sampler".into())
                .spawn(move || {
                    let init = core.runtime.initialize_sampling_thread();
                    let registered = init.is_ok();
                    let _ = ready_tx.send(init);
                    if registered {
                        core.run_loop(&stop);
                    }
                })
                .map_err(SamplerError::SpawnThread)?
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = thread.join();
                error!(target: "stack_sampler::scheduler", %err, "could not register sampling thread");
                return Err(SamplerError::Runtime(err));
            }
            Err(_) => {
                let _ = thread.join();
                error!(target: "stack_sampler::scheduler", "sampling thread exited during startup");
                return Err(SamplerError::StartupAborted);
            }
        }
        info!(
            target: "stack_sampler::scheduler",
            period_ms = handle.core.config.sampling_period.as_millis() as u64,
            "stack sampler started"
        );
        Ok(SamplerGuard {
            handle,
            stop,
            thread: Some(thread),
        })
    }
}

/// RAII guard returned by [`ThreadSampler::start`]. Dropping it stops the
/// sampling thread after its in-flight cycle.
pub struct SamplerGuard {
    handle: SamplerHandle,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SamplerGuard {
    pub fn handle(&self) -> SamplerHandle {
        self.handle.clone()
    }
}

impl Drop for SamplerGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        info!(target: "stack_sampler::scheduler", "stack sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("walker blew up");
        assert_eq!(panic_message(payload.as_ref()), "walker blew up");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
