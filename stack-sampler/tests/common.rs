#![allow(dead_code)]

use parking_lot::Mutex;
use stack_sampler::sampling::{
    Clock, FrameToken, FunctionId, FunctionIdentifier, ManagedRuntime, MethodSignature,
    RuntimeError, ThreadId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Scripted [`ManagedRuntime`].
///
/// Function id `n` resolves to metadata token `n` in module 1; names come from
/// the signatures registered with [`FakeRuntime::with_function`].
#[derive(Default)]
pub struct FakeRuntime {
    threads: Mutex<Vec<ThreadId>>,
    stacks: Mutex<HashMap<ThreadId, Vec<u64>>>,
    signatures: Mutex<HashMap<u32, MethodSignature>>,
    current_thread: Mutex<Option<ThreadId>>,
    panic_on_walk: Mutex<Option<ThreadId>>,
    /// Clock advanced by (suspend, resume) latencies on each call.
    latency: Mutex<Option<(Arc<FakeClock>, Duration, Duration)>>,
    pub fail_suspend: AtomicBool,
    pub panic_on_suspend: AtomicBool,
    pub panic_on_resume: AtomicBool,
    pub fail_initialize: AtomicBool,
    pub fail_enumerate: AtomicBool,
    pub suspended: AtomicBool,
    pub suspend_calls: AtomicUsize,
    pub resume_calls: AtomicUsize,
    pub unsuspended_walks: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(self, function: u64, type_name: &str, method_name: &str) -> Self {
        self.signatures
            .lock()
            .insert(function as u32, MethodSignature::new(type_name, method_name));
        self
    }

    /// Add a live thread whose stack (leaf first) is `frames`.
    pub fn with_thread(self, thread: u64, frames: &[u64]) -> Self {
        self.threads.lock().push(ThreadId(thread));
        self.stacks.lock().insert(ThreadId(thread), frames.to_vec());
        self
    }

    pub fn with_current_thread(self, thread: u64) -> Self {
        *self.current_thread.lock() = Some(ThreadId(thread));
        self
    }

    /// Make every suspend and resume take the given time on `clock`.
    pub fn with_latency(self, clock: Arc<FakeClock>, suspend: Duration, resume: Duration) -> Self {
        *self.latency.lock() = Some((clock, suspend, resume));
        self
    }

    pub fn panic_when_walking(&self, thread: u64) {
        *self.panic_on_walk.lock() = Some(ThreadId(thread));
    }

    pub fn suspend_count(&self) -> usize {
        self.suspend_calls.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }
}

impl ManagedRuntime for FakeRuntime {
    fn suspend(&self) -> Result<(), RuntimeError> {
        self.suspend_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((clock, suspend, _)) = &*self.latency.lock() {
            clock.advance(*suspend);
        }
        if self.panic_on_suspend.load(Ordering::SeqCst) {
            panic!("suspend aborted");
        }
        if self.fail_suspend.load(Ordering::SeqCst) {
            return Err(RuntimeError::new("SuspendRuntime", 0x8013_1362));
        }
        self.suspended.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<(), RuntimeError> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((clock, _, resume)) = &*self.latency.lock() {
            clock.advance(*resume);
        }
        if self.panic_on_resume.load(Ordering::SeqCst) {
            panic!("resume aborted");
        }
        self.suspended.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn enumerate_threads(&self) -> Result<Vec<ThreadId>, RuntimeError> {
        if self.fail_enumerate.load(Ordering::SeqCst) {
            return Err(RuntimeError::new("EnumThreads", 0x8000_4005));
        }
        Ok(self.threads.lock().clone())
    }

    fn walk_stack(
        &self,
        thread: ThreadId,
        visit: &mut dyn FnMut(FunctionId, FrameToken),
    ) -> Result<(), RuntimeError> {
        if *self.panic_on_walk.lock() == Some(thread) {
            panic!("corrupt stack on thread {}", thread.as_u64());
        }
        if !self.suspended.load(Ordering::SeqCst) {
            self.unsuspended_walks.fetch_add(1, Ordering::SeqCst);
        }
        let frames = self
            .stacks
            .lock()
            .get(&thread)
            .cloned()
            .ok_or(RuntimeError::new("DoStackSnapshot", 0x8013_1351))?;
        for (depth, function) in frames.into_iter().enumerate() {
            visit(FunctionId(function), FrameToken(depth as u64));
        }
        Ok(())
    }

    fn function_identifier(
        &self,
        function: FunctionId,
        _frame: FrameToken,
    ) -> Result<FunctionIdentifier, RuntimeError> {
        Ok(FunctionIdentifier::new(function.as_u64() as u32, 1))
    }

    fn method_signature(&self, id: &FunctionIdentifier) -> Result<MethodSignature, RuntimeError> {
        self.signatures
            .lock()
            .get(&id.function_token)
            .cloned()
            .ok_or(RuntimeError::new("GetMethodProps", 0x8013_1130))
    }

    fn initialize_sampling_thread(&self) -> Result<(), RuntimeError> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(RuntimeError::new("InitializeCurrentThread", 0x8000_4005));
        }
        Ok(())
    }

    fn current_thread_id(&self) -> Result<ThreadId, RuntimeError> {
        let current = *self.current_thread.lock();
        current.ok_or(RuntimeError::new("GetCurrentThreadID", 0x8013_1351))
    }
}

/// Manually driven clock. `sleep` advances time instead of blocking.
pub struct FakeClock {
    start: Instant,
    offset: Mutex<Duration>,
    unix_epoch_millis: i64,
}

impl FakeClock {
    pub fn new(unix_epoch_millis: i64) -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            unix_epoch_millis,
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock()
    }

    fn unix_millis(&self) -> i64 {
        self.unix_epoch_millis + self.offset.lock().as_millis() as i64
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Initialize a tracing subscriber once so failures show the sampler's logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stack_sampler=debug")),
        )
        .with_test_writer()
        .try_init();
}
