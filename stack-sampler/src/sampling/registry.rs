//! Per-thread metadata fed by the runtime's thread lifecycle notifications.
//!
//! Notifications arrive on arbitrary threads and not necessarily in causal
//! order, so every mutation creates the entry it needs instead of assuming a
//! `thread_created` was seen first.

use crate::sampling::ids::{ThreadId, UNKNOWN_MANAGED_THREAD_ID};
use parking_lot::{Mutex, MutexGuard};
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::trace;
use widestring::{U16Str, U16String};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadState {
    pub os_thread_id: u32,
    pub display_name: U16String,
}

/// Trace correlation for whatever the thread is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id_high: u64,
    pub trace_id_low: u64,
    pub span_id: u64,
    pub managed_thread_id: i32,
}

impl Default for SpanContext {
    fn default() -> Self {
        Self {
            trace_id_high: 0,
            trace_id_low: 0,
            span_id: 0,
            managed_thread_id: UNKNOWN_MANAGED_THREAD_ID,
        }
    }
}

#[derive(Default)]
pub struct ThreadRegistry {
    states: Mutex<HashMap<ThreadId, ThreadState>>,
    contexts: Mutex<HashMap<ThreadId, SpanContext>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread_created(&self, thread: ThreadId) {
        self.states.lock().entry(thread).or_default();
    }

    pub fn thread_destroyed(&self, thread: ThreadId) {
        self.states.lock().remove(&thread);
        self.contexts.lock().remove(&thread);
        trace!(target: "stack_sampler::registry", thread = thread.as_u64(), "thread destroyed");
    }

    pub fn thread_assigned_to_os_thread(&self, thread: ThreadId, os_thread_id: u32) {
        self.states.lock().entry(thread).or_default().os_thread_id = os_thread_id;
    }

    pub fn thread_name_changed(&self, thread: ThreadId, name: &U16Str) {
        self.states.lock().entry(thread).or_default().display_name = name.to_ustring();
    }

    pub fn set_span_context(&self, thread: ThreadId, context: SpanContext) {
        self.contexts.lock().insert(thread, context);
    }

    pub fn span_context(&self, thread: ThreadId) -> SpanContext {
        self.contexts.lock().get(&thread).copied().unwrap_or_default()
    }

    pub fn thread_state(&self, thread: ThreadId) -> Option<ThreadState> {
        self.states.lock().get(&thread).cloned()
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the state lock, then the context lock, and hold both until the
    /// returned guard is dropped.
    ///
    /// The sampler does this before suspending the runtime: a suspended
    /// thread may be parked inside a lifecycle notification holding one of
    /// these locks.
    pub fn lock_for_capture(&self) -> CaptureGuard<'_> {
        let states = self.states.lock();
        let contexts = self.contexts.lock();
        CaptureGuard { states, contexts }
    }
}

pub struct CaptureGuard<'a> {
    states: MutexGuard<'a, HashMap<ThreadId, ThreadState>>,
    contexts: MutexGuard<'a, HashMap<ThreadId, SpanContext>>,
}

impl CaptureGuard<'_> {
    /// Registered state of `thread`, or an empty state for threads the
    /// registry has not heard of yet.
    pub fn state(&self, thread: ThreadId) -> Cow<'_, ThreadState> {
        self.states
            .get(&thread)
            .map_or_else(|| Cow::Owned(ThreadState::default()), Cow::Borrowed)
    }

    pub fn span_context(&self, thread: ThreadId) -> SpanContext {
        self.contexts.get(&thread).copied().unwrap_or_default()
    }
}
