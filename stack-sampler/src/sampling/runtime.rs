//! The monitored runtime, seen from the sampler.
//!
//! Everything the sampler needs from the outside world goes through
//! [`ManagedRuntime`]: suspending and resuming all managed threads, listing
//! them, walking one thread's stack, and turning frame ids into declarations.
//! Implementations wrap the runtime's profiling API; tests use scripted fakes.

use crate::sampling::error::RuntimeError;
use crate::sampling::ids::{FrameToken, FunctionId, FunctionIdentifier, ThreadId};
use smallvec::SmallVec;
use widestring::U16String;

/// Declaration of a managed method as read from the runtime's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodSignature {
    pub type_name: U16String,
    pub method_name: U16String,
    /// Names of the method's own generic parameters, in declaration order.
    pub generic_parameters: SmallVec<[U16String; 2]>,
    /// Argument type names, or `None` when the signature could not be parsed.
    pub arguments: Option<Vec<U16String>>,
}

impl MethodSignature {
    pub fn new(type_name: &str, method_name: &str) -> Self {
        Self {
            type_name: U16String::from_str(type_name),
            method_name: U16String::from_str(method_name),
            generic_parameters: SmallVec::new(),
            arguments: Some(Vec::new()),
        }
    }

    pub fn with_generic_parameters<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.generic_parameters = names.into_iter().map(U16String::from_str).collect();
        self
    }

    pub fn with_arguments<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.arguments = Some(names.into_iter().map(U16String::from_str).collect());
        self
    }

    pub fn with_unknown_arguments(mut self) -> Self {
        self.arguments = None;
        self
    }
}

/// Profiling surface of the monitored runtime.
///
/// All calls may fail; the sampler logs failures and degrades (unknown name,
/// empty stack, skipped thread) instead of aborting a cycle.
pub trait ManagedRuntime: Send + Sync {
    /// Stop all managed threads. Bounded in time.
    fn suspend(&self) -> Result<(), RuntimeError>;

    /// Restart managed threads. Called after every suspend attempt, including
    /// failed ones.
    fn resume(&self) -> Result<(), RuntimeError>;

    /// List live managed threads. Only called while suspended.
    fn enumerate_threads(&self) -> Result<Vec<ThreadId>, RuntimeError>;

    /// Walk `thread`'s stack leaf-first, calling `visit` once per frame.
    fn walk_stack(
        &self,
        thread: ThreadId,
        visit: &mut dyn FnMut(FunctionId, FrameToken),
    ) -> Result<(), RuntimeError>;

    /// Derive the stable identifier of the function executing in a frame.
    fn function_identifier(
        &self,
        function: FunctionId,
        frame: FrameToken,
    ) -> Result<FunctionIdentifier, RuntimeError>;

    /// Read the declaration behind a stable identifier.
    fn method_signature(&self, id: &FunctionIdentifier) -> Result<MethodSignature, RuntimeError>;

    /// Runtime id of the calling thread.
    fn current_thread_id(&self) -> Result<ThreadId, RuntimeError>;

    /// Register the calling OS thread with the runtime. Called once from the
    /// sampling thread before its first cycle.
    fn initialize_sampling_thread(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}
