//! Identifier types shared between the sampler core and the runtime it monitors.

/// Runtime-level handle of a managed thread (the runtime's own thread id, not
/// the OS id). Stable for the lifetime of the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ThreadId(pub u64);

impl ThreadId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Fast per-frame function key handed out by the stack walker.
///
/// Only unique for the duration of one suspension: after the runtime resumes,
/// the same value may name a different function. Never cache it across cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FunctionId(pub u64);

impl FunctionId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_native(self) -> bool {
        self.0 == 0
    }
}

/// Opaque per-frame context passed back to the runtime when deriving a
/// [`FunctionIdentifier`]. Only meaningful inside the walk that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameToken(pub u64);

/// Stable function key: declaration token plus containing module.
///
/// Survives across suspensions, but is more expensive to obtain than a
/// [`FunctionId`]. Module ids can in principle be recycled after an unload;
/// the pair is treated as stable enough in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FunctionIdentifier {
    pub function_token: u32,
    pub module_id: u64,
    pub is_valid: bool,
}

impl FunctionIdentifier {
    pub const fn new(function_token: u32, module_id: u64) -> Self {
        Self {
            function_token,
            module_id,
            is_valid: true,
        }
    }

    /// Identifier for frames without managed metadata (fast id 0).
    pub const NATIVE: FunctionIdentifier = FunctionIdentifier {
        function_token: 0,
        module_id: 0,
        is_valid: true,
    };

    /// Identifier used when the runtime could not describe the frame.
    pub const INVALID: FunctionIdentifier = FunctionIdentifier {
        function_token: 0,
        module_id: 0,
        is_valid: false,
    };
}

/// Sentinel managed thread id written when no span context was ever set.
pub const UNKNOWN_MANAGED_THREAD_ID: i32 = -1;
