use thiserror::Error;

/// Failure reported by the monitored runtime for one collaborator call.
///
/// `code` is the runtime's own status value (an HRESULT on runtimes that use
/// them). These are never fatal to the sampler: every call site substitutes
/// a fallback and keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{operation} failed. HRESULT={code:#010x}")]
pub struct RuntimeError {
    pub operation: &'static str,
    pub code: u32,
}

impl RuntimeError {
    pub const fn new(operation: &'static str, code: u32) -> Self {
        Self { operation, code }
    }
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("failed to spawn the sampling thread")]
    SpawnThread(#[source] std::io::Error),

    #[error("could not register the sampling thread with the runtime: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("sampling thread exited during startup")]
    StartupAborted,
}
