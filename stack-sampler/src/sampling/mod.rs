pub mod allocation;
pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod format;
pub mod ids;
pub mod name_cache;
pub mod records;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod subsampler;
pub mod symbols;

pub use allocation::{AllocationBuffer, AllocationEvent, AllocationSampler};
pub use clock::{Clock, SystemClock};
pub use config::{DEFAULT_SAMPLING_PERIOD, EncoderLimits, MIN_SAMPLING_PERIOD, SamplerConfig};
pub use error::{RuntimeError, SamplerError};
pub use exchange::{BufferExchange, PublishOutcome};
pub use format::{BatchReader, SampleWriter, decode_batch};
pub use ids::{FrameToken, FunctionId, FunctionIdentifier, ThreadId, UNKNOWN_MANAGED_THREAD_ID};
pub use name_cache::NameCache;
pub use records::{
    AllocationRecord, BatchRecord, DecodedFrame, FrameKind, SampleThread, SamplingStatistics,
    ThreadSample,
};
pub use registry::{SpanContext, ThreadRegistry, ThreadState};
pub use runtime::{ManagedRuntime, MethodSignature};
pub use scheduler::{CycleOutcome, SamplerGuard, SamplerHandle, ThreadSampler};
pub use subsampler::AllocationSubSampler;
pub use symbols::{FrameName, FunctionNameResolver};
