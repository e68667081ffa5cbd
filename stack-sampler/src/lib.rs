#![doc = include_str!("../README.md")]

pub mod sampling;

pub use sampling::{
    BatchRecord, CycleOutcome, ManagedRuntime, SamplerConfig, SamplerError, SamplerGuard,
    SamplerHandle, ThreadSampler, decode_batch,
};
