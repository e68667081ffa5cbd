//! In-memory model of an encoded batch, as produced by
//! [`BatchReader`](crate::sampling::format::BatchReader), plus the
//! per-cycle statistics written at the end of every batch.

use serde::Serialize;

/// Counters gathered during one capture pass. Created fresh per cycle and
/// written once as the batch's `FinalStats` record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplingStatistics {
    /// Time between the suspend request and the return of resume.
    pub suspend_micros: i32,
    pub thread_count: i32,
    pub frame_count: i32,
    /// Frames whose name had to be read from the runtime's metadata.
    pub name_cache_misses: i32,
}

/// Thread metadata attached to every thread and allocation sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleThread {
    pub managed_thread_id: i32,
    pub os_thread_id: i32,
    pub thread_name: String,
    pub trace_id_high: u64,
    pub trace_id_low: u64,
    pub span_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// First use in the batch: the code is followed by the frame's name.
    Definition,
    /// Later use: only the code was written.
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedFrame {
    /// Positive frame code, as assigned by the writer for this batch.
    pub code: i16,
    pub kind: FrameKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSample {
    pub thread: SampleThread,
    /// Leaf first.
    pub frames: Vec<DecodedFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    pub timestamp_millis: i64,
    pub allocation_size: u64,
    pub type_name: String,
    pub thread: SampleThread,
    pub frames: Vec<DecodedFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum BatchRecord {
    StartBatch {
        version: i32,
        capture_start_millis: i64,
    },
    Sample(ThreadSample),
    Allocation(AllocationRecord),
    EndBatch,
    FinalStats(SamplingStatistics),
}

impl BatchRecord {
    pub fn frames(&self) -> &[DecodedFrame] {
        match self {
            BatchRecord::Sample(sample) => &sample.frames,
            BatchRecord::Allocation(allocation) => &allocation.frames,
            _ => &[],
        }
    }
}
