//! Binary batch format (version 1).
//!
//! ## Layout
//! ```text
//! All integers big-endian. Str := len(i16) + len UTF-16 units (u16 each).
//!
//!   0x01 StartBatch        → op(u8) + version(i32) + capture_start_millis(i64)                        = 13 bytes
//!   0x02 StartSample       → op(u8) + managed_tid(i32) + os_tid(i32) + thread_name(Str)
//!                            + trace_id_high(u64) + trace_id_low(u64) + span_id(u64)                   = 33 + Str
//!   0x08 AllocationSample  → op(u8) + timestamp_millis(i64) + size(u64) + type_name(Str)
//!                            + the StartSample fields after the opcode                                = 49 + 2 Str
//!        Frame             → -code(i16) + name(Str)   first use of a function in this batch
//!                          | code(i16)                   later uses
//!        EndSample         → 0(i16)
//!   0x06 EndBatch          → op(u8)                                                                   = 1 byte
//!   0x07 FinalStats        → op(u8) + suspend_us(i32) + threads(i32) + frames(i32) + cache_misses(i32) = 17 bytes
//! ```
//!
//! Frame codes are local to one buffer: they start at 1 and a reader needs no
//! state from any other buffer. Past the per-buffer code limit, frames are
//! written as fresh definitions every time instead of being registered. They
//! all carry code `max_codes + 1`, which is definition-only: no reference is
//! ever written for it.
//!
//! The writer enforces a hard size cap. Sample content is only written while
//! it leaves room for the closing records (EndSample, EndBatch, FinalStats),
//! so a capped batch is truncated but still well-formed. Once a content
//! write has been refused, every later content write is a no-op.

use crate::sampling::config::EncoderLimits;
use crate::sampling::ids::FunctionId;
use crate::sampling::records::{
    AllocationRecord, BatchRecord, DecodedFrame, FrameKind, SampleThread, SamplingStatistics,
    ThreadSample,
};
use crate::sampling::registry::{SpanContext, ThreadState};
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};
use tracing::debug;
use widestring::U16Str;

pub const VERSION: i32 = 1;

// Opcodes
const OP_START_BATCH: u8 = 0x01;
const OP_START_SAMPLE: u8 = 0x02;
const OP_END_BATCH: u8 = 0x06;
const OP_FINAL_STATS: u8 = 0x07;
const OP_ALLOCATION_SAMPLE: u8 = 0x08;
const END_SAMPLE: i16 = 0;

const START_BATCH_SIZE: usize = 1 + 4 + 8;
const THREAD_FIELDS_SIZE: usize = 4 + 4 + 8 + 8 + 8;
const FINAL_STATS_SIZE: usize = 1 + 4 * 4;
/// Room kept free for the records that close a batch.
const TRAILER_RESERVE: usize = 2 + 1 + FINAL_STATS_SIZE;

/// Append-only encoder for one batch buffer.
pub struct SampleWriter {
    buf: Vec<u8>,
    limits: EncoderLimits,
    codes: HashMap<FunctionId, i16>,
    truncated: bool,
    sample_open: bool,
}

impl SampleWriter {
    pub fn new(limits: EncoderLimits) -> Self {
        Self::with_capacity(0, limits)
    }

    pub fn with_capacity(capacity: usize, limits: EncoderLimits) -> Self {
        let limits = limits.clamped();
        Self {
            buf: Vec::with_capacity(capacity.min(limits.max_size)),
            limits,
            codes: HashMap::new(),
            truncated: false,
            sample_open: false,
        }
    }

    pub fn start_batch(&mut self, capture_start_millis: i64) {
        if !self.admit(START_BATCH_SIZE, false) {
            return;
        }
        self.buf.push(OP_START_BATCH);
        self.put_i32(VERSION);
        self.put_i64(capture_start_millis);
    }

    pub fn start_sample(&mut self, state: &ThreadState, context: &SpanContext) {
        self.end_sample();
        let size = 1 + THREAD_FIELDS_SIZE + self.str_size(&state.display_name);
        if !self.admit(size, false) {
            return;
        }
        self.buf.push(OP_START_SAMPLE);
        self.put_thread(state, context);
        self.sample_open = true;
    }

    /// Header of an allocation sample; frames and `end_sample` follow as for a
    /// thread sample.
    pub fn allocation_sample(
        &mut self,
        timestamp_millis: i64,
        allocation_size: u64,
        type_name: &U16Str,
        state: &ThreadState,
        context: &SpanContext,
    ) {
        self.end_sample();
        let size = 1
            + 8
            + 8
            + self.str_size(type_name)
            + THREAD_FIELDS_SIZE
            + self.str_size(&state.display_name);
        if !self.admit(size, false) {
            return;
        }
        self.buf.push(OP_ALLOCATION_SAMPLE);
        self.put_i64(timestamp_millis);
        self.put_u64(allocation_size);
        self.put_str(type_name);
        self.put_thread(state, context);
        self.sample_open = true;
    }

    pub fn record_frame(&mut self, function: FunctionId, name: &U16Str) {
        if !self.sample_open {
            return;
        }
        if let Some(&code) = self.codes.get(&function) {
            if self.admit(2, false) {
                self.put_i16(code);
            }
            return;
        }

        // codes.len() <= max_codes < i16::MAX, so the code stays positive.
        let code = (self.codes.len() + 1) as i16;
        if !self.admit(2 + self.str_size(name), false) {
            return;
        }
        self.put_i16(-code);
        self.put_str(name);
        if self.codes.len() < self.limits.max_codes {
            self.codes.insert(function, code);
        }
    }

    pub fn end_sample(&mut self) {
        if !self.sample_open {
            return;
        }
        self.sample_open = false;
        if self.admit(2, true) {
            self.put_i16(END_SAMPLE);
        }
    }

    pub fn end_batch(&mut self) {
        self.end_sample();
        if self.admit(1, true) {
            self.buf.push(OP_END_BATCH);
        }
    }

    pub fn write_final_stats(&mut self, stats: &SamplingStatistics) {
        self.end_sample();
        if !self.admit(FINAL_STATS_SIZE, true) {
            return;
        }
        self.buf.push(OP_FINAL_STATS);
        self.put_i32(stats.suspend_micros);
        self.put_i32(stats.thread_count);
        self.put_i32(stats.frame_count);
        self.put_i32(stats.name_cache_misses);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether any record was refused because of the size cap.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Number of frame codes registered for reuse in this buffer.
    pub fn code_count(&self) -> usize {
        self.codes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Check that `size` more bytes fit. Content records must leave the
    /// trailer reserve free; closing records may use the whole cap.
    fn admit(&mut self, size: usize, closing: bool) -> bool {
        if self.truncated && !closing {
            return false;
        }
        let limit = if closing {
            self.limits.max_size
        } else {
            self.limits.max_size.saturating_sub(TRAILER_RESERVE)
        };
        if self.buf.len() + size <= limit {
            return true;
        }
        if !self.truncated {
            debug!(
                target: "stack_sampler::format",
                len = self.buf.len(),
                max_size = self.limits.max_size,
                "sample buffer full, dropping remaining records"
            );
            self.truncated = true;
        }
        false
    }

    fn str_size(&self, s: &U16Str) -> usize {
        2 + 2 * s.len().min(self.limits.max_string_length)
    }

    fn put_thread(&mut self, state: &ThreadState, context: &SpanContext) {
        self.put_i32(context.managed_thread_id);
        self.put_i32(state.os_thread_id as i32);
        self.put_str(&state.display_name);
        self.put_u64(context.trace_id_high);
        self.put_u64(context.trace_id_low);
        self.put_u64(context.span_id);
    }

    fn put_str(&mut self, s: &U16Str) {
        let units = &s.as_slice()[..s.len().min(self.limits.max_string_length)];
        self.put_i16(units.len() as i16);
        for unit in units {
            self.buf.extend_from_slice(&unit.to_be_bytes());
        }
    }

    fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
}

/// Decoder for one batch buffer.
///
/// A buffer that ends mid-record (for example after a consumer copied it into
/// a too-small destination) ends decoding without an error.
pub struct BatchReader<R> {
    reader: R,
    names: HashMap<i16, String>,
}

impl<R: Read> BatchReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            names: HashMap::new(),
        }
    }

    /// Read the next record. Returns `Ok(None)` at the end of the buffer.
    pub fn read_record(&mut self) -> io::Result<Option<BatchRecord>> {
        let mut op = [0u8; 1];
        if self.reader.read_exact(&mut op).is_err() {
            return Ok(None);
        }
        match self.read_body(op[0]) {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_body(&mut self, op: u8) -> io::Result<BatchRecord> {
        Ok(match op {
            OP_START_BATCH => BatchRecord::StartBatch {
                version: self.read_i32()?,
                capture_start_millis: self.read_i64()?,
            },
            OP_START_SAMPLE => {
                let thread = self.read_thread()?;
                let frames = self.read_frames()?;
                BatchRecord::Sample(ThreadSample { thread, frames })
            }
            OP_ALLOCATION_SAMPLE => {
                let timestamp_millis = self.read_i64()?;
                let allocation_size = self.read_u64()?;
                let type_name = self.read_str()?;
                let thread = self.read_thread()?;
                let frames = self.read_frames()?;
                BatchRecord::Allocation(AllocationRecord {
                    timestamp_millis,
                    allocation_size,
                    type_name,
                    thread,
                    frames,
                })
            }
            OP_END_BATCH => BatchRecord::EndBatch,
            OP_FINAL_STATS => BatchRecord::FinalStats(SamplingStatistics {
                suspend_micros: self.read_i32()?,
                thread_count: self.read_i32()?,
                frame_count: self.read_i32()?,
                name_cache_misses: self.read_i32()?,
            }),
            other => {
                return Err(invalid_data(format!("unknown opcode {other:#04x}")));
            }
        })
    }

    fn read_thread(&mut self) -> io::Result<SampleThread> {
        Ok(SampleThread {
            managed_thread_id: self.read_i32()?,
            os_thread_id: self.read_i32()?,
            thread_name: self.read_str()?,
            trace_id_high: self.read_u64()?,
            trace_id_low: self.read_u64()?,
            span_id: self.read_u64()?,
        })
    }

    fn read_frames(&mut self) -> io::Result<Vec<DecodedFrame>> {
        let mut frames = Vec::new();
        loop {
            let code = self.read_i16()?;
            if code == END_SAMPLE {
                return Ok(frames);
            }
            if code < 0 {
                let code = code
                    .checked_neg()
                    .ok_or_else(|| invalid_data(format!("frame code {code} out of range")))?;
                let name = self.read_str()?;
                self.names.insert(code, name.clone());
                frames.push(DecodedFrame {
                    code,
                    kind: FrameKind::Definition,
                    name,
                });
            } else {
                let name = self
                    .names
                    .get(&code)
                    .cloned()
                    .ok_or_else(|| invalid_data(format!("frame code {code} used before definition")))?;
                frames.push(DecodedFrame {
                    code,
                    kind: FrameKind::Reference,
                    name,
                });
            }
        }
    }

    fn read_str(&mut self) -> io::Result<String> {
        let len = self.read_i16()?;
        if len < 0 {
            return Err(invalid_data(format!("negative string length {len}")));
        }
        let mut bytes = vec![0u8; len as usize * 2];
        self.reader.read_exact(&mut bytes)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    fn read_i16(&mut self) -> io::Result<i16> {
        let mut b = [0u8; 2];
        self.reader.read_exact(&mut b)?;
        Ok(i16::from_be_bytes(b))
    }

    fn read_i32(&mut self) -> io::Result<i32> {
        let mut b = [0u8; 4];
        self.reader.read_exact(&mut b)?;
        Ok(i32::from_be_bytes(b))
    }

    fn read_i64(&mut self) -> io::Result<i64> {
        let mut b = [0u8; 8];
        self.reader.read_exact(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        let mut b = [0u8; 8];
        self.reader.read_exact(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }
}

impl<R: Read> Iterator for BatchReader<R> {
    type Item = io::Result<BatchRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

/// Decode every record of one buffer.
pub fn decode_batch(bytes: &[u8]) -> io::Result<Vec<BatchRecord>> {
    BatchReader::new(bytes).collect()
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}
