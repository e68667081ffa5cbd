//! Two-slot handoff between the sampling thread and the consumer.
//!
//! The producer never waits: when both slots are taken a new buffer is
//! dropped. Slots are drained oldest first.

use parking_lot::Mutex;
use tracing::warn;

const SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Stored,
    /// Both slots were occupied; the buffer was dropped.
    Dropped,
}

struct Slots<B> {
    /// Each occupied slot carries the sequence number it was filled with.
    slots: [Option<(u64, B)>; SLOTS],
    next_seq: u64,
}

pub struct BufferExchange<B = Vec<u8>> {
    inner: Mutex<Slots<B>>,
}

impl<B> Default for BufferExchange<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> BufferExchange<B> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: [None, None],
                next_seq: 0,
            }),
        }
    }

    /// Whether a buffer produced now would find a free slot.
    pub fn may_produce(&self) -> bool {
        self.inner.lock().slots.iter().any(Option::is_none)
    }

    pub fn publish(&self, buffer: B) -> PublishOutcome {
        let rejected = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            match inner.slots.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = Some((seq, buffer));
                    inner.next_seq += 1;
                    return PublishOutcome::Stored;
                }
                None => buffer,
            }
        };
        // Released outside the lock.
        drop(rejected);
        warn!(target: "stack_sampler::exchange", "both sample slots full, dropping buffer");
        PublishOutcome::Dropped
    }

    /// Remove the oldest pending buffer.
    pub fn take(&self) -> Option<B> {
        let mut inner = self.inner.lock();
        let oldest = inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|(seq, _)| (*seq, i)))
            .min()?
            .1;
        inner.slots[oldest].take().map(|(_, buffer)| buffer)
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.is_some()).count()
    }
}

impl<B: AsRef<[u8]>> BufferExchange<B> {
    /// Move the oldest pending buffer into `dest`, returning the number of
    /// bytes copied. Bytes that do not fit are discarded with the buffer.
    /// Returns 0 when nothing is pending.
    pub fn consume_into(&self, dest: &mut [u8]) -> usize {
        let Some(buffer) = self.take() else {
            return 0;
        };
        let bytes = buffer.as_ref();
        let n = bytes.len().min(dest.len());
        dest[..n].copy_from_slice(&bytes[..n]);
        n
    }

    /// Like [`consume_into`](Self::consume_into), returning the copied bytes.
    pub fn consume(&self, capacity: usize) -> Vec<u8> {
        match self.take() {
            Some(buffer) => {
                let bytes = buffer.as_ref();
                bytes[..bytes.len().min(capacity)].to_vec()
            }
            None => Vec::new(),
        }
    }
}
