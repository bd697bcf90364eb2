//! Bounded replay buffer with absolute byte offsets.

use std::collections::VecDeque;

/// Append-only byte store that keeps the most recent `capacity` bytes.
///
/// Every byte ever appended has an absolute offset. Eviction advances
/// [`start_offset`](Self::start_offset); appends advance
/// [`end_offset`](Self::end_offset). Readers that remember an offset can
/// resume from it and learn whether anything was evicted in between.
#[derive(Debug, Clone)]
pub struct OutputRing {
    bytes: VecDeque<u8>,
    capacity: usize,
    start: u64,
}

/// Result of an incremental read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRead {
    pub data: Vec<u8>,
    /// Offset to pass to the next read.
    pub next_offset: u64,
    /// Some requested bytes were evicted before this read.
    pub truncated: bool,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            start: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of the oldest retained byte.
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    /// Offset one past the newest byte.
    pub fn end_offset(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    pub fn append(&mut self, data: &[u8]) {
        if data.len() >= self.capacity {
            let keep = &data[data.len() - self.capacity..];
            self.start = self.end_offset() + (data.len() - keep.len()) as u64;
            self.bytes.clear();
            self.bytes.extend(keep);
            return;
        }
        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.start += overflow as u64;
        }
        self.bytes.extend(data);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let (head, tail) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(self.bytes.len());
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        out
    }

    /// Bytes at or after `offset`, clamped to what is still retained.
    pub fn read_since(&self, offset: u64) -> BufferRead {
        let end = self.end_offset();
        let truncated = offset < self.start;
        let from = offset.clamp(self.start, end);
        let skip = (from - self.start) as usize;
        BufferRead {
            data: self.bytes.range(skip..).copied().collect(),
            next_offset: end,
            truncated,
        }
    }
}
