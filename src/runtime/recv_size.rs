//! Adaptive receive-buffer sizing.
//!
//! Predicts how large the next read buffer should be from how much the
//! previous reads actually filled. Candidate sizes come from a static table:
//! 16..=496 in steps of 16, then powers of two from 512 up to 1 GiB.
//!
//! Growth is fast (four table steps after a read fills the buffer) and
//! shrinking is slow (one step, and only after two consecutive reads that
//! fit in the entry two below the current one).

use crate::error::{Error, Result};
use crate::runtime::buffer::{BufferKind, BufferPool};
use bytes::BytesMut;

const LINEAR_ENTRIES: usize = 31;
const DOUBLING_ENTRIES: usize = 22;
const TABLE_LEN: usize = LINEAR_ENTRIES + DOUBLING_ENTRIES;

const INDEX_INCREMENT: usize = 4;
const INDEX_DECREMENT: usize = 1;

/// Shared, immutable size table.
static SIZE_TABLE: [usize; TABLE_LEN] = build_size_table();

const fn build_size_table() -> [usize; TABLE_LEN] {
    let mut table = [0usize; TABLE_LEN];
    let mut i = 0;
    while i < LINEAR_ENTRIES {
        table[i] = (i + 1) * 16;
        i += 1;
    }
    let mut size = 512;
    while i < TABLE_LEN {
        table[i] = size;
        size <<= 1;
        i += 1;
    }
    table
}

/// The candidate sizes, smallest first.
pub fn size_table() -> &'static [usize] {
    &SIZE_TABLE
}

/// Index of the smallest table entry >= `size`, or the last index when
/// `size` exceeds every entry.
pub fn size_table_index(size: usize) -> usize {
    SIZE_TABLE
        .partition_point(|&entry| entry < size)
        .min(TABLE_LEN - 1)
}

/// Bounds shared by every handle created from one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveRecvSizing {
    min_index: usize,
    max_index: usize,
    initial_index: usize,
}

impl AdaptiveRecvSizing {
    pub const DEFAULT_MINIMUM: usize = 64;
    pub const DEFAULT_INITIAL: usize = 1024;
    pub const DEFAULT_MAXIMUM: usize = 65536;

    /// Build a sizing policy for `0 < minimum <= initial <= maximum`.
    ///
    /// `minimum` rounds up to the nearest table entry and `maximum` rounds
    /// down; when both land on the same gap the maximum is raised to the
    /// minimum's entry.
    pub fn new(minimum: usize, initial: usize, maximum: usize) -> Result<Self> {
        if minimum == 0 {
            return Err(Error::invalid(format!("minimum: {minimum}")));
        }
        if initial < minimum {
            return Err(Error::invalid(format!("initial: {initial}")));
        }
        if maximum < initial {
            return Err(Error::invalid(format!("maximum: {maximum}")));
        }

        let min_index = size_table_index(minimum);

        let mut max_index = size_table_index(maximum);
        if SIZE_TABLE[max_index] > maximum && max_index > 0 {
            max_index -= 1;
        }
        let max_index = max_index.max(min_index);

        let initial_index = size_table_index(initial).clamp(min_index, max_index);

        Ok(Self {
            min_index,
            max_index,
            initial_index,
        })
    }

    /// A fresh per-session predictor.
    pub fn new_handle(&self) -> RecvSizeHandle {
        RecvSizeHandle {
            min_index: self.min_index,
            max_index: self.max_index,
            index: self.initial_index,
            next_size: SIZE_TABLE[self.initial_index],
            decrease_now: false,
        }
    }

    pub fn min_size(&self) -> usize {
        SIZE_TABLE[self.min_index]
    }

    pub fn max_size(&self) -> usize {
        SIZE_TABLE[self.max_index]
    }

    pub fn initial_size(&self) -> usize {
        SIZE_TABLE[self.initial_index]
    }
}

impl Default for AdaptiveRecvSizing {
    fn default() -> Self {
        let min_index = size_table_index(Self::DEFAULT_MINIMUM);
        let initial_index = size_table_index(Self::DEFAULT_INITIAL);
        let max_index = size_table_index(Self::DEFAULT_MAXIMUM);
        Self {
            min_index,
            max_index,
            initial_index,
        }
    }
}

/// Per-session prediction state. Owned by exactly one session.
#[derive(Debug, Clone)]
pub struct RecvSizeHandle {
    min_index: usize,
    max_index: usize,
    index: usize,
    next_size: usize,
    decrease_now: bool,
}

impl RecvSizeHandle {
    /// The size the next read buffer should have.
    pub fn guess(&self) -> usize {
        self.next_size
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Draw a buffer of the predicted size from `pool`.
    pub fn allocate(&self, pool: &BufferPool) -> Result<BytesMut> {
        pool.acquire(self.next_size, BufferKind::Direct)
    }

    /// Feed back how many bytes the last read produced.
    pub fn record(&mut self, actual: usize) {
        let shrink_threshold = SIZE_TABLE[self.index.saturating_sub(INDEX_DECREMENT + 1)];
        if actual <= shrink_threshold {
            if self.decrease_now {
                self.index = self
                    .index
                    .saturating_sub(INDEX_DECREMENT)
                    .max(self.min_index);
                self.next_size = SIZE_TABLE[self.index];
                self.decrease_now = false;
            } else {
                self.decrease_now = true;
            }
        } else if actual >= self.next_size {
            self.index = (self.index + INDEX_INCREMENT).min(self.max_index);
            self.next_size = SIZE_TABLE[self.index];
            self.decrease_now = false;
        } else {
            // Shrinking needs two small reads in a row.
            self.decrease_now = false;
        }
    }
}
