//! Recycling buffer pool.
//!
//! Each session reads into one buffer sized by the receive-size predictor
//! and hands it back when the predicted size moves or the stream ends, so a
//! busy loop does not allocate per connection or per read. Buffers are bucketed by capacity and
//! segregated by [`BufferKind`]; `acquire` takes the smallest pooled buffer
//! that is large enough and allocates only on a miss.
//!
//! The pool itself is thread-safe and may be shared between loops, but the
//! buffers it hands out are plain `BytesMut` values owned by one caller.

use crate::error::{Error, Result};
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Which free list a buffer belongs to.
///
/// `Direct` buffers are the ones passed to socket syscalls by the reactor;
/// `Heap` buffers are scratch space for codecs. Keeping them apart stops a
/// codec that hoards large scratch buffers from starving socket reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Direct,
    Heap,
}

/// Free buffers of one kind, keyed by capacity.
#[derive(Default)]
struct FreeList {
    by_capacity: BTreeMap<usize, Vec<BytesMut>>,
    count: usize,
}

impl FreeList {
    /// Pop the smallest buffer with capacity >= `size`.
    fn take(&mut self, size: usize) -> Option<BytesMut> {
        let (&capacity, bucket) = self.by_capacity.range_mut(size..).next()?;
        let buf = bucket.pop();
        if bucket.is_empty() {
            self.by_capacity.remove(&capacity);
        }
        if buf.is_some() {
            self.count -= 1;
        }
        buf
    }

    fn put(&mut self, buf: BytesMut) {
        self.by_capacity.entry(buf.capacity()).or_default().push(buf);
        self.count += 1;
    }

    fn clear(&mut self) {
        self.by_capacity.clear();
        self.count = 0;
    }
}

struct PoolInner {
    direct: FreeList,
    heap: FreeList,
}

impl PoolInner {
    fn list(&mut self, kind: BufferKind) -> &mut FreeList {
        match kind {
            BufferKind::Direct => &mut self.direct,
            BufferKind::Heap => &mut self.heap,
        }
    }
}

/// Pool of reusable byte buffers.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    /// Maximum buffers retained per kind; extras are dropped on release.
    max_pooled: usize,
}

impl BufferPool {
    /// Create an empty pool that retains at most `max_pooled` buffers per kind.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                direct: FreeList::default(),
                heap: FreeList::default(),
            }),
            max_pooled,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get an empty buffer with capacity of at least `size` bytes.
    ///
    /// Never blocks: a miss allocates. `size == 0` is rejected.
    pub fn acquire(&self, size: usize, kind: BufferKind) -> Result<BytesMut> {
        if size == 0 {
            return Err(Error::invalid("buffer size must be positive"));
        }
        if let Some(mut buf) = self.lock().list(kind).take(size) {
            buf.clear();
            return Ok(buf);
        }
        Ok(BytesMut::with_capacity(size))
    }

    /// Return a buffer for reuse.
    pub fn release(&self, mut buf: BytesMut, kind: BufferKind) {
        if buf.capacity() == 0 {
            return;
        }
        buf.clear();
        let mut inner = self.lock();
        let list = inner.list(kind);
        if list.count < self.max_pooled {
            list.put(buf);
        }
    }

    /// Drop every pooled buffer.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.direct.clear();
        inner.heap.clear();
    }

    /// Number of buffers currently pooled for `kind`.
    pub fn pooled(&self, kind: BufferKind) -> usize {
        self.lock().list(kind).count
    }

    pub fn max_pooled(&self) -> usize {
        self.max_pooled
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(256)
    }
}
