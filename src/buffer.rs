//! Fixed-capacity byte buffers and the allocator seam used by pools.
//!
//! A [`Buffer`] is always owned by exactly one party: a free list, the
//! producer filling it, the consumer reading it, or a round of in-flight
//! sink writes. Ownership moves by value; there is no shared aliasing.

use std::fmt;
use std::ops::Deref;

use crate::error::{Error, Result};

/// Default capacity of buffers created by pumps and transform sessions.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// An owned, fixed-capacity byte region with a filled prefix.
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
    limit: usize,
}

impl Buffer {
    /// Create a zeroed buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
            limit: capacity,
        }
    }

    /// Total bytes this buffer may hold right now.
    pub fn capacity(&self) -> usize {
        self.limit
    }

    /// Number of filled bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.limit
    }

    /// Bytes that can still be appended.
    pub fn remaining(&self) -> usize {
        self.limit - self.len
    }

    /// Forget the filled bytes and lift any limit.
    pub fn clear(&mut self) {
        self.len = 0;
        self.limit = self.data.len();
    }

    /// Restrict the usable capacity to at most `capacity` bytes.
    ///
    /// Never shrinks below the filled length. The limit is lifted by [`clear`](Self::clear).
    pub fn limit(&mut self, capacity: usize) {
        self.limit = capacity.clamp(self.len, self.limit);
    }

    /// The filled bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The unfilled region. Write into it, then call [`advance`](Self::advance).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..self.limit]
    }

    /// The whole usable region, filled or not.
    ///
    /// Transformers receive this together with `len()` as their write offset.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.limit]
    }

    /// Mark `count` more bytes as filled, saturating at capacity.
    pub fn advance(&mut self, count: usize) {
        self.len = (self.len + count).min(self.limit);
    }

    /// Drop filled bytes past `len`.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Copy as much of `src` as fits. Returns the number of bytes copied.
    pub fn extend_from_slice(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.remaining());
        self.data[self.len..self.len + count].copy_from_slice(&src[..count]);
        self.len += count;
        count
    }

    /// Filled bytes, mutable. Used by in-place chunk transforms.
    pub fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.limit)
            .finish()
    }
}

/// Allocator consulted when a pool grows or sheds buffers.
///
/// Both calls happen while no task is suspended inside the pool, so
/// implementations must not block.
pub trait BufferPool: Send + Sync {
    /// Hand out a buffer with at least `size` bytes of capacity.
    fn allocate(&self, size: usize) -> Buffer;

    /// Take back a buffer the pool no longer needs.
    fn release(&self, buffer: Buffer);
}

/// Allocates from the heap and lets released buffers drop.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapPool;

impl BufferPool for HeapPool {
    fn allocate(&self, size: usize) -> Buffer {
        Buffer::new(size)
    }

    fn release(&self, _buffer: Buffer) {}
}

/// Pool occupancy snapshot shared by pumps and pipes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolStats {
    /// Buffers allocated and not yet returned to the allocator
    pub buffers: usize,
    /// Idle buffers on the free list
    pub free: usize,
    /// Filled buffers waiting for the consumer (or for sink writes, in a pipe)
    pub ready: usize,
    /// Largest `buffers` value observed
    pub high_water: usize,
}

/// Check pool bounds shared by pump and pipe configurations.
pub(crate) fn validate_bounds(min: usize, max: usize, size: usize) -> Result<()> {
    if min == 0 {
        return Err(Error::config("min_buffers must be at least 1"));
    }
    if max < min {
        return Err(Error::config(format!(
            "max_buffers ({}) is below min_buffers ({})",
            max, min
        )));
    }
    if size == 0 {
        return Err(Error::config("buffer_size must be at least 1"));
    }
    Ok(())
}
