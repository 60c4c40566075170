//! Byte-range view over a possibly-pooled buffer
//!
//! A chunk owns its backing `Vec<u8>` together with a window into it and a
//! flag recording whether the backing buffer must be handed back to the pool
//! when the chunk is retired. A chunk is either "owned and poolable" (exactly
//! one recycle expected) or "borrowed" (never pooled); the
//! `do_not_return_to_pool` transform strips recycle responsibility before a
//! chunk leaves the pool's custody.

use super::pool::BufferPool;

#[derive(Debug)]
pub struct BufferChunk {
    bytes: Vec<u8>,
    offset: usize,
    len: usize,
    return_to_pool: bool,
}

impl BufferChunk {
    /// Chunk covering the whole buffer, returned to the pool on recycle.
    pub fn pooled(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        BufferChunk {
            bytes,
            offset: 0,
            len,
            return_to_pool: true,
        }
    }

    /// Poolable chunk covering `offset..offset + len` of the buffer. Used to
    /// adopt a payload range inside a fetched wire frame without copying.
    pub fn pooled_slice(bytes: Vec<u8>, offset: usize, len: usize) -> Self {
        debug_assert!(offset.saturating_add(len) <= bytes.len());
        BufferChunk {
            bytes,
            offset,
            len,
            return_to_pool: true,
        }
    }

    /// Chunk that is never handed back to a pool.
    pub fn borrowed(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        BufferChunk {
            bytes,
            offset: 0,
            len,
            return_to_pool: false,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn must_return_to_pool(&self) -> bool {
        self.return_to_pool
    }

    /// Strips recycle responsibility. The chunk keeps its data but will no
    /// longer return the backing buffer to any pool.
    pub fn do_not_return_to_pool(mut self) -> Self {
        self.return_to_pool = false;
        self
    }

    /// Retires the chunk, returning the backing buffer to `pool` iff this
    /// chunk still owns recycle responsibility.
    pub fn recycle(self, pool: &BufferPool) {
        if self.return_to_pool {
            pool.release(self.bytes);
        }
    }
}
