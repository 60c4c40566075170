//! Bounded free-list of serialization buffers
//!
//! Buffers are never accessed concurrently by two holders: the chunk
//! ownership convention in [`super::buffer`] guarantees a single recycle per
//! pooled buffer, so the pool itself only needs a small lock around the free
//! list plus atomic counters for observability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_utils::CachePadded;

/// Reusable `Vec<u8>` pool with a depth bound and a per-buffer capacity
/// ceiling; oversized buffers are dropped rather than retained.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
    max_capacity: usize,
    hits: CachePadded<AtomicU64>,
    misses: CachePadded<AtomicU64>,
    returns: CachePadded<AtomicU64>,
    discards: CachePadded<AtomicU64>,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Acquisitions served from the free list.
    pub hits: u64,
    /// Acquisitions that allocated a fresh buffer.
    pub misses: u64,
    /// Buffers accepted back into the free list.
    pub returns: u64,
    /// Buffers dropped on release (pool full or buffer oversized).
    pub discards: u64,
}

impl BufferPool {
    pub fn new(max_buffers: usize, max_capacity: usize) -> Self {
        BufferPool {
            free: Mutex::new(Vec::new()),
            max_buffers,
            max_capacity,
            hits: CachePadded::new(AtomicU64::new(0)),
            misses: CachePadded::new(AtomicU64::new(0)),
            returns: CachePadded::new(AtomicU64::new(0)),
            discards: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Hands out an empty buffer with at least `min_capacity` bytes reserved.
    pub fn acquire(&self, min_capacity: usize) -> Vec<u8> {
        let reused = {
            let mut free = lock_recover(&self.free);
            free.pop()
        };
        match reused {
            Some(mut buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if buf.capacity() < min_capacity {
                    buf.reserve(min_capacity - buf.capacity());
                }
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(min_capacity.max(256))
            }
        }
    }

    /// Accepts a buffer back. The buffer is cleared; its contents are gone.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 || buf.capacity() > self.max_capacity {
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();
        let mut free = lock_recover(&self.free);
        if free.len() >= self.max_buffers {
            drop(free);
            self.discards.fetch_add(1, Ordering::Relaxed);
        } else {
            free.push(buf);
            self.returns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }
}

fn lock_recover<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_buffers() {
        let pool = BufferPool::new(2, 1024);
        let buf = pool.acquire(64);
        let cap = buf.capacity();
        pool.release(buf);
        let buf = pool.acquire(16);
        assert!(buf.capacity() >= cap.min(16));
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.returns, 1);
    }

    #[test]
    fn released_buffers_come_back_empty() {
        let pool = BufferPool::new(2, 1024);
        let mut buf = pool.acquire(8);
        buf.extend_from_slice(b"leftover");
        pool.release(buf);
        let buf = pool.acquire(8);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_buffers_are_discarded() {
        let pool = BufferPool::new(2, 16);
        pool.release(Vec::with_capacity(1024));
        assert_eq!(pool.stats().discards, 1);
        assert_eq!(pool.stats().returns, 0);
    }

    #[test]
    fn depth_bound_is_enforced() {
        let pool = BufferPool::new(1, 1024);
        pool.release(Vec::with_capacity(8));
        pool.release(Vec::with_capacity(8));
        let stats = pool.stats();
        assert_eq!(stats.returns, 1);
        assert_eq!(stats.discards, 1);
    }
}
