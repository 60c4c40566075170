//! Reference-counted cache items
//!
//! A `CacheItem` is the unit of cached state shared between the in-flight
//! population, the in-process store and every concurrent caller holding a
//! reservation.
//!
//! Two shapes exist: `Immutable` holds the value directly and hands out
//! clones, which is safe when the type is structurally cheap to share;
//! `Mutable` holds the serialized payload and deserializes a fresh copy per
//! consumer, for types that must not be aliased across callers.
//!
//! The reservation protocol exists to guard the Mutable shape's pooled
//! buffer against reuse while a consumer is reading it. For Mutable items
//! the count starts at one (the creation reference) and never rises back up
//! from zero: a fully released item stays burned, and the one-time cleanup
//! (recycling the buffer) runs exactly once, on the thread that performs
//! the zero transition. Immutable items have nothing to guard (their value
//! lives as long as the allocation), so reserve and release are no-ops for
//! them and they can never burn.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::memory::{BufferChunk, BufferPool};
use crate::cache::serializer::CacheSerializer;
use crate::cache::tags::TagSet;
use crate::cache::types::{CacheError, CacheResult};

/// Type-erased view of a cache item, held by the in-process store.
pub trait ErasedCacheItem: Send + Sync + 'static {
    /// Atomically takes a reservation unless the item is already burned (or
    /// the count is about to wrap). Every successful reserve must be paired
    /// with exactly one release. Trivially succeeds for items without
    /// pooled state.
    fn try_reserve(&self) -> bool;
    /// Drops one reservation; returns true iff this was the zero transition
    /// (cleanup has run). No-op for items without pooled state.
    fn release(&self) -> bool;
    fn creation_ticks(&self) -> u64;
    fn tags(&self) -> &TagSet;
    /// Whether the store must call [`ErasedCacheItem::release`] when the
    /// entry leaves the store. Items without pooled state skip the callback.
    fn needs_eviction_callback(&self) -> bool;
    /// Serialized size, used for store byte accounting.
    fn estimated_size(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

enum ItemShape<T> {
    Immutable(T),
    Mutable {
        buffer: Mutex<Option<BufferChunk>>,
        serializer: Arc<dyn CacheSerializer<T>>,
        pool: Arc<BufferPool>,
    },
}

pub struct CacheItem<T: Send + Sync + 'static> {
    refcount: AtomicU32,
    creation_ticks: u64,
    tags: TagSet,
    size: usize,
    shape: ItemShape<T>,
}

impl<T: Clone + Send + Sync + 'static> CacheItem<T> {
    /// Immutable item holding the value directly. `size` is the serialized
    /// length when known, used for store accounting.
    pub fn immutable(value: T, creation_ticks: u64, tags: TagSet, size: usize) -> Self {
        CacheItem {
            refcount: AtomicU32::new(1),
            creation_ticks,
            tags,
            size,
            shape: ItemShape::Immutable(value),
        }
    }

    /// Mutable item owning a serialized payload; consumers get independent
    /// deserialized copies. The buffer is recycled to `pool` on the final
    /// release.
    pub fn mutable(
        buffer: BufferChunk,
        serializer: Arc<dyn CacheSerializer<T>>,
        pool: Arc<BufferPool>,
        creation_ticks: u64,
        tags: TagSet,
    ) -> Self {
        let size = buffer.len();
        CacheItem {
            refcount: AtomicU32::new(1),
            creation_ticks,
            tags,
            size,
            shape: ItemShape::Mutable {
                buffer: Mutex::new(Some(buffer)),
                serializer,
                pool,
            },
        }
    }

    /// Whether this item carries pooled state guarded by the reservation
    /// protocol. Immutable items have nothing to protect: their value lives
    /// as long as the allocation, so reserve/release are no-ops for them.
    fn has_pooled_state(&self) -> bool {
        matches!(self.shape, ItemShape::Mutable { .. })
    }

    /// Adds `count` reservations in bulk during result publication. Only
    /// legal while the creation reference is still held.
    pub(crate) fn add_reservations(&self, count: u32) {
        if count == 0 || !self.has_pooled_state() {
            return;
        }
        let previous = self.refcount.fetch_add(count, Ordering::AcqRel);
        debug_assert!(previous > 0, "bulk reserve on a burned item");
    }

    /// Extracts the value owed to one reservation, then consumes that
    /// reservation. Must be called at most once per reserve.
    pub fn get_reserved_value(&self) -> CacheResult<T> {
        match &self.shape {
            ItemShape::Immutable(value) => Ok(value.clone()),
            ItemShape::Mutable {
                buffer, serializer, ..
            } => {
                let result = {
                    let guard = match buffer.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    match guard.as_ref() {
                        Some(chunk) => serializer.deserialize(chunk.as_slice()),
                        // The buffer was recycled while we supposedly held a
                        // reservation: a reservation-protocol violation.
                        None => Err(CacheError::ItemDisposed),
                    }
                };
                self.release();
                result
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn reservation_count(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    fn cleanup(&self) {
        if let ItemShape::Mutable { buffer, pool, .. } = &self.shape {
            let chunk = {
                let mut guard = match buffer.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.take()
            };
            if let Some(chunk) = chunk {
                chunk.recycle(pool);
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ErasedCacheItem for CacheItem<T> {
    fn try_reserve(&self) -> bool {
        if !self.has_pooled_state() {
            return true;
        }
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 || current == u32::MAX {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self) -> bool {
        if !self.has_pooled_state() {
            return false;
        }
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                // Over-release: a protocol bug in the caller, not a
                // recoverable state.
                debug_assert!(false, "cache item released more often than reserved");
                log::error!("cache item released more often than reserved");
                return false;
            }
            match self.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 1 {
                        self.cleanup();
                        return true;
                    }
                    return false;
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn creation_ticks(&self) -> u64 {
        self.creation_ticks
    }

    fn tags(&self) -> &TagSet {
        &self.tags
    }

    fn needs_eviction_callback(&self) -> bool {
        matches!(self.shape, ItemShape::Mutable { .. })
    }

    fn estimated_size(&self) -> usize {
        self.size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
