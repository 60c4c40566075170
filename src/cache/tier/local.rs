//! In-process (L1) tier
//!
//! The engine treats L1 as an opaque capacity-bounded key/value store. The
//! store owns one reservation per entry whose item requires an eviction
//! callback, and must release it whenever the entry leaves the store for any
//! reason (eviction, replacement, explicit removal, lazy expiry).
//!
//! The built-in store keeps the policy deliberately simple: total-bytes
//! bound with oldest-insertion eviction. Sophisticated eviction belongs to
//! embedders plugging their own store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::item::ErasedCacheItem;

/// Contract of the in-process tier. All operations are synchronous and
/// non-blocking.
pub trait LocalStore: Send + Sync + 'static {
    /// Returns the live item for `key`, or `None` on miss or lazy expiry.
    fn get(&self, key: &str, now_ticks: u64) -> Option<Arc<dyn ErasedCacheItem>>;
    /// Stores an entry. The caller has already taken the store's reservation
    /// when `item.needs_eviction_callback()` is true.
    fn insert(&self, key: &str, item: Arc<dyn ErasedCacheItem>, expires_at_ticks: u64);
    /// Removes an entry, releasing the store's reservation. Returns whether
    /// an entry existed.
    fn remove(&self, key: &str) -> bool;
}

struct StoredEntry {
    item: Arc<dyn ErasedCacheItem>,
    size: u64,
    expires_at_ticks: u64,
    seq: u64,
}

/// Size-bounded DashMap-backed store with oldest-first eviction.
pub struct InMemoryLocalStore {
    entries: DashMap<String, StoredEntry>,
    total_bytes: AtomicU64,
    capacity_bytes: u64,
    next_seq: AtomicU64,
}

impl InMemoryLocalStore {
    pub fn new(capacity_bytes: u64) -> Self {
        InMemoryLocalStore {
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            capacity_bytes,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drop_entry(&self, entry: StoredEntry) {
        self.total_bytes.fetch_sub(entry.size, Ordering::AcqRel);
        if entry.item.needs_eviction_callback() {
            entry.item.release();
        }
    }

    fn evict_until_within_capacity(&self) {
        while self.total_bytes.load(Ordering::Acquire) > self.capacity_bytes {
            let mut victim: Option<(String, u64)> = None;
            for entry in self.entries.iter() {
                let seq = entry.value().seq;
                if victim.as_ref().map_or(true, |(_, best)| seq < *best) {
                    victim = Some((entry.key().clone(), seq));
                }
            }
            let Some((key, _)) = victim else { return };
            if let Some((_, entry)) = self.entries.remove(&key) {
                self.drop_entry(entry);
            }
        }
    }
}

impl LocalStore for InMemoryLocalStore {
    fn get(&self, key: &str, now_ticks: u64) -> Option<Arc<dyn ErasedCacheItem>> {
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at_ticks > now_ticks {
                return Some(Arc::clone(&entry.item));
            }
        }
        // Lazy expiry sweep for this key. The predicate re-checks under the
        // map lock, so a fresh entry racing in after the read above survives.
        if let Some((_, entry)) = self
            .entries
            .remove_if(key, |_, entry| entry.expires_at_ticks <= now_ticks)
        {
            self.drop_entry(entry);
        }
        None
    }

    fn insert(&self, key: &str, item: Arc<dyn ErasedCacheItem>, expires_at_ticks: u64) {
        let size = item.estimated_size() as u64;
        let entry = StoredEntry {
            item,
            size,
            expires_at_ticks,
            seq: self.next_seq.fetch_add(1, Ordering::AcqRel),
        };
        self.total_bytes.fetch_add(size, Ordering::AcqRel);
        if let Some(previous) = self.entries.insert(key.to_string(), entry) {
            self.drop_entry(previous);
        }
        self.evict_until_within_capacity();
    }

    fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.drop_entry(entry);
                true
            }
            None => false,
        }
    }
}
