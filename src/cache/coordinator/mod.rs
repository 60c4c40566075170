//! Tiered read-through orchestration
//!
//! `CacheInner` wires the tiers, the stampede registry, the serializer
//! registry, the tag invalidation store and the buffer pool into the four
//! public operations: get-or-create, set, remove and remove-by-tag.
//!
//! The read path is strictly ordered: in-process tier, then one coalesced
//! population per (key, flags) that consults the distributed tier and only
//! then the underlying data factory. The population runs on its own detached
//! task; every caller, the one that created it included, is an ordinary
//! joiner, so no caller's lifetime can end the work while others still wait.
//! Distributed-tier failures degrade to misses and no-ops; they never fail a
//! caller's request. The distributed write-through happens on a background
//! task so the caller's latency is bounded by the slower of the factory and
//! the in-process insert.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::clock::Clock;
use crate::cache::invalidation::{TagInvalidationStore, Validity};
use crate::cache::item::{CacheItem, ErasedCacheItem};
use crate::cache::memory::{BufferChunk, BufferPool, PoolStats};
use crate::cache::serializer::{CacheSerializer, SerializerRegistry};
use crate::cache::stampede::{JoinOutcome, StampedeOutcome, StampedeRegistry, StampedeState};
use crate::cache::tags::{validate_invalidation_tag, TagSet};
use crate::cache::tier::{LocalStore, RemoteStore};
use crate::cache::types::{
    validate_key, CacheConfig, CacheError, CacheResult, EntryFlags, EntryOptions, ResolvedOptions,
    StampedeKey,
};
use crate::cache::wire::{try_parse, write_payload, PayloadParse};

/// Bounds every cacheable value type must satisfy.
///
/// `Default` backs the degenerate no-tier, no-factory path; `Clone` lets
/// shared values be handed out without re-deserializing.
pub trait CacheValue:
    Clone
    + Default
    + Send
    + Sync
    + serde::Serialize
    + serde::de::DeserializeOwned
    + 'static
{
}

impl<T> CacheValue for T where
    T: Clone
        + Default
        + Send
        + Sync
        + serde::Serialize
        + serde::de::DeserializeOwned
        + 'static
{
}

/// Engine state shared by every handle to one cache instance.
pub struct CacheInner {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    local: Arc<dyn LocalStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    pool: Arc<BufferPool>,
    serializers: SerializerRegistry,
    invalidation: TagInvalidationStore,
    registry: StampedeRegistry,
}

/// Publishes `Cancelled` if the population task unwinds without a terminal
/// outcome, so joiners are never left waiting on a vanished population.
struct PopulationGuard<'a, T: Clone + Default + Send + Sync + 'static> {
    state: &'a StampedeState<T>,
    registry: &'a StampedeRegistry,
    done: bool,
}

impl<'a, T: Clone + Default + Send + Sync + 'static> PopulationGuard<'a, T> {
    fn new(state: &'a StampedeState<T>, registry: &'a StampedeRegistry) -> Self {
        PopulationGuard {
            state,
            registry,
            done: false,
        }
    }

    fn publish(&mut self, outcome: StampedeOutcome<T>, store_reservations: u32) {
        self.done = true;
        self.state.publish(self.registry, outcome, store_reservations);
    }
}

impl<T: Clone + Default + Send + Sync + 'static> Drop for PopulationGuard<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.state
                .publish(self.registry, StampedeOutcome::Cancelled, 0);
        }
    }
}

impl CacheInner {
    pub fn new(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        local: Arc<dyn LocalStore>,
        remote: Option<Arc<dyn RemoteStore>>,
    ) -> Self {
        let pool = Arc::new(BufferPool::new(
            config.max_pooled_buffers,
            config.max_pooled_buffer_capacity,
        ));
        let invalidation = TagInvalidationStore::new(remote.clone());
        CacheInner {
            config,
            clock,
            local,
            remote,
            pool,
            serializers: SerializerRegistry::new(),
            invalidation,
            registry: StampedeRegistry::new(),
        }
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Populations currently coalescing callers.
    pub fn in_flight(&self) -> usize {
        self.registry.in_flight()
    }

    /// Read-through lookup. At most one factory invocation runs per distinct
    /// (key, flags) at a time; every concurrent caller shares its outcome.
    pub async fn get_or_create<T, F, Fut>(
        self: &Arc<Self>,
        key: &str,
        factory: F,
        tags: TagSet,
        options: &EntryOptions,
        token: Option<&CancellationToken>,
    ) -> CacheResult<T>
    where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = CacheResult<T>> + Send + 'static,
    {
        let resolved = options.resolve(&self.config);
        if let Err(err) = validate_key(key, self.config.max_key_length) {
            // Degrade to a factory-bypass call rather than failing the
            // request over a malformed key.
            log::error!("cache key rejected, bypassing cache: {}", err);
            if resolved.underlying_data() {
                return factory(CancellationToken::new()).await;
            }
            return Ok(T::default());
        }

        let stampede_key = StampedeKey::new(key, resolved.flags);
        loop {
            // Re-probed on every retry: a Busy round means another caller
            // just published, and its entry is likely in the local tier now.
            if resolved.local_read() {
                if let Some(value) = self.probe_local::<T>(key) {
                    return Ok(value);
                }
            }
            match self.registry.join_or_create::<T>(&stampede_key) {
                JoinOutcome::Created(state) => {
                    // The population is a detached task; this caller joins it
                    // like any other, so dropping this future cannot cancel
                    // the work out from under the remaining joiners.
                    tokio::spawn(Arc::clone(self).populate(
                        Arc::clone(&state),
                        key.to_string(),
                        factory,
                        tags,
                        resolved,
                    ));
                    return state.join_result(token).await;
                }
                JoinOutcome::Joined(state) => return state.join_result(token).await,
                JoinOutcome::Busy => tokio::task::yield_now().await,
                JoinOutcome::TypeMismatch => {
                    // Two value types under one key are racing; serve this
                    // caller directly without caching.
                    log::warn!(
                        "key {:?} is being populated with a different value type; bypassing cache",
                        key
                    );
                    if resolved.underlying_data() {
                        return factory(CancellationToken::new()).await;
                    }
                    return Ok(T::default());
                }
            }
        }
    }

    /// Unconditional write-through: a population whose factory yields the
    /// given value, with both tier reads disabled so nothing cached can be
    /// served back in its place. Serializer failures surface to the caller;
    /// a distributed write failure is logged and swallowed like any other
    /// write-through.
    pub async fn set<T: CacheValue>(
        self: &Arc<Self>,
        key: &str,
        value: T,
        tags: TagSet,
        options: &EntryOptions,
    ) -> CacheResult<()> {
        validate_key(key, self.config.max_key_length)?;
        let flags = options.flags.unwrap_or_default()
            | EntryFlags::DISABLE_LOCAL_READ
            | EntryFlags::DISABLE_DISTRIBUTED_READ;
        let options = EntryOptions {
            flags: Some(flags),
            ..options.clone()
        };
        self.get_or_create(key, move |_token| async move { Ok(value) }, tags, &options, None)
            .await?;
        Ok(())
    }

    /// Removes the key from both tiers. Distributed removal is awaited so the
    /// caller observes completion.
    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        validate_key(key, self.config.max_key_length)?;
        self.local.remove(key);
        if let Some(remote) = &self.remote {
            remote.remove(key).await?;
        }
        Ok(())
    }

    /// Invalidates every entry carrying `tag` (or everything, for the
    /// wildcard) as of now. Matching entries everywhere become stale
    /// immediately on this instance and eventually on others.
    pub fn remove_by_tag(&self, tag: &str) -> CacheResult<()> {
        validate_invalidation_tag(tag)?;
        self.invalidation.invalidate(tag, self.clock.now_ticks());
        Ok(())
    }

    /// In-process probe: hit only if the entry is live, the right type and
    /// provably fresh. Unresolved tag stamps fail closed as a miss without
    /// discarding the entry.
    fn probe_local<T: CacheValue>(&self, key: &str) -> Option<T> {
        let now = self.clock.now_ticks();
        let erased = self.local.get(key, now)?;
        let item = match erased.as_any().downcast_ref::<CacheItem<T>>() {
            Some(item) => item,
            None => {
                log::warn!("in-process entry for {:?} has an unexpected type; discarding", key);
                self.local.remove(key);
                return None;
            }
        };
        match self.invalidation.is_valid(item.creation_ticks(), item.tags()) {
            Validity::Valid => {}
            Validity::Invalid => {
                self.local.remove(key);
                return None;
            }
            // Stamp fetches are in flight; serve a miss but keep the entry
            // for when they resolve.
            Validity::Pending(_) => return None,
        }
        if !item.try_reserve() {
            self.local.remove(key);
            return None;
        }
        match item.get_reserved_value() {
            Ok(value) => Some(value),
            Err(err) => {
                log::error!("in-process entry for {:?} unreadable: {}", key, err);
                self.local.remove(key);
                None
            }
        }
    }

    /// Body of one coalesced population, run on its own detached task:
    /// distributed tier first, then the factory, publishing exactly one
    /// terminal outcome that every joined caller observes.
    async fn populate<T, F, Fut>(
        self: Arc<Self>,
        state: Arc<StampedeState<T>>,
        key: String,
        factory: F,
        tags: TagSet,
        resolved: ResolvedOptions,
    ) where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = CacheResult<T>> + Send + 'static,
    {
        let mut guard = PopulationGuard::new(&state, &self.registry);
        let (serializer, shared) = self.serializers.resolve::<T>();

        if resolved.distributed_read() {
            match self.fetch_remote::<T>(&key, &serializer, shared, &resolved).await {
                Ok(Some(fetched)) => {
                    self.finish(&mut guard, &key, fetched, &resolved, None);
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    guard.publish(StampedeOutcome::Fault(Arc::new(err)), 0);
                    return;
                }
            }
        }

        if state.is_abandoned() {
            guard.publish(StampedeOutcome::Cancelled, 0);
            return;
        }

        if !resolved.underlying_data() {
            guard.publish(StampedeOutcome::Empty, 0);
            return;
        }

        let value = match factory(state.population_token()).await {
            Ok(value) => value,
            Err(err) => {
                guard.publish(StampedeOutcome::Fault(Arc::new(err)), 0);
                return;
            }
        };

        let creation = self.clock.now_ticks();
        let l1_write = resolved.local_write();
        let l2_write = resolved.distributed_write() && self.remote.is_some();
        let payload = if !shared || l1_write || l2_write {
            let mut buf = self.pool.acquire(256);
            match serializer.serialize(&value, &mut buf) {
                Ok(()) => Some(buf),
                Err(err) => {
                    self.pool.release(buf);
                    guard.publish(StampedeOutcome::Fault(Arc::new(err)), 0);
                    return;
                }
            }
        } else {
            None
        };

        let frame = if l2_write {
            let payload_bytes = payload.as_deref().unwrap_or(&[]);
            let mut frame = self.pool.acquire(payload_bytes.len() + 64);
            write_payload(
                &mut frame,
                &key,
                &tags,
                resolved.flags,
                creation,
                resolved.expiration_ms(),
                payload_bytes,
            );
            Some(frame)
        } else {
            None
        };

        let size = payload.as_ref().map_or(0, Vec::len);
        let item: Arc<CacheItem<T>> = if shared {
            if let Some(buf) = payload {
                self.pool.release(buf);
            }
            Arc::new(CacheItem::immutable(value, creation, tags, size))
        } else {
            match payload {
                Some(buf) => Arc::new(CacheItem::mutable(
                    BufferChunk::pooled(buf),
                    serializer,
                    Arc::clone(&self.pool),
                    creation,
                    tags,
                )),
                None => Arc::new(CacheItem::immutable(value, creation, tags, size)),
            }
        };

        let fetched = PopulatedItem {
            item,
            expires_at: creation.saturating_add(resolved.local_expiration_ms()),
        };
        self.finish(&mut guard, &key, fetched, &resolved, frame);
    }

    /// Publishes the item, inserts it into the in-process tier, kicks off the
    /// distributed write-through and drops the creation reference.
    fn finish<T: CacheValue>(
        &self,
        guard: &mut PopulationGuard<'_, T>,
        key: &str,
        populated: PopulatedItem<T>,
        resolved: &ResolvedOptions,
        frame: Option<Vec<u8>>,
    ) {
        let PopulatedItem { item, expires_at } = populated;
        let store_entry = resolved.local_write();
        let store_reservations =
            if store_entry && item.needs_eviction_callback() { 1 } else { 0 };
        guard.publish(
            StampedeOutcome::Value(Arc::clone(&item)),
            store_reservations,
        );
        if store_entry {
            let erased: Arc<dyn ErasedCacheItem> = Arc::clone(&item) as _;
            self.local.insert(key, erased, expires_at);
        }
        if let (Some(frame), Some(remote)) = (frame, &self.remote) {
            let remote = Arc::clone(remote);
            let key = key.to_string();
            let pool = Arc::clone(&self.pool);
            let ttl = resolved.expiration;
            tokio::spawn(async move {
                if let Err(err) = remote.set(&key, &frame, Some(ttl)).await {
                    log::warn!("distributed write-through for {:?} failed: {}", key, err);
                }
                pool.release(frame);
            });
        }
        item.release();
    }

    /// Distributed-tier read. Returns an adoptable item on a fresh hit; a
    /// non-frame outcome (miss, corruption, foreign frame, staleness,
    /// unresolved stamps, transport error) is a miss. A payload that parses
    /// but cannot be deserialized is an error: stored data is unreadable and
    /// silently regenerating it would mask the defect.
    async fn fetch_remote<T: CacheValue>(
        &self,
        key: &str,
        serializer: &Arc<dyn CacheSerializer<T>>,
        shared: bool,
        resolved: &ResolvedOptions,
    ) -> CacheResult<Option<PopulatedItem<T>>> {
        let Some(remote) = self.remote.as_ref() else {
            return Ok(None);
        };
        let mut buf = self.pool.acquire(256);
        match remote.get_into(key, &mut buf).await {
            Ok(true) => {}
            Ok(false) => {
                self.pool.release(buf);
                return Ok(None);
            }
            Err(err) => {
                log::warn!("distributed read for {:?} failed: {}", key, err);
                self.pool.release(buf);
                return Ok(None);
            }
        }
        let now = self.clock.now_ticks();
        let fields = match try_parse(&buf, key, now, &self.invalidation) {
            PayloadParse::Success(fields) if fields.pending_tags.is_empty() => fields,
            PayloadParse::Success(fields) => {
                // Freshness unconfirmed while stamps resolve; fail closed.
                log::debug!(
                    "distributed entry for {:?} has {} unresolved tag stamps; treating as miss",
                    key,
                    fields.pending_tags.len()
                );
                self.pool.release(buf);
                return Ok(None);
            }
            PayloadParse::FormatNotRecognized => {
                log::debug!("distributed entry for {:?} written by an incompatible producer", key);
                self.pool.release(buf);
                return Ok(None);
            }
            PayloadParse::InvalidData => {
                log::warn!("distributed entry for {:?} is corrupt; treating as miss", key);
                self.pool.release(buf);
                return Ok(None);
            }
            PayloadParse::KeyMismatch => {
                log::warn!("distributed entry for {:?} embeds a different key", key);
                self.pool.release(buf);
                return Ok(None);
            }
            PayloadParse::Expired | PayloadParse::Invalidated => {
                self.pool.release(buf);
                return Ok(None);
            }
        };

        let entry_deadline = fields.creation_ticks.saturating_add(fields.duration_ms);
        let expires_at = now
            .saturating_add(resolved.local_expiration_ms())
            .min(entry_deadline);

        let item: Arc<CacheItem<T>> = if shared {
            let payload = &buf[fields.payload.clone()];
            let value = match serializer.deserialize(payload) {
                Ok(value) => value,
                Err(err) => {
                    log::error!("distributed payload for {:?} undecodable: {}", key, err);
                    self.pool.release(buf);
                    return Err(err);
                }
            };
            let size = fields.payload.len();
            let item = Arc::new(CacheItem::immutable(
                value,
                fields.creation_ticks,
                fields.tags,
                size,
            ));
            self.pool.release(buf);
            item
        } else {
            // Adopt the payload range inside the fetched frame, zero-copy.
            let chunk =
                BufferChunk::pooled_slice(buf, fields.payload.start, fields.payload.len());
            Arc::new(CacheItem::mutable(
                chunk,
                Arc::clone(serializer),
                Arc::clone(&self.pool),
                fields.creation_ticks,
                fields.tags,
            ))
        };
        Ok(Some(PopulatedItem { item, expires_at }))
    }
}

struct PopulatedItem<T: Send + Sync + 'static> {
    item: Arc<CacheItem<T>>,
    expires_at: u64,
}
