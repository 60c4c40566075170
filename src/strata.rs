//! Public cache handle and builder

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::clock::{Clock, SystemClock};
use crate::cache::coordinator::{CacheInner, CacheValue};
use crate::cache::memory::PoolStats;
use crate::cache::serializer::CacheSerializer;
use crate::cache::tags::TagSet;
use crate::cache::tier::{InMemoryLocalStore, LocalStore, RemoteStore};
use crate::cache::types::{CacheConfig, CacheResult, EntryOptions};

/// Tiered, stampede-protected cache.
///
/// Reads go in-process tier first, then the distributed tier, then the
/// underlying data factory, with at most one factory invocation in flight
/// per key at a time. Handles are cheap to clone and share one engine.
///
/// ```no_run
/// # async fn demo() -> strata_cache::CacheResult<()> {
/// let cache = strata_cache::StrataCache::builder().build();
/// let user: String = cache
///     .get_or_create("user:42", |_cancel| async {
///         Ok("loaded from the database".to_string())
///     })
///     .await?;
/// # let _ = user;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StrataCache {
    inner: Arc<CacheInner>,
}

impl StrataCache {
    pub fn builder() -> StrataCacheBuilder {
        StrataCacheBuilder::default()
    }

    /// Read-through lookup with instance-default options and no tags.
    pub async fn get_or_create<T, F, Fut>(&self, key: &str, factory: F) -> CacheResult<T>
    where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = CacheResult<T>> + Send + 'static,
    {
        self.inner
            .get_or_create(key, factory, TagSet::Empty, &EntryOptions::default(), None)
            .await
    }

    /// Read-through lookup with explicit tags, options and an optional
    /// per-caller cancellation token.
    pub async fn get_or_create_with<T, F, Fut, I, S>(
        &self,
        key: &str,
        factory: F,
        tags: I,
        options: &EntryOptions,
        token: Option<&CancellationToken>,
    ) -> CacheResult<T>
    where
        T: CacheValue,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = CacheResult<T>> + Send + 'static,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags = TagSet::new(tags)?;
        self.inner.get_or_create(key, factory, tags, options, token).await
    }

    /// Stores `value` under `key` with instance-default options and no tags.
    pub async fn set<T: CacheValue>(&self, key: &str, value: T) -> CacheResult<()> {
        self.inner
            .set(key, value, TagSet::Empty, &EntryOptions::default())
            .await
    }

    /// Stores `value` with explicit tags and options.
    pub async fn set_with<T, I, S>(
        &self,
        key: &str,
        value: T,
        tags: I,
        options: &EntryOptions,
    ) -> CacheResult<()>
    where
        T: CacheValue,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags = TagSet::new(tags)?;
        self.inner.set(key, value, tags, options).await
    }

    /// Removes `key` from both tiers.
    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        self.inner.remove(key).await
    }

    /// Invalidates every entry carrying `tag`; the wildcard `"*"`
    /// invalidates everything.
    pub fn remove_by_tag(&self, tag: &str) -> CacheResult<()> {
        self.inner.remove_by_tag(tag)
    }

    /// Registers a custom byte codec for `T`, replacing the bincode default.
    pub fn register_serializer<T: 'static>(&self, serializer: Arc<dyn CacheSerializer<T>>) {
        self.inner.serializers().register(serializer);
    }

    /// Marks `T` as safe to hand to many callers without a defensive
    /// per-consumer copy.
    pub fn mark_shared<T: 'static>(&self) {
        self.inner.serializers().mark_shared::<T>();
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool_stats()
    }

    /// Populations currently coalescing callers.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }
}

/// Builder for [`StrataCache`]. Every component has a production default:
/// wall clock, built-in in-process store, no distributed tier.
#[derive(Default)]
pub struct StrataCacheBuilder {
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    local: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl StrataCacheBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.local = Some(store);
        self
    }

    pub fn remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(store);
        self
    }

    pub fn build(self) -> StrataCache {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let local = self
            .local
            .unwrap_or_else(|| Arc::new(InMemoryLocalStore::new(self.config.local_capacity_bytes)));
        StrataCache {
            inner: Arc::new(CacheInner::new(self.config, clock, local, self.remote)),
        }
    }
}
