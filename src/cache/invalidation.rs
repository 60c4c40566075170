//! Tag invalidation timestamps
//!
//! Per-tag and wildcard invalidation is approximate and eventually
//! consistent by design: `remove_by_tag` records a logical timestamp locally
//! and propagates it to the distributed tier best-effort. An item is stale if
//! its creation timestamp is at or before the invalidation timestamp of any
//! of its tags, or of the wildcard.
//!
//! The first check of a tag this instance has never seen kicks off an
//! asynchronous read of that tag's stamp from the distributed store; until
//! the read resolves the tag is conservatively treated as possibly
//! invalidating (fail closed), so stale data is never served during the race.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cache::tags::{TagSet, WILDCARD_TAG};
use crate::cache::tier::remote::RemoteStore;

/// Stamp value meaning "distributed fetch still in flight".
const PENDING: u64 = u64::MAX;

/// Key prefix under which tag stamps live in the distributed store.
const TAG_KEY_PREFIX: &str = "__tag__/";

/// Observed invalidation stamp for one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagStamp {
    /// Most recent invalidation ticks (0 = never invalidated).
    Resolved(u64),
    /// Stamp unknown until the distributed read completes.
    Pending,
}

/// Freshness verdict for an item against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
    /// Not provably stale, but these stamps are still unresolved; callers
    /// fail closed.
    Pending(Vec<Arc<str>>),
}

#[derive(Debug)]
struct StampCell {
    ticks: AtomicU64,
}

impl StampCell {
    fn resolved(ticks: u64) -> Arc<Self> {
        Arc::new(StampCell {
            ticks: AtomicU64::new(ticks),
        })
    }

    fn pending() -> Arc<Self> {
        Arc::new(StampCell {
            ticks: AtomicU64::new(PENDING),
        })
    }

    fn read(&self) -> TagStamp {
        match self.ticks.load(Ordering::Acquire) {
            PENDING => TagStamp::Pending,
            ticks => TagStamp::Resolved(ticks),
        }
    }

    /// Monotonic update that also resolves a pending cell.
    fn raise_to(&self, ticks: u64) {
        let mut current = self.ticks.load(Ordering::Acquire);
        loop {
            let next = if current == PENDING {
                ticks
            } else {
                current.max(ticks)
            };
            match self.ticks.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Per-tag and wildcard invalidation state for one cache instance.
pub struct TagInvalidationStore {
    stamps: DashMap<Arc<str>, Arc<StampCell>>,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl TagInvalidationStore {
    pub fn new(remote: Option<Arc<dyn RemoteStore>>) -> Self {
        TagInvalidationStore {
            stamps: DashMap::new(),
            remote,
        }
    }

    /// Records an invalidation for `tag` (or globally, for the wildcard) at
    /// `now_ticks`, and propagates it to the distributed tier best-effort.
    pub fn invalidate(&self, tag: &str, now_ticks: u64) {
        match self.stamps.entry(Arc::from(tag)) {
            Entry::Occupied(cell) => cell.get().raise_to(now_ticks),
            Entry::Vacant(slot) => {
                slot.insert(StampCell::resolved(now_ticks));
            }
        }
        if let Some(remote) = &self.remote {
            let remote = Arc::clone(remote);
            let key = tag_key(tag);
            spawn_best_effort(async move {
                if let Err(err) = remote.set(&key, &now_ticks.to_le_bytes(), None).await {
                    log::warn!("tag invalidation write to distributed tier failed: {}", err);
                }
            });
        }
    }

    /// Current stamp for `tag`, starting a background distributed fetch on
    /// first touch.
    pub fn stamp_for(&self, tag: &str) -> TagStamp {
        if let Some(cell) = self.stamps.get(tag) {
            return cell.read();
        }
        let remote = match &self.remote {
            Some(remote) => Arc::clone(remote),
            None => {
                // No distributed tier: an unknown tag has never been
                // invalidated anywhere this instance can observe.
                return self
                    .stamps
                    .entry(Arc::from(tag))
                    .or_insert_with(|| StampCell::resolved(0))
                    .read();
            }
        };
        match self.stamps.entry(Arc::from(tag)) {
            Entry::Occupied(cell) => cell.get().read(),
            Entry::Vacant(slot) => {
                let cell = StampCell::pending();
                slot.insert(Arc::clone(&cell));
                let key = tag_key(tag);
                let tag_name: Arc<str> = Arc::from(tag);
                spawn_best_effort(async move {
                    let ticks = match remote.get(&key).await {
                        Ok(Some(bytes)) if bytes.len() == 8 => u64::from_le_bytes([
                            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6],
                            bytes[7],
                        ]),
                        Ok(Some(_)) => {
                            log::warn!("malformed stamp for tag {:?} in distributed tier", tag_name);
                            0
                        }
                        Ok(None) => 0,
                        Err(err) => {
                            // The tier is unreachable; resolve to "never
                            // invalidated" so reads are not wedged forever.
                            log::warn!("tag stamp read for {:?} failed: {}", tag_name, err);
                            0
                        }
                    };
                    cell.raise_to(ticks);
                });
                TagStamp::Pending
            }
        }
    }

    /// Checks an item's creation time against the wildcard and every tag.
    ///
    /// Every tag is probed even after the first stale one, so all pending
    /// distributed lookups are started on this call.
    pub fn is_valid(&self, creation_ticks: u64, tags: &TagSet) -> Validity {
        let mut pending: Vec<Arc<str>> = Vec::new();
        let mut invalid = false;
        match self.stamp_for(WILDCARD_TAG) {
            TagStamp::Resolved(ticks) if creation_ticks <= ticks => invalid = true,
            TagStamp::Resolved(_) => {}
            TagStamp::Pending => pending.push(Arc::from(WILDCARD_TAG)),
        }
        for tag in tags.iter() {
            match self.stamp_for(tag) {
                TagStamp::Resolved(ticks) if creation_ticks <= ticks => invalid = true,
                TagStamp::Resolved(_) => {}
                TagStamp::Pending => pending.push(Arc::from(tag)),
            }
        }
        if invalid {
            Validity::Invalid
        } else if pending.is_empty() {
            Validity::Valid
        } else {
            Validity::Pending(pending)
        }
    }
}

fn tag_key(tag: &str) -> String {
    format!("{}{}", TAG_KEY_PREFIX, tag)
}

fn spawn_best_effort<F>(future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => {
            log::debug!("no async runtime; skipping distributed tag propagation");
        }
    }
}
