//! # strata-cache
//!
//! Tiered, stampede-protected caching: an in-process tier backed by an
//! optional distributed tier, with read-through population, per-key request
//! coalescing and tag-based invalidation.
//!
//! ## Highlights
//!
//! - **Single-flight population**: concurrent requests for the same key
//!   share one factory invocation and one result.
//! - **Two tiers**: a synchronous in-process store plus an optional
//!   asynchronous distributed store, written through in the background.
//! - **Tag invalidation**: entries carry tags; invalidating a tag (or the
//!   `"*"` wildcard) makes matching entries everywhere stale immediately on
//!   this instance and eventually on others.
//! - **Self-describing wire format**: distributed entries are framed so
//!   corruption, foreign data and staleness all degrade to ordinary misses.
//! - **Pluggable everything**: tiers, per-type serializers, and the clock
//!   are trait objects with production defaults.
//!
//! ```no_run
//! # async fn demo() -> strata_cache::CacheResult<()> {
//! use strata_cache::{EntryOptions, StrataCache};
//!
//! let cache = StrataCache::builder().build();
//! let report: String = cache
//!     .get_or_create_with(
//!         "report:today",
//!         |_cancel| async { Ok("expensive aggregation".to_string()) },
//!         ["reports"],
//!         &EntryOptions::with_expiration(std::time::Duration::from_secs(60)),
//!         None,
//!     )
//!     .await?;
//! cache.remove_by_tag("reports")?;
//! # let _ = report;
//! # Ok(())
//! # }
//! ```

pub mod cache;
mod strata;

pub use cache::clock::{Clock, ManualClock, SystemClock};
pub use cache::coordinator::CacheValue;
pub use cache::memory::PoolStats;
pub use cache::serializer::{BincodeSerializer, CacheSerializer};
pub use cache::tags::{TagSet, WILDCARD_TAG};
pub use cache::tier::{InMemoryLocalStore, InMemoryRemoteStore, LocalStore, RemoteStore};
pub use cache::types::{CacheConfig, CacheError, CacheResult, EntryFlags, EntryOptions};
pub use strata::{StrataCache, StrataCacheBuilder};

pub use tokio_util::sync::CancellationToken;
