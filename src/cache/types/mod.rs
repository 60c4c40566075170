//! Core value types shared across the cache engine
//!
//! Entry flags, per-call options with instance-default merging, instance
//! configuration and the stampede coordination key.

pub mod error_types;

use std::sync::Arc;
use std::time::Duration;

pub use error_types::{CacheError, CacheResult};

bitflags::bitflags! {
    /// Per-entry behavior flags.
    ///
    /// Flags participate in the stampede key: two requests with different
    /// flags never coalesce, since they may touch different tiers. The bit
    /// values are persisted in the distributed wire format, so they are
    /// append-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u64 {
        /// Do not probe the in-process (L1) tier.
        const DISABLE_LOCAL_READ = 1 << 0;
        /// Do not store the result in the in-process (L1) tier.
        const DISABLE_LOCAL_WRITE = 1 << 1;
        /// Do not probe the distributed (L2) tier.
        const DISABLE_DISTRIBUTED_READ = 1 << 2;
        /// Do not write the result through to the distributed (L2) tier.
        const DISABLE_DISTRIBUTED_WRITE = 1 << 3;
        /// Do not invoke the underlying data factory; a degenerate default
        /// value is produced when every cache tier misses.
        const DISABLE_UNDERLYING_DATA = 1 << 4;

        /// Bypass the in-process tier entirely.
        const DISABLE_LOCAL_CACHE =
            Self::DISABLE_LOCAL_READ.bits() | Self::DISABLE_LOCAL_WRITE.bits();
        /// Bypass the distributed tier entirely.
        const DISABLE_DISTRIBUTED_CACHE =
            Self::DISABLE_DISTRIBUTED_READ.bits() | Self::DISABLE_DISTRIBUTED_WRITE.bits();
    }
}

impl Default for EntryFlags {
    fn default() -> Self {
        EntryFlags::empty()
    }
}

/// Per-call options. Unset fields fall back to the instance defaults in
/// [`CacheConfig`].
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
    /// Overall lifetime of the entry (drives the distributed tier and the
    /// wire-format duration field).
    pub expiration: Option<Duration>,
    /// Lifetime of the entry in the in-process tier; never extends past
    /// `expiration`.
    pub local_expiration: Option<Duration>,
    /// Behavior flags, merged (union) with the instance defaults.
    pub flags: Option<EntryFlags>,
}

impl EntryOptions {
    pub fn with_expiration(expiration: Duration) -> Self {
        EntryOptions {
            expiration: Some(expiration),
            ..Default::default()
        }
    }

    pub fn with_flags(flags: EntryFlags) -> Self {
        EntryOptions {
            flags: Some(flags),
            ..Default::default()
        }
    }

    pub(crate) fn resolve(&self, config: &CacheConfig) -> ResolvedOptions {
        let expiration = self.expiration.unwrap_or(config.default_expiration);
        let local_expiration = self
            .local_expiration
            .unwrap_or(config.default_local_expiration)
            .min(expiration);
        let flags = self.flags.unwrap_or_default() | config.default_flags;
        ResolvedOptions {
            expiration,
            local_expiration,
            flags,
        }
    }
}

/// Options after merging with instance defaults.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedOptions {
    pub expiration: Duration,
    pub local_expiration: Duration,
    pub flags: EntryFlags,
}

impl ResolvedOptions {
    pub fn local_read(&self) -> bool {
        !self.flags.contains(EntryFlags::DISABLE_LOCAL_READ)
    }

    pub fn local_write(&self) -> bool {
        !self.flags.contains(EntryFlags::DISABLE_LOCAL_WRITE)
    }

    pub fn distributed_read(&self) -> bool {
        !self.flags.contains(EntryFlags::DISABLE_DISTRIBUTED_READ)
    }

    pub fn distributed_write(&self) -> bool {
        !self.flags.contains(EntryFlags::DISABLE_DISTRIBUTED_WRITE)
    }

    pub fn underlying_data(&self) -> bool {
        !self.flags.contains(EntryFlags::DISABLE_UNDERLYING_DATA)
    }

    pub fn expiration_ms(&self) -> u64 {
        self.expiration.as_millis().min(u64::MAX as u128) as u64
    }

    pub fn local_expiration_ms(&self) -> u64 {
        self.local_expiration.as_millis().min(u64::MAX as u128) as u64
    }
}

/// Instance-level configuration with production defaults.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Default overall entry lifetime.
    pub default_expiration: Duration,
    /// Default in-process entry lifetime.
    pub default_local_expiration: Duration,
    /// Flags applied to every entry in addition to per-call flags.
    pub default_flags: EntryFlags,
    /// Longest accepted cache key, in bytes.
    pub max_key_length: usize,
    /// Byte budget of the built-in in-process store.
    pub local_capacity_bytes: u64,
    /// Free-list depth of the serialization buffer pool.
    pub max_pooled_buffers: usize,
    /// Buffers above this capacity are dropped instead of pooled.
    pub max_pooled_buffer_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            default_expiration: Duration::from_secs(5 * 60),
            default_local_expiration: Duration::from_secs(5 * 60),
            default_flags: EntryFlags::empty(),
            max_key_length: 1024,
            local_capacity_bytes: 64 * 1024 * 1024,
            max_pooled_buffers: 64,
            max_pooled_buffer_capacity: 1024 * 1024,
        }
    }
}

/// Identity of one coalesced population: one live stampede state exists per
/// distinct key per key+flags combination at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StampedeKey {
    pub key: Arc<str>,
    pub flags: EntryFlags,
}

impl StampedeKey {
    pub fn new(key: &str, flags: EntryFlags) -> Self {
        StampedeKey {
            key: Arc::from(key),
            flags,
        }
    }
}

/// Validates a caller-supplied cache key.
///
/// An invalid key does not fail the request: the orchestrator degrades to
/// factory-bypass behavior and logs the violation.
pub(crate) fn validate_key(key: &str, max_len: usize) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_key("key is empty"));
    }
    if key.len() > max_len {
        return Err(CacheError::invalid_key(format!(
            "key length {} exceeds maximum {}",
            key.len(),
            max_len
        )));
    }
    if key.chars().any(|c| c.is_control()) {
        return Err(CacheError::invalid_key("key contains control characters"));
    }
    Ok(())
}
