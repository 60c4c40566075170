//! Distributed (L2) tier
//!
//! The engine treats L2 as an opaque byte-oriented store keyed by string.
//! Failures here are never allowed to fail a caller's request: the
//! orchestrator logs and treats a failed read as a miss and a failed write as
//! a no-op.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::types::CacheResult;

/// Contract of the distributed tier.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], expiration: Option<Duration>) -> CacheResult<()>;
    async fn remove(&self, key: &str) -> CacheResult<()>;

    /// Buffer-writer variant of `get` that appends into a caller-supplied
    /// buffer, avoiding an intermediate allocation where the transport
    /// supports it. Returns whether the key existed.
    async fn get_into(&self, key: &str, out: &mut Vec<u8>) -> CacheResult<bool> {
        match self.get(key).await? {
            Some(bytes) => {
                out.extend_from_slice(&bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

struct RemoteEntry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Process-local `RemoteStore` for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    entries: DashMap<String, RemoteEntry>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.expires_at {
                Some(deadline) if deadline <= Instant::now() => true,
                _ => return Ok(Some(entry.bytes.clone())),
            },
            None => return Ok(None),
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], expiration: Option<Duration>) -> CacheResult<()> {
        self.entries.insert(
            key.to_string(),
            RemoteEntry {
                bytes: value.to_vec(),
                expires_at: expiration.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let store = InMemoryRemoteStore::new();
        store.set("k", b"payload", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"payload".to_vec()));
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_into_appends_to_the_buffer() {
        let store = InMemoryRemoteStore::new();
        store.set("k", b"abc", None).await.unwrap();
        let mut buf = Vec::new();
        assert!(store.get_into("k", &mut buf).await.unwrap());
        assert_eq!(buf, b"abc");
        assert!(!store.get_into("missing", &mut buf).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let store = InMemoryRemoteStore::new();
        store
            .set("k", b"v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
