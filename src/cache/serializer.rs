//! Pluggable per-type serialization
//!
//! Serializers are resolved once per value type and memoized by `TypeId` in a
//! registry owned by the cache instance. The default codec is bincode over
//! serde; embedders can register a custom codec per type and can mark a type
//! *shared*, meaning its values are safe to hand to many callers directly
//! instead of deserializing a defensive copy per consumer.

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::types::{CacheError, CacheResult};

/// Byte codec for one value type.
pub trait CacheSerializer<T>: Send + Sync + 'static {
    fn serialize(&self, value: &T, out: &mut Vec<u8>) -> CacheResult<()>;
    fn deserialize(&self, data: &[u8]) -> CacheResult<T>;
}

/// Default codec: bincode's serde integration with the standard config.
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        BincodeSerializer {
            _marker: PhantomData,
        }
    }
}

impl<T> CacheSerializer<T> for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn serialize(&self, value: &T, out: &mut Vec<u8>) -> CacheResult<()> {
        bincode::serde::encode_into_std_write(value, out, bincode::config::standard())
            .map_err(|err| CacheError::serialization(err.to_string()))?;
        Ok(())
    }

    fn deserialize(&self, data: &[u8]) -> CacheResult<T> {
        bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(|err| CacheError::deserialization(err.to_string()))
    }
}

struct RegistryEntry {
    // Arc<dyn CacheSerializer<T>> behind Any; filled lazily so a type can be
    // marked shared before its serializer is resolved.
    serializer: Option<Arc<dyn Any + Send + Sync>>,
    shared: bool,
}

/// Instance-owned serializer registry, memoized by value type.
pub struct SerializerRegistry {
    entries: DashMap<TypeId, RegistryEntry>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        SerializerRegistry {
            entries: DashMap::new(),
        }
    }

    /// Registers a custom serializer for `T`, replacing any resolved default.
    pub fn register<T: 'static>(&self, serializer: Arc<dyn CacheSerializer<T>>) {
        let stored: Arc<dyn Any + Send + Sync> = Arc::new(serializer);
        self.entries
            .entry(TypeId::of::<T>())
            .and_modify(|entry| entry.serializer = Some(Arc::clone(&stored)))
            .or_insert(RegistryEntry {
                serializer: Some(stored),
                shared: false,
            });
    }

    /// Marks `T` as safe to share between callers without a defensive copy.
    pub fn mark_shared<T: 'static>(&self) {
        self.entries
            .entry(TypeId::of::<T>())
            .and_modify(|entry| entry.shared = true)
            .or_insert(RegistryEntry {
                serializer: None,
                shared: true,
            });
    }

    /// Resolves the serializer and sharing mode for `T`, installing the
    /// bincode default on first use.
    pub(crate) fn resolve<T>(&self) -> (Arc<dyn CacheSerializer<T>>, bool)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let mut entry = self.entries.entry(TypeId::of::<T>()).or_insert(RegistryEntry {
            serializer: None,
            shared: false,
        });
        let shared = entry.shared;
        if let Some(stored) = &entry.serializer {
            if let Some(serializer) = stored.downcast_ref::<Arc<dyn CacheSerializer<T>>>() {
                return (Arc::clone(serializer), shared);
            }
            log::error!(
                "serializer registered for {} has the wrong type; replacing with default",
                std::any::type_name::<T>()
            );
        }
        let serializer: Arc<dyn CacheSerializer<T>> = Arc::new(BincodeSerializer::<T>::default());
        entry.serializer = Some(Arc::new(Arc::clone(&serializer)));
        (serializer, shared)
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
