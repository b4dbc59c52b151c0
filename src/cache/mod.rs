//! Cache of each device's latest measurement, in front of the store.
//!
//! The cache is never authoritative. `set` always overwrites and is used right after a store
//! write; `add` only fills an empty slot and is used to warm the cache from a store read, so it
//! can't clobber a fresher value written by a concurrent `set`.

use bytes::Bytes;
use prost::Message;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::measurement::{Measurement, StorableMeasurement, KEY_SEP};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache: cache miss")]
    Miss,
    #[error("cache: item not stored")]
    NotStored,
    #[error("cache: failed to encode measurement: {0}")]
    Encode(String),
    #[error("cache: failed to decode measurement: {0}")]
    Decode(String),
    #[error("cache: lock poisoned")]
    Poisoned,
}

/// Cache key of the latest measurement for a device: `<device_id>#latest`.
pub fn cache_key_latest(device_id: &str) -> String {
    [device_id, "latest"].join(KEY_SEP)
}

pub trait LatestCache: Send + Sync {
    /// Returns [`CacheError::Miss`] if nothing is cached under `key`.
    fn get(&self, key: &str) -> Result<StorableMeasurement, CacheError>;

    /// Store unconditionally.
    fn set(&self, key: &str, m: &StorableMeasurement) -> Result<(), CacheError>;

    /// Store only if `key` is empty. Returns [`CacheError::NotStored`] otherwise.
    fn add(&self, key: &str, m: &StorableMeasurement) -> Result<(), CacheError>;
}

fn encode(m: &StorableMeasurement) -> Result<Bytes, CacheError> {
    let wire = Measurement::try_from(m).map_err(|e| CacheError::Encode(e.to_string()))?;
    Ok(Bytes::from(wire.encode_to_vec()))
}

fn decode(data: &[u8]) -> Result<StorableMeasurement, CacheError> {
    let wire = Measurement::decode(data).map_err(|e| CacheError::Decode(e.to_string()))?;
    StorableMeasurement::try_from(&wire).map_err(|e| CacheError::Decode(e.to_string()))
}

/// In-process cache holding protobuf-encoded measurements.
#[derive(Default)]
pub struct MemoryCache {
    items: Mutex<HashMap<String, Bytes>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop an entry, as an eviction would.
    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut items = self.items.lock().map_err(|_| CacheError::Poisoned)?;
        items.remove(key).map(|_| ()).ok_or(CacheError::Miss)
    }
}

impl LatestCache for MemoryCache {
    fn get(&self, key: &str) -> Result<StorableMeasurement, CacheError> {
        let data = {
            let items = self.items.lock().map_err(|_| CacheError::Poisoned)?;
            items.get(key).cloned().ok_or(CacheError::Miss)?
        };
        decode(&data)
    }

    fn set(&self, key: &str, m: &StorableMeasurement) -> Result<(), CacheError> {
        let data = encode(m)?;
        let mut items = self.items.lock().map_err(|_| CacheError::Poisoned)?;
        items.insert(key.to_string(), data);
        Ok(())
    }

    fn add(&self, key: &str, m: &StorableMeasurement) -> Result<(), CacheError> {
        let data = encode(m)?;
        let mut items = self.items.lock().map_err(|_| CacheError::Poisoned)?;
        if items.contains_key(key) {
            return Err(CacheError::NotStored);
        }
        items.insert(key.to_string(), data);
        Ok(())
    }
}

/// Cache that stores nothing; every read misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl LatestCache for NoopCache {
    fn get(&self, _key: &str) -> Result<StorableMeasurement, CacheError> {
        Err(CacheError::Miss)
    }

    fn set(&self, _key: &str, _m: &StorableMeasurement) -> Result<(), CacheError> {
        Ok(())
    }

    fn add(&self, _key: &str, _m: &StorableMeasurement) -> Result<(), CacheError> {
        Ok(())
    }
}
