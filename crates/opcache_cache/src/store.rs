//! The auxiliary value store.
//!
//! Values are encoded with the configured serializer and the bytes are kept
//! in the shared segment, one pool per key. Fetching decodes with whichever
//! serializer encoded the value, so changing the default does not orphan
//! values already stored.

use std::collections::HashMap;
use std::sync::Arc;

use opcache_config::ValuesConfig;
use opcache_pool::{Allocator, Pool, PoolStrategy};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::CacheError;
use crate::serializer::{Serializer, SerializerRegistry};
use crate::value::Value;

struct Slot {
    bytes: Arc<[u8]>,
    serializer: String,
    created: i64,
    ttl: i64,
    _pool: Pool,
}

impl Slot {
    fn is_expired(&self, now: i64) -> bool {
        self.ttl > 0 && now - self.created >= self.ttl
    }
}

/// A keyed store of serialized values backed by shared pools.
pub struct ValueStore {
    segment: Arc<dyn Allocator>,
    registry: SerializerRegistry,
    serializer: String,
    slots: RwLock<HashMap<String, Slot>>,
    default_ttl: i64,
}

impl ValueStore {
    /// Creates an empty store over `segment`.
    ///
    /// Fails if the configured serializer is not in `registry`.
    pub fn new(
        segment: Arc<dyn Allocator>,
        registry: SerializerRegistry,
        config: &ValuesConfig,
    ) -> Result<Self, CacheError> {
        registry.require(&config.serializer)?;
        Ok(Self {
            segment,
            registry,
            serializer: config.serializer.clone(),
            slots: RwLock::new(HashMap::with_capacity(config.entries_hint)),
            default_ttl: config.ttl as i64,
        })
    }

    /// The serializers available to this store.
    pub fn registry(&self) -> &SerializerRegistry {
        &self.registry
    }

    /// The serializer new values are encoded with.
    pub fn serializer(&self) -> Result<&Serializer, CacheError> {
        self.registry.require(&self.serializer)
    }

    /// Encodes and stores `value` under `key`.
    ///
    /// A `ttl` of zero falls back to the configured default; a resulting zero
    /// means the value never expires. With `exclusive`, an existing live value
    /// is left alone and `Ok(false)` is returned.
    pub fn store(
        &self,
        key: &str,
        value: &Value,
        ttl: u64,
        exclusive: bool,
        now: i64,
    ) -> Result<bool, CacheError> {
        if exclusive && self.contains(key, now) {
            return Ok(false);
        }

        let serializer = self.serializer()?;
        let bytes = serializer.serialize(value)?;
        let mut pool = Pool::create(PoolStrategy::Shared, Arc::clone(&self.segment))?;
        pool.alloc(key.len() + bytes.len())?;
        let ttl = if ttl > 0 { ttl as i64 } else { self.default_ttl };

        let mut slots = self.slots.write();
        if exclusive && slots.get(key).is_some_and(|s| !s.is_expired(now)) {
            return Ok(false);
        }
        debug!(key, bytes = pool.size(), serializer = serializer.name(), "value stored");
        slots.insert(
            key.to_string(),
            Slot {
                bytes: bytes.into(),
                serializer: serializer.name().to_string(),
                created: now,
                ttl,
                _pool: pool,
            },
        );
        Ok(true)
    }

    /// Decodes the live value under `key`. Expired values are dropped.
    pub fn fetch(&self, key: &str, now: i64) -> Result<Option<Value>, CacheError> {
        let found = {
            let slots = self.slots.read();
            match slots.get(key) {
                None => return Ok(None),
                Some(slot) if !slot.is_expired(now) => {
                    Some((Arc::clone(&slot.bytes), slot.serializer.clone()))
                }
                Some(_) => None,
            }
        };

        match found {
            Some((bytes, name)) => self.registry.require(&name)?.deserialize(&bytes).map(Some),
            None => {
                let mut slots = self.slots.write();
                if slots.get(key).is_some_and(|s| s.is_expired(now)) {
                    slots.remove(key);
                }
                Ok(None)
            }
        }
    }

    /// Returns `true` if a live value is stored under `key`.
    pub fn contains(&self, key: &str, now: i64) -> bool {
        self.slots
            .read()
            .get(key)
            .is_some_and(|s| !s.is_expired(now))
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.slots.write().remove(key).is_some()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slots.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of stored values, expired ones included until next touched.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Removes every value.
    pub fn clear(&self) {
        self.slots.write().clear();
    }
}
