//! Cache capability and its in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use runnr_common::CapabilityError;

use crate::config::CacheConfig;

/// Keyed bytes with an optional TTL.
#[async_trait]
pub trait CacheCapability: Send + Sync {
    /// Store `value` under `key`. A `ttl_secs` of 0 never expires.
    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: i32) -> Result<(), CapabilityError>;

    /// Fetch the value under `key`, or [`CapabilityError::NotFound`].
    async fn get(&self, key: &str) -> Result<Vec<u8>, CapabilityError>;

    async fn delete(&self, key: &str) -> Result<(), CapabilityError>;
}

type Store = Arc<Mutex<HashMap<String, Arc<Vec<u8>>>>>;

/// Process-local cache.
///
/// Each TTL spawns a timer that removes the key only if it still holds the
/// exact value the timer was scheduled for, so an overwrite outlives the
/// previous value's expiry.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    enabled: bool,
    values: Store,
}

impl MemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            values: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn check_enabled(&self) -> Result<(), CapabilityError> {
        if self.enabled {
            Ok(())
        } else {
            Err(CapabilityError::NotEnabled {
                capability: "cache",
            })
        }
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[async_trait]
impl CacheCapability for MemoryCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: i32) -> Result<(), CapabilityError> {
        self.check_enabled()?;

        let value = Arc::new(value);
        self.values.lock().insert(key.to_string(), value.clone());

        if let Ok(ttl) = u64::try_from(ttl_secs) {
            if ttl > 0 {
                let values = self.values.clone();
                let key = key.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(ttl)).await;
                    let mut values = values.lock();
                    if values.get(&key).is_some_and(|v| Arc::ptr_eq(v, &value)) {
                        debug!(key = %key, "cache entry expired");
                        values.remove(&key);
                    }
                });
            }
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CapabilityError> {
        self.check_enabled()?;

        self.values
            .lock()
            .get(key)
            .map(|v| v.as_ref().clone())
            .ok_or_else(|| CapabilityError::not_found(key))
    }

    async fn delete(&self, key: &str) -> Result<(), CapabilityError> {
        self.check_enabled()?;

        self.values.lock().remove(key);
        Ok(())
    }
}
