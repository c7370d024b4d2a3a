//! Redis-backed cache capability.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use runnr_common::CapabilityError;

use crate::CacheCapability;
use crate::config::RedisConfig;

/// Cache stored in Redis.
///
/// The connection is established on first use and then shared; the
/// connection manager reconnects on its own after failures.
pub struct RedisCache {
    client: redis::Client,
    address: String,
    conn: OnceCell<ConnectionManager>,
}

impl RedisCache {
    /// Create a cache for the configured server. No connection is made yet.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::InvalidArgument`] if the address does not
    /// form a valid Redis URL.
    pub fn new(config: &RedisConfig) -> Result<Self, CapabilityError> {
        let client = redis::Client::open(config.connection_url()).map_err(|e| {
            CapabilityError::invalid_argument(format!(
                "invalid redis address '{}': {e}",
                config.server_address
            ))
        })?;

        Ok(Self {
            client,
            address: config.server_address.clone(),
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CapabilityError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!(address = %self.address, "connected to redis");
                Ok::<_, redis::RedisError>(manager)
            })
            .await
            .map_err(|e| {
                warn!(address = %self.address, error = %e, "redis connection failed");
                CapabilityError::downstream(format!("redis connection failed: {e}"))
            })?;

        Ok(conn.clone())
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("address", &self.address)
            .field("connected", &self.conn.initialized())
            .finish_non_exhaustive()
    }
}

fn downstream(e: &redis::RedisError) -> CapabilityError {
    CapabilityError::downstream(format!("redis: {e}"))
}

#[async_trait]
impl CacheCapability for RedisCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: i32) -> Result<(), CapabilityError> {
        let mut conn = self.connection().await?;

        match u64::try_from(ttl_secs) {
            Ok(ttl) if ttl > 0 => conn.set_ex::<_, _, ()>(key, value, ttl).await,
            _ => conn.set::<_, _, ()>(key, value).await,
        }
        .map_err(|e| downstream(&e))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CapabilityError> {
        let mut conn = self.connection().await?;

        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| downstream(&e))?
            .ok_or_else(|| CapabilityError::not_found(key))
    }

    async fn delete(&self, key: &str) -> Result<(), CapabilityError> {
        let mut conn = self.connection().await?;

        conn.del::<_, ()>(key).await.map_err(|e| downstream(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_does_not_connect() {
        let cache = RedisCache::new(&RedisConfig {
            server_address: "127.0.0.1:6379".into(),
            ..Default::default()
        })
        .unwrap();

        assert!(!cache.conn.initialized());
        assert!(format!("{cache:?}").contains("127.0.0.1:6379"));
    }

    #[test]
    fn test_invalid_address() {
        let result = RedisCache::new(&RedisConfig {
            server_address: "not a host:port/\\".into(),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
