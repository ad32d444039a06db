//! Redis cache store

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::time::Duration;

use super::store::CacheStore;
use crate::error::AppResult;

/// Store shared by every engine process pointing at the same Redis
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        tracing::info!("Connected to redis cache");
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> AppResult<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn tag_as_deleted(&self, key: &str) -> AppResult<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> AppResult<u64> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = conn.keys(format!("{}*", prefix)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let count = keys.len() as u64;
        conn.del::<_, ()>(keys).await?;
        Ok(count)
    }
}
