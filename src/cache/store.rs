use async_trait::async_trait;
use std::time::Duration;

use crate::error::AppResult;

/// Backing store of the cache layer.
///
/// Implementations must be safe for concurrent use; the layer above adds no
/// cross-key locking of its own.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Raw value under `key`, `None` when absent or expired
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> AppResult<()>;

    /// Drop `key`. Deleting an absent key is a no-op.
    async fn tag_as_deleted(&self, key: &str) -> AppResult<()>;

    /// Drop every key starting with `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> AppResult<u64>;
}
