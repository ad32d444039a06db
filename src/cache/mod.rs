//! Cache coherence layer
//!
//! Read-through caching with explicit, command-driven invalidation. Per key:
//! `Absent -> Populated -> Invalidated -> Populated`. Loader misses are
//! remembered as not-found markers for the same TTL so repeated lookups of a
//! missing entity do not reach the repository.

pub mod keys;
pub mod memory;
pub mod redis;
pub mod store;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::error::{AppError, AppResult};

pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use store::CacheStore;

const NOT_FOUND_MARKER: &str = "\u{0}not_found:";

enum Lookup<T> {
    Hit(T),
    Missing(String),
    Miss,
}

/// Keys and prefixes to drop after a write
#[derive(Debug, Clone, Default)]
pub struct Invalidation {
    keys: Vec<String>,
    prefixes: Vec<String>,
}

impl Invalidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: String) -> Self {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
        self
    }

    pub fn prefix(mut self, prefix: String) -> Self {
        if !self.prefixes.contains(&prefix) {
            self.prefixes.push(prefix);
        }
        self
    }

    pub fn merge(mut self, other: Invalidation) -> Self {
        for key in other.keys {
            self = self.key(key);
        }
        for prefix in other.prefixes {
            self = self.prefix(prefix);
        }
        self
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.prefixes.is_empty()
    }
}

/// Per-key load lock, released from the map once its last holder is gone
/// (including callers whose future was dropped mid-load)
struct InflightSlot<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> InflightSlot<'a> {
    fn acquire(map: &'a DashMap<String, Arc<Mutex<()>>>, key: &'a str) -> Self {
        let lock = map.entry(key.to_string()).or_default().clone();
        Self { map, key, lock }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        // The map holds one reference and this slot another
        self.map.remove_if(self.key, |_, slot| {
            Arc::ptr_eq(slot, &self.lock) && Arc::strong_count(slot) <= 2
        });
    }
}

pub struct CacheLayer {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            inflight: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read `key` through the cache.
    ///
    /// On a miss `loader` runs once per key per process even under
    /// concurrent callers; its value (or its `NotFound`) is stored for the
    /// configured TTL. Contexts that ignore the tenant bypass the cache.
    pub async fn cached<T, F, Fut>(&self, ctx: &Context, key: &str, loader: F) -> AppResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        if ctx.ignores_tenant() {
            return ctx.run(loader()).await;
        }

        match self.lookup(ctx, key).await? {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Missing(msg) => return Err(AppError::NotFound(msg)),
            Lookup::Miss => {}
        }

        let slot = InflightSlot::acquire(&self.inflight, key);
        let _guard = slot.lock.lock().await;
        self.load(ctx, key, loader).await
    }

    async fn load<T, F, Fut>(&self, ctx: &Context, key: &str, loader: F) -> AppResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        // Someone else may have filled it while we waited
        match self.lookup(ctx, key).await? {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Missing(msg) => return Err(AppError::NotFound(msg)),
            Lookup::Miss => {}
        }

        debug!("Cache miss: {}", key);
        match ctx.run(loader()).await {
            Ok(value) => {
                match serde_json::to_string(&value) {
                    Ok(raw) => self.fill(key, raw).await,
                    Err(e) => warn!("Cannot encode cache entry {}: {}", key, e),
                }
                Ok(value)
            }
            Err(AppError::NotFound(msg)) => {
                self.fill(key, format!("{}{}", NOT_FOUND_MARKER, msg)).await;
                Err(AppError::NotFound(msg))
            }
            Err(e) => Err(e),
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, ctx: &Context, key: &str) -> AppResult<Lookup<T>> {
        let raw = match ctx.run(self.store.get(key)).await {
            Ok(raw) => raw,
            Err(e @ (AppError::Cancelled | AppError::DeadlineExceeded)) => return Err(e),
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                None
            }
        };
        let Some(raw) = raw else {
            return Ok(Lookup::Miss);
        };
        if let Some(msg) = raw.strip_prefix(NOT_FOUND_MARKER) {
            return Ok(Lookup::Missing(msg.to_string()));
        }
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Lookup::Hit(value)),
            Err(e) => {
                warn!("Undecodable cache entry {}: {}", key, e);
                Ok(Lookup::Miss)
            }
        }
    }

    async fn fill(&self, key: &str, raw: String) {
        if let Err(e) = self.store.set(key, raw, self.ttl).await {
            warn!("Cache write failed for {}: {}", key, e);
        }
    }

    /// Drop one key
    pub async fn evict(&self, key: &str) {
        self.invalidate(Invalidation::new().key(key.to_string())).await;
    }

    /// Bulk-evict every key of one kind for one tenant
    pub async fn invalidate_tenant_type(&self, tenant_id: i64, entity: &str) {
        self.invalidate(Invalidation::new().prefix(keys::tenant_prefix(entity, tenant_id)))
            .await;
    }

    /// Apply an invalidation after a committed write.
    ///
    /// Runs on its own task so a caller that gives up mid-way does not leave
    /// the batch half applied. Failures are reported and never fail the write.
    pub async fn invalidate(&self, invalidation: Invalidation) {
        if invalidation.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        let handle = tokio::spawn(async move {
            for key in invalidation.keys() {
                if let Err(e) = store.tag_as_deleted(key).await {
                    error!("Cache invalidation failed for key {}: {}", key, e);
                }
            }
            for prefix in invalidation.prefixes() {
                match store.delete_prefix(prefix).await {
                    Ok(n) => debug!("Evicted {} cache entries under {}", n, prefix),
                    Err(e) => error!("Cache invalidation failed for prefix {}: {}", prefix, e),
                }
            }
        });
        if let Err(e) = handle.await {
            error!("Cache invalidation task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn layer() -> CacheLayer {
        CacheLayer::new(Arc::new(MemoryStore::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_cached_hit_skips_loader() {
        let cache = layer();
        let ctx = Context::new(1, 1);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value: Vec<i64> = assert_ok!(
                cache
                    .cached(&ctx, "role_permissions:1:7", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(vec![1, 2, 3])
                    })
                    .await
            );
            assert_eq!(value, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_remembered() {
        let cache = layer();
        let ctx = Context::new(1, 1);
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let result: AppResult<String> = cache
                .cached(&ctx, "department:1:404", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::NotFound("Department not found".to_string()))
                })
                .await;
            let err = assert_err!(result);
            assert!(matches!(err, AppError::NotFound(ref m) if m == "Department not found"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_cached() {
        let cache = layer();
        let ctx = Context::new(1, 1);
        let failed: AppResult<i64> = cache
            .cached(&ctx, "role:1:1", || async { Err(AppError::Internal("down".to_string())) })
            .await;
        assert_err!(failed);
        let value: i64 = assert_ok!(cache.cached(&ctx, "role:1:1", || async { Ok(5) }).await);
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_double_invalidation() {
        let cache = layer();
        let ctx = Context::new(1, 1);
        let _: i64 = assert_ok!(cache.cached(&ctx, "role:1:1", || async { Ok(1) }).await);

        cache.evict("role:1:1").await;
        let once = assert_ok!(cache.store().get("role:1:1").await);
        cache.evict("role:1:1").await;
        let twice = assert_ok!(cache.store().get("role:1:1").await);
        assert_eq!(once, None);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_invalidate_tenant_type() {
        let cache = layer();
        let ttl = Duration::from_secs(60);
        let store = cache.store();
        for key in [keys::role(1, 1), keys::role(1, 2), keys::role(2, 1), keys::user_roles(1, 1)] {
            assert_ok!(store.set(&key, "1".to_string(), ttl).await);
        }
        cache.invalidate_tenant_type(1, keys::ROLE).await;
        assert_eq!(assert_ok!(store.get(&keys::role(1, 1)).await), None);
        assert_eq!(assert_ok!(store.get(&keys::role(1, 2)).await), None);
        assert!(assert_ok!(store.get(&keys::role(2, 1)).await).is_some());
        assert!(assert_ok!(store.get(&keys::user_roles(1, 1)).await).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_misses_load_once() {
        let cache = layer();
        let ctx = Context::new(1, 1);
        let calls = AtomicUsize::new(0);
        let lookups = (0..8).map(|_| {
            cache.cached(&ctx, "department_tree:1:all", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(vec!["A".to_string()])
            })
        });
        let results: Vec<AppResult<Vec<String>>> = futures::future::join_all(lookups).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_load_releases_slot() {
        let cache = layer();
        let ctx = Context::new(1, 1);
        let stalled = cache.cached(&ctx, "department:1:5", || async {
            futures::future::pending::<AppResult<i64>>().await
        });
        assert_err!(tokio::time::timeout(Duration::from_millis(20), stalled).await);
        assert!(cache.inflight.is_empty());

        let value: i64 = assert_ok!(cache.cached(&ctx, "department:1:5", || async { Ok(5) }).await);
        assert_eq!(value, 5);
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let cache = layer();
        let ctx = Context::new(1, 1);
        assert_ok!(
            cache
                .store()
                .set("role:1:3", "{not json".to_string(), Duration::from_secs(60))
                .await
        );
        let value: i64 = assert_ok!(cache.cached(&ctx, "role:1:3", || async { Ok(3) }).await);
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_ignore_tenant_bypasses_cache() {
        let cache = layer();
        let admin = Context::new(1, 1).ignoring_tenant();
        let _: i64 = assert_ok!(cache.cached(&admin, "role:1:9", || async { Ok(9) }).await);
        assert_eq!(assert_ok!(cache.store().get("role:1:9").await), None);
    }
}
