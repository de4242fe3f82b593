//! Durable Cache: the device-local copy of every key.
//!
//! A thin layer over the `app` namespace of the [`Store`]. It has no network
//! side effects; the engine decides when cache writes are broadcast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::key::StorageKey;
use crate::storage::{CacheEntry, ItemMeta, LwwOutcome, Namespace, ScopedStore, Store, StoreError};

/// Read/write counters, mostly useful in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub item_reads: u64,
    pub item_writes: u64,
}

#[derive(Debug, Default)]
struct AtomicCacheStats {
    item_reads: AtomicU64,
    item_writes: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct DurableCache {
    scope: ScopedStore,
    stats: Arc<AtomicCacheStats>,
}

impl DurableCache {
    pub fn new(store: &Arc<Store>) -> Self {
        Self::with_namespace(store, Namespace::app())
    }

    pub fn with_namespace(store: &Arc<Store>, namespace: Namespace) -> Self {
        Self {
            scope: store.scope(namespace),
            stats: Arc::new(AtomicCacheStats::default()),
        }
    }

    pub fn get(&self, key: &StorageKey) -> Result<Option<Value>, StoreError> {
        self.stats.item_reads.fetch_add(1, Ordering::Relaxed);
        self.scope.get_item(key)
    }

    pub fn set(&self, key: &StorageKey, value: &Value) -> Result<(), StoreError> {
        self.stats.item_writes.fetch_add(1, Ordering::Relaxed);
        self.scope.set_item(key, value)
    }

    /// Value plus timestamp in one read.
    pub fn get_entry(&self, key: &StorageKey) -> Result<Option<CacheEntry>, StoreError> {
        self.stats.item_reads.fetch_add(1, Ordering::Relaxed);
        self.scope.get_entry(key)
    }

    /// Write a value stamped with `updated_at`.
    pub fn put(&self, key: &StorageKey, value: &Value, updated_at: u64) -> Result<(), StoreError> {
        self.stats.item_writes.fetch_add(1, Ordering::Relaxed);
        self.scope.set_item_with_meta(key, value, updated_at)
    }

    /// Accept a remote record only if it is strictly newer than ours.
    pub fn apply_remote(
        &self,
        key: &StorageKey,
        value: &Value,
        updated_at: u64,
    ) -> Result<LwwOutcome, StoreError> {
        let outcome = self.scope.apply_if_newer(key, value, updated_at)?;
        if outcome == LwwOutcome::Applied {
            self.stats.item_writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    pub fn get_meta(&self, key: &StorageKey) -> Result<Option<ItemMeta>, StoreError> {
        self.scope.get_meta(key)
    }

    pub fn set_meta(&self, key: &StorageKey, meta: ItemMeta) -> Result<(), StoreError> {
        self.scope.set_meta(key, meta)
    }

    /// Drop a key locally. Nothing is sent to other devices.
    pub fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
        self.scope.remove_item(key)
    }

    pub fn list_keys(&self, prefix: &str) -> Result<Vec<StorageKey>, StoreError> {
        self.scope.keys(prefix)
    }

    pub fn get_blob(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.scope.get_blob(name)
    }

    pub fn set_blob(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.scope.set_blob(name, bytes)
    }

    pub fn remove_blob(&self, name: &str) -> Result<(), StoreError> {
        self.scope.remove_blob(name)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            item_reads: self.stats.item_reads.load(Ordering::Relaxed),
            item_writes: self.stats.item_writes.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn scope(&self) -> &ScopedStore {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use serde_json::json;

    fn open_cache() -> (tempfile::TempDir, DurableCache) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
        (dir, DurableCache::new(&store))
    }

    #[test]
    fn test_get_set_counts() {
        let (_dir, cache) = open_cache();
        let key = StorageKey::new("a").unwrap();

        assert_eq!(cache.get(&key).unwrap(), None);
        cache.set(&key, &json!("x")).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(json!("x")));
        assert_eq!(
            cache.stats(),
            CacheStats {
                item_reads: 2,
                item_writes: 1
            }
        );
    }

    #[test]
    fn test_put_sets_meta() {
        let (_dir, cache) = open_cache();
        let key = StorageKey::new("a").unwrap();

        cache.put(&key, &json!(1), 77).unwrap();
        assert_eq!(cache.get_meta(&key).unwrap(), Some(ItemMeta { updated_at: 77 }));
        let entry = cache.get_entry(&key).unwrap().unwrap();
        assert_eq!(entry.updated_at, 77);
    }

    #[test]
    fn test_apply_remote_respects_lww() {
        let (_dir, cache) = open_cache();
        let key = StorageKey::new("k").unwrap();

        cache.put(&key, &json!("local"), 200).unwrap();
        assert!(matches!(
            cache.apply_remote(&key, &json!("old"), 100).unwrap(),
            LwwOutcome::Stale { .. }
        ));
        assert_eq!(
            cache.apply_remote(&key, &json!("new"), 300).unwrap(),
            LwwOutcome::Applied
        );
        assert_eq!(cache.get(&key).unwrap(), Some(json!("new")));
    }

    #[test]
    fn test_remove_and_list() {
        let (_dir, cache) = open_cache();
        let a = StorageKey::new("dir/a").unwrap();
        let b = StorageKey::new("dir/b").unwrap();
        cache.set(&a, &json!(1)).unwrap();
        cache.set(&b, &json!(2)).unwrap();

        cache.remove(&a).unwrap();
        assert_eq!(cache.list_keys("dir").unwrap(), vec![b]);
    }
}
