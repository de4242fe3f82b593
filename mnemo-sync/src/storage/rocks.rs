//! RocksDB-backed key/value store shared by the client cache and the relay.
//!
//! Column families:
//! - `items`: JSON values keyed by `<namespace>\0<storage key>`
//! - `meta`: bincode [`ItemMeta`] under the same keys
//! - `blobs`: LZ4-compressed binary snapshots keyed by `<namespace>\0<name>`
//!
//! Every read and write goes through a [`ScopedStore`], so one database can
//! hold the `app` namespace on a device or one namespace per user on the
//! relay without keys colliding.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Namespace;
use crate::key::StorageKey;
use crate::protocol::KvFrame;

const CF_ITEMS: &str = "items";
const CF_META: &str = "meta";
const CF_BLOBS: &str = "blobs";

const COLUMN_FAMILIES: &[&str] = &[CF_ITEMS, CF_META, CF_BLOBS];

/// Separates the namespace from the key inside a RocksDB key.
const SCOPE_DELIMITER: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mnemo_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Per-key metadata kept beside each item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMeta {
    /// Epoch milliseconds of the write that produced the current value.
    pub updated_at: u64,
}

impl ItemMeta {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// A stored value together with its timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: StorageKey,
    pub value: Value,
    pub updated_at: u64,
}

impl CacheEntry {
    pub fn to_frame(&self) -> KvFrame {
        KvFrame::new(self.key.as_str(), self.value.clone(), self.updated_at)
    }
}

/// Result of a conditional last-writer-wins write.
#[derive(Debug, Clone, PartialEq)]
pub enum LwwOutcome {
    /// The incoming timestamp was strictly newer; the value is stored.
    Applied,
    /// The incoming write lost; `current` is the authoritative record.
    Stale { current: CacheEntry },
    /// The incoming write lost and nothing is stored for the key.
    Unknown,
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB instance plus the lock that serializes compare-and-set writes.
pub struct Store {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    cas: Mutex<()>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            cas: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ITEMS | CF_META => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            CF_BLOBS => {
                // Already LZ4 framed by us.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// A view of the store restricted to one namespace.
    pub fn scope(self: &Arc<Self>, namespace: Namespace) -> ScopedStore {
        ScopedStore {
            store: Arc::clone(self),
            namespace,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

/// Namespaced access to a [`Store`].
#[derive(Debug, Clone)]
pub struct ScopedStore {
    store: Arc<Store>,
    namespace: Namespace,
}

impl ScopedStore {
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn scoped_key(&self, name: &str) -> Vec<u8> {
        let ns = self.namespace.as_str().as_bytes();
        let mut key = Vec::with_capacity(ns.len() + 1 + name.len());
        key.extend_from_slice(ns);
        key.push(SCOPE_DELIMITER);
        key.extend_from_slice(name.as_bytes());
        key
    }

    // ─── Items ────────────────────────────────────────────────────────

    /// Read a cached value. A value that fails to decode is logged and
    /// reported as absent.
    pub fn get_item(&self, key: &StorageKey) -> Result<Option<Value>, StoreError> {
        let cf = self.store.cf(CF_ITEMS)?;
        let Some(bytes) = self.store.db.get_cf(cf, self.scoped_key(key.as_str()))? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                log::warn!("[{}] Corrupt cached value for {key}: {e}", self.namespace);
                Ok(None)
            }
        }
    }

    pub fn set_item(&self, key: &StorageKey, value: &Value) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_ITEMS)?;
        let bytes = encode_value(value)?;
        self.store
            .db
            .put_cf_opt(cf, self.scoped_key(key.as_str()), bytes, &self.store.write_options())?;
        Ok(())
    }

    /// Remove a value and its metadata. Removals are not propagated anywhere.
    pub fn remove_item(&self, key: &StorageKey) -> Result<(), StoreError> {
        let scoped = self.scoped_key(key.as_str());
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.store.cf(CF_ITEMS)?, &scoped);
        batch.delete_cf(self.store.cf(CF_META)?, &scoped);
        self.store.db.write_opt(batch, &self.store.write_options())?;
        Ok(())
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn get_meta(&self, key: &StorageKey) -> Result<Option<ItemMeta>, StoreError> {
        let cf = self.store.cf(CF_META)?;
        let Some(bytes) = self.store.db.get_cf(cf, self.scoped_key(key.as_str()))? else {
            return Ok(None);
        };
        match ItemMeta::decode(&bytes) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                log::warn!("[{}] Corrupt metadata for {key}: {e}", self.namespace);
                Ok(None)
            }
        }
    }

    pub fn set_meta(&self, key: &StorageKey, meta: ItemMeta) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_META)?;
        self.store.db.put_cf_opt(
            cf,
            self.scoped_key(key.as_str()),
            meta.encode()?,
            &self.store.write_options(),
        )?;
        Ok(())
    }

    /// Write value and timestamp atomically.
    pub fn set_item_with_meta(
        &self,
        key: &StorageKey,
        value: &Value,
        updated_at: u64,
    ) -> Result<(), StoreError> {
        let scoped = self.scoped_key(key.as_str());
        let mut batch = WriteBatch::default();
        batch.put_cf(self.store.cf(CF_ITEMS)?, &scoped, encode_value(value)?);
        batch.put_cf(self.store.cf(CF_META)?, &scoped, ItemMeta { updated_at }.encode()?);
        self.store.db.write_opt(batch, &self.store.write_options())?;
        Ok(())
    }

    /// Value and timestamp for `key`, if a value is stored. A missing
    /// timestamp reads as 0.
    pub fn get_entry(&self, key: &StorageKey) -> Result<Option<CacheEntry>, StoreError> {
        let Some(value) = self.get_item(key)? else {
            return Ok(None);
        };
        let updated_at = self.get_meta(key)?.map(|m| m.updated_at).unwrap_or(0);
        Ok(Some(CacheEntry {
            key: key.clone(),
            value,
            updated_at,
        }))
    }

    /// Store `value` only if `updated_at` is strictly newer than the stored
    /// timestamp. The read and the write happen under one lock.
    pub fn apply_if_newer(
        &self,
        key: &StorageKey,
        value: &Value,
        updated_at: u64,
    ) -> Result<LwwOutcome, StoreError> {
        let _guard = self.store.cas.lock();
        let current_ts = self.get_meta(key)?.map(|m| m.updated_at).unwrap_or(0);
        if updated_at > current_ts {
            self.set_item_with_meta(key, value, updated_at)?;
            return Ok(LwwOutcome::Applied);
        }
        Ok(match self.get_entry(key)? {
            Some(current) => LwwOutcome::Stale { current },
            None => LwwOutcome::Unknown,
        })
    }

    /// All item keys in this namespace whose path starts with `prefix`,
    /// in lexicographic order.
    pub fn keys(&self, prefix: &str) -> Result<Vec<StorageKey>, StoreError> {
        let cf = self.store.cf(CF_ITEMS)?;
        let scope = self.scoped_key("");
        let start = self.scoped_key(&crate::key::normalize(prefix));

        let mut keys = Vec::new();
        let iter = self
            .store
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (raw, _) = item?;
            if !raw.starts_with(&start) {
                break;
            }
            let name = String::from_utf8_lossy(&raw[scope.len()..]);
            match StorageKey::new(&name) {
                Ok(key) => keys.push(key),
                Err(_) => log::debug!("[{}] Skipping unaddressable key {name:?}", self.namespace),
            }
        }
        Ok(keys)
    }

    // ─── Blobs ────────────────────────────────────────────────────────

    /// Load a binary blob. Fails with [`StoreError::Compression`] when the
    /// stored bytes are not a valid LZ4 frame.
    pub fn get_blob(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.store.cf(CF_BLOBS)?;
        match self.store.db.get_cf(cf, self.scoped_key(name))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn set_blob(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_BLOBS)?;
        let compressed = lz4_flex::compress_prepend_size(bytes);
        self.store
            .db
            .put_cf_opt(cf, self.scoped_key(name), compressed, &self.store.write_options())?;
        Ok(())
    }

    pub fn remove_blob(&self, name: &str) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_BLOBS)?;
        self.store.db.delete_cf(cf, self.scoped_key(name))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_raw_blob(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_BLOBS)?;
        self.store.db.put_cf(cf, self.scoped_key(name), bytes)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_raw_item(&self, key: &StorageKey, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.store.cf(CF_ITEMS)?;
        self.store.db.put_cf(cf, self.scoped_key(key.as_str()), bytes)?;
        Ok(())
    }
}

fn encode_value(value: &Value) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, Arc::new(store))
    }

    fn key(raw: &str) -> StorageKey {
        StorageKey::new(raw).unwrap()
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_store();
        assert_eq!(store.path(), dir.path());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_item_set_get() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::app());
        let k = key("spaces/a/notes.json");

        assert_eq!(scope.get_item(&k).unwrap(), None);
        scope.set_item(&k, &json!({"title": "hello"})).unwrap();
        assert_eq!(scope.get_item(&k).unwrap(), Some(json!({"title": "hello"})));
    }

    #[test]
    fn test_meta_set_get() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::app());
        let k = key("k");

        assert_eq!(scope.get_meta(&k).unwrap(), None);
        scope.set_meta(&k, ItemMeta { updated_at: 42 }).unwrap();
        assert_eq!(scope.get_meta(&k).unwrap(), Some(ItemMeta { updated_at: 42 }));
    }

    #[test]
    fn test_namespaces_isolated() {
        let (_dir, store) = open_store();
        let alice = store.scope(Namespace::user("alice"));
        let bob = store.scope(Namespace::user("bob"));
        let k = key("shared");

        alice.set_item_with_meta(&k, &json!(1), 10).unwrap();
        assert_eq!(bob.get_item(&k).unwrap(), None);
        assert!(bob.keys("").unwrap().is_empty());
        assert_eq!(alice.keys("").unwrap(), vec![k]);
    }

    #[test]
    fn test_corrupt_item_reads_as_absent() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::app());
        let k = key("broken");

        scope.put_raw_item(&k, b"{not json").unwrap();
        assert_eq!(scope.get_item(&k).unwrap(), None);
    }

    #[test]
    fn test_apply_if_newer_accepts_newer() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::user("u"));
        let k = key("k");

        let outcome = scope.apply_if_newer(&k, &json!(1), 100).unwrap();
        assert_eq!(outcome, LwwOutcome::Applied);
        let outcome = scope.apply_if_newer(&k, &json!(2), 101).unwrap();
        assert_eq!(outcome, LwwOutcome::Applied);
        assert_eq!(scope.get_item(&k).unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_apply_if_newer_rejects_older_and_equal() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::user("u"));
        let k = key("k");

        scope.apply_if_newer(&k, &json!(1), 100).unwrap();

        for ts in [50, 100] {
            match scope.apply_if_newer(&k, &json!(2), ts).unwrap() {
                LwwOutcome::Stale { current } => {
                    assert_eq!(current.value, json!(1));
                    assert_eq!(current.updated_at, 100);
                    assert_eq!(current.to_frame(), KvFrame::new("k", json!(1), 100));
                }
                other => panic!("expected stale, got {other:?}"),
            }
        }
        assert_eq!(scope.get_item(&k).unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_apply_if_newer_unknown_when_empty() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::user("u"));

        let outcome = scope.apply_if_newer(&key("k"), &json!(null), 0).unwrap();
        assert_eq!(outcome, LwwOutcome::Unknown);
    }

    #[test]
    fn test_lww_max_timestamp_wins_regardless_of_order() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::user("u"));
        let k = key("k");

        for ts in [30u64, 10, 50, 20, 40] {
            scope.apply_if_newer(&k, &json!(ts), ts).unwrap();
        }
        let entry = scope.get_entry(&k).unwrap().unwrap();
        assert_eq!(entry.value, json!(50));
        assert_eq!(entry.updated_at, 50);
    }

    #[test]
    fn test_keys_with_prefix() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::app());
        for raw in ["spaces/a/x", "spaces/a/y", "spaces/b/z", "settings"] {
            scope.set_item(&key(raw), &json!(true)).unwrap();
        }

        let under_a = scope.keys("spaces/a").unwrap();
        assert_eq!(under_a, vec![key("spaces/a/x"), key("spaces/a/y")]);
        assert_eq!(scope.keys("").unwrap().len(), 4);
        assert!(scope.keys("missing").unwrap().is_empty());
    }

    #[test]
    fn test_remove_item() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::app());
        let k = key("k");

        scope.set_item_with_meta(&k, &json!("v"), 7).unwrap();
        scope.remove_item(&k).unwrap();
        assert_eq!(scope.get_entry(&k).unwrap(), None);
        assert_eq!(scope.get_meta(&k).unwrap(), None);
    }

    #[test]
    fn test_blob_roundtrip_and_remove() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::user("u"));
        let data = vec![7u8; 4096];

        scope.set_blob("crdt", &data).unwrap();
        assert_eq!(scope.get_blob("crdt").unwrap(), Some(data));
        scope.remove_blob("crdt").unwrap();
        assert_eq!(scope.get_blob("crdt").unwrap(), None);
    }

    #[test]
    fn test_corrupt_blob_is_error() {
        let (_dir, store) = open_store();
        let scope = store.scope(Namespace::app());

        scope.put_raw_blob("crdt", &[0xFF, 0xFF, 0xFF, 0xFF, 1]).unwrap();
        assert!(matches!(
            scope.get_blob("crdt"),
            Err(StoreError::Compression(_))
        ));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("persisted");
        {
            let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
            store
                .scope(Namespace::app())
                .set_item_with_meta(&k, &json!([1, 2, 3]), 99)
                .unwrap();
            store.flush().unwrap();
        }
        let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
        let entry = store.scope(Namespace::app()).get_entry(&k).unwrap().unwrap();
        assert_eq!(entry.value, json!([1, 2, 3]));
        assert_eq!(entry.updated_at, 99);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::MissingColumnFamily("items");
        assert_eq!(err.to_string(), "column family 'items' not found");
    }
}
