//! Persistence integration tests.
//!
//! Verifies:
//! - Local state survives an engine restart (cache and CRDT snapshot)
//! - A corrupt local snapshot is discarded and the engine starts empty
//! - Relay state survives a relay restart
//! - Namespaces are isolated in the relay store

use std::path::Path;
use std::sync::Arc;

use mnemo_sync::document::SNAPSHOT_BLOB;
use mnemo_sync::{
    ContainerKind, DurableCache, EngineConfig, LwwOutcome, Namespace, RelayServer, ServerConfig,
    StaticTokens, Store, StoreConfig, StorageKey, SyncEngine,
};
use serde_json::json;
use tempfile::tempdir;
use tokio::time::{sleep, timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn key(raw: &str) -> StorageKey {
    StorageKey::new(raw).unwrap()
}

fn local_engine(dir: &Path) -> SyncEngine {
    SyncEngine::start(EngineConfig::for_testing(dir)).unwrap()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Reopen a store, retrying while a previous owner is still shutting down.
async fn reopen<T>(mut open: impl FnMut() -> Option<T>) -> T {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = open() {
                return value;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("store never became available")
}

// ─── Engine restarts ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_engine_restart_restores_items_and_containers() {
    let dir = tempdir().unwrap();
    {
        let engine = local_engine(dir.path());
        engine.item("settings/theme").await.unwrap().set(json!("dark"));
        engine.text("notes/a.md").await.unwrap().set("remember");
        let map = engine.map("profile").await.unwrap();
        map.insert("name", json!("Ada")).unwrap();

        let cache = Arc::clone(engine.cache());
        eventually("writes reach the cache", || {
            cache.get(&key("settings/theme")).unwrap().is_some()
                && cache.get(&key("notes/a.md")).unwrap().is_some()
                && cache.get(&key("profile")).unwrap().is_some()
        })
        .await;
        engine.shutdown().await.unwrap();
    }

    let engine = local_engine(dir.path());
    assert_eq!(
        engine.item("settings/theme").await.unwrap().get(),
        json!("dark")
    );
    assert_eq!(engine.text("notes/a.md").await.unwrap().get(), "remember");
    assert_eq!(
        engine
            .document()
            .materialize(&key("profile"), ContainerKind::Map),
        json!({"name": "Ada"})
    );
}

#[tokio::test]
async fn test_corrupt_snapshot_discarded() {
    let dir = tempdir().unwrap();
    {
        let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
        let cache = DurableCache::new(&store);
        cache.set_blob(SNAPSHOT_BLOB, b"definitely not a snapshot").unwrap();
        cache.put(&key("kept"), &json!(42), 5).unwrap();
    }

    let engine = local_engine(dir.path());
    assert_eq!(engine.document().to_json(), json!({}));
    assert_eq!(engine.cache().get_blob(SNAPSHOT_BLOB).unwrap(), None);
    // Plain cached items are unaffected.
    assert_eq!(engine.item("kept").await.unwrap().get(), json!(42));
}

#[tokio::test]
async fn test_browser_lists_cached_keys() {
    let dir = tempdir().unwrap();
    let engine = local_engine(dir.path());
    engine.cache().put(&key("spaces/s1/daily/notes.json"), &json!("n"), 1).unwrap();
    engine.cache().put(&key("spaces/s1/title"), &json!("Home"), 1).unwrap();
    engine.cache().put(&key("other"), &json!(0), 1).unwrap();

    let tree = engine.browse("spaces/s1").unwrap();
    let names: Vec<&str> = tree.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["daily", "title"]);
    assert!(tree["daily"].is_directory());
    assert_eq!(tree["title"].key(), "spaces/s1/title");
}

// ─── Relay restarts ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_relay_state_survives_restart() {
    let dir = tempdir().unwrap();
    let tokens = StaticTokens::new().with("t-alice", "alice");
    {
        let server = RelayServer::new(ServerConfig::for_testing(dir.path()), tokens.clone()).unwrap();
        let cache = server.namespace("alice");
        assert_eq!(
            cache.apply_remote(&key("k"), &json!("v1"), 10).unwrap(),
            LwwOutcome::Applied
        );
    }

    let server = reopen(|| RelayServer::new(ServerConfig::for_testing(dir.path()), tokens.clone()).ok()).await;
    let entry = server.namespace("alice").get_entry(&key("k")).unwrap().unwrap();
    assert_eq!(entry.value, json!("v1"));
    assert_eq!(entry.updated_at, 10);
}

#[tokio::test]
async fn test_relay_namespaces_are_isolated() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
    let alice = DurableCache::with_namespace(&store, Namespace::user("alice"));
    let bob = DurableCache::with_namespace(&store, Namespace::user("bob"));

    alice.apply_remote(&key("shared/name"), &json!("A"), 100).unwrap();
    assert_eq!(
        bob.apply_remote(&key("shared/name"), &json!("B"), 50).unwrap(),
        LwwOutcome::Applied
    );
    assert_eq!(alice.get(&key("shared/name")).unwrap(), Some(json!("A")));
    assert_eq!(bob.get(&key("shared/name")).unwrap(), Some(json!("B")));
    assert_eq!(alice.list_keys("").unwrap(), vec![key("shared/name")]);
}
