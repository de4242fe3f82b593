//! Key Space Browser: a read-only tree view of the Durable Cache.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::cache::DurableCache;
use crate::key::{self, SEPARATOR};
use crate::storage::StoreError;

/// One node of the key tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoragePath {
    /// An intermediate path segment. `key` is the full prefix it stands for.
    Directory {
        key: String,
        children: BTreeMap<String, StoragePath>,
    },
    /// A stored key and its cached value.
    File { key: String, content: Value },
}

impl StoragePath {
    pub fn key(&self) -> &str {
        match self {
            StoragePath::Directory { key, .. } | StoragePath::File { key, .. } => key,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, StoragePath::Directory { .. })
    }
}

/// Build the tree of every cached key under `base`, relative to `base`.
///
/// When a key is both a file and a prefix of other keys, the directory
/// wins and the file's content is not shown.
pub fn browse(cache: &DurableCache, base: &str) -> Result<BTreeMap<String, StoragePath>, StoreError> {
    let base = key::normalize(base);
    let mut root = BTreeMap::new();

    for storage_key in cache.list_keys(&base)? {
        if !storage_key.is_under(&base) {
            continue;
        }
        let content = cache.get(&storage_key)?.unwrap_or(Value::Null);
        let relative: Vec<&str> = storage_key
            .segments()
            .skip(if base.is_empty() { 0 } else { base.split(SEPARATOR).count() })
            .collect();
        if relative.is_empty() {
            continue;
        }
        insert(&mut root, &base, &relative, storage_key.as_str(), content);
    }

    Ok(root)
}

fn insert(
    level: &mut BTreeMap<String, StoragePath>,
    prefix: &str,
    segments: &[&str],
    full_key: &str,
    content: Value,
) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let path = if prefix.is_empty() {
        (*head).to_string()
    } else {
        format!("{prefix}{SEPARATOR}{head}")
    };

    if rest.is_empty() {
        level
            .entry((*head).to_string())
            .or_insert_with(|| StoragePath::File {
                key: full_key.to_string(),
                content,
            });
        return;
    }

    let node = level
        .entry((*head).to_string())
        .or_insert_with(|| StoragePath::Directory {
            key: path.clone(),
            children: BTreeMap::new(),
        });
    if !node.is_directory() {
        log::debug!("Key {path} is both a value and a prefix; showing it as a directory");
        *node = StoragePath::Directory {
            key: path.clone(),
            children: BTreeMap::new(),
        };
    }
    if let StoragePath::Directory { children, .. } = node {
        insert(children, &path, rest, full_key, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::StorageKey;
    use crate::storage::{Store, StoreConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn cache_with(keys: &[(&str, Value)]) -> (tempfile::TempDir, DurableCache) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
        let cache = DurableCache::new(&store);
        for (raw, value) in keys {
            cache.set(&StorageKey::new(raw).unwrap(), value).unwrap();
        }
        (dir, cache)
    }

    #[test]
    fn test_browse_builds_tree() {
        let (_dir, cache) = cache_with(&[
            ("spaces/a/notes.json", json!("n")),
            ("spaces/a/daily/1", json!(1)),
            ("settings", json!({"dark": true})),
        ]);

        let tree = browse(&cache, "").unwrap();
        assert_eq!(
            tree.get("settings"),
            Some(&StoragePath::File {
                key: "settings".into(),
                content: json!({"dark": true})
            })
        );

        let StoragePath::Directory { key, children } = &tree["spaces"] else {
            panic!("spaces should be a directory");
        };
        assert_eq!(key, "spaces");
        let StoragePath::Directory { key, children } = &children["a"] else {
            panic!("spaces/a should be a directory");
        };
        assert_eq!(key, "spaces/a");
        assert_eq!(children["notes.json"].key(), "spaces/a/notes.json");
        assert!(children["daily"].is_directory());
    }

    #[test]
    fn test_browse_relative_to_base() {
        let (_dir, cache) = cache_with(&[
            ("spaces/a/x", json!(1)),
            ("spaces/ab/y", json!(2)),
        ]);

        let tree = browse(&cache, "spaces/a").unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree["x"].key(), "spaces/a/x");
    }

    #[test]
    fn test_directory_wins_over_file() {
        let (_dir, cache) = cache_with(&[("a", json!("file")), ("a/b", json!("nested"))]);

        let tree = browse(&cache, "").unwrap();
        let StoragePath::Directory { children, .. } = &tree["a"] else {
            panic!("a should be a directory");
        };
        assert_eq!(children["b"].key(), "a/b");
    }

    #[test]
    fn test_serialized_shape() {
        let node = StoragePath::File {
            key: "k".into(),
            content: json!(1),
        };
        assert_eq!(
            serde_json::to_value(&node).unwrap(),
            json!({"kind": "file", "key": "k", "content": 1})
        );
    }
}
