//! Persistent storage layer.
//!
//! ```text
//! ┌──────────────┐  scope(app)        ┌─────────────────────────────┐
//! │ DurableCache │ ─────────────────► │ Store (RocksDB)             │
//! └──────────────┘                    │  CF "items": JSON values    │
//! ┌──────────────┐  scope(users:{id}) │  CF "meta":  updatedAt      │
//! │ RelayServer  │ ─────────────────► │  CF "blobs": LZ4 snapshots  │
//! └──────────────┘                    └─────────────────────────────┘
//! ```

pub mod rocks;

use std::fmt;

pub use rocks::{CacheEntry, ItemMeta, LwwOutcome, ScopedStore, Store, StoreConfig, StoreError};

/// A storage and broadcast partition.
///
/// Devices use the single `app` namespace. The relay keeps one namespace
/// per authenticated user, shared by every connection of that user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace(String);

impl Namespace {
    pub fn app() -> Self {
        Self("app".to_string())
    }

    pub fn user(user_id: &str) -> Self {
        Self(format!("users:{user_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
