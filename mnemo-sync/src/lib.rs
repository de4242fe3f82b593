//! # mnemo-sync, local-first sync engine
//!
//! Keeps application state in a device-local durable cache and syncs it
//! through a relay over two websocket channels: binary CRDT operations for
//! structured values, and last-writer-wins JSON records for everything.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  adapters   ┌──────────┐  write bus  ┌──────────────┐
//! │ consumer     │ ◄─────────► │ Registry │ ──────────► │ DurableCache │
//! └──────────────┘             └────┬─────┘             │ (RocksDB)    │
//!                                   │ project           └──────────────┘
//!                                   ▼
//!                         ┌────────────────────┐  ops   ┌─────────────┐
//!                         │ ReplicatedDocument │ ◄────► │ RelayServer │
//!                         │ (loro)             │  kv    │ (per user)  │
//!                         └────────────────────┘ ◄────► └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: session context wiring everything together
//! - [`registry`]: one shared reactive cell per key
//! - [`adapters`]: typed views: opaque item, bytes, text, map, list, sorted set, counter
//! - [`document`]: the CRDT document, snapshots and change streams
//! - [`reconcile`]: list and sorted-set reconciliation
//! - [`cache`] / [`storage`]: durable cache over RocksDB
//! - [`client`] / [`server`]: reconnecting sockets and the relay
//! - [`browser`]: tree view of the cached key space

pub mod adapters;
pub mod auth;
pub mod broadcast;
pub mod browser;
pub mod cache;
pub mod client;
pub mod clock;
pub mod compute;
pub mod document;
pub mod engine;
pub mod error;
pub mod key;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod server;
pub mod storage;
pub mod throttle;

// Re-exports for convenience
pub use adapters::{
    Binding, StorageBytes, StorageCounter, StorageItem, StorageList, StorageMap, StorageSet,
    StorageText,
};
pub use auth::{Authenticator, StaticTokens};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use browser::{browse, StoragePath};
pub use cache::{CacheStats, DurableCache};
pub use client::{ConnectionState, OfflineQueue, SendOutcome, Socket, SocketConfig, SocketEvent};
pub use clock::LwwClock;
pub use compute::{Compiled, Compute, Derived, Diagnostic, Severity};
pub use document::{
    ContainerChange, ContainerKind, DocumentConfig, ReplicatedDocument, ReplicatedTree, UndoHistory,
};
pub use engine::{EngineConfig, EngineEvent, EngineUndo, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use key::StorageKey;
pub use protocol::{Channel, Frame, KvFrame, ProtocolError};
pub use reconcile::{reconcile_list, reconcile_sorted, ReconcileReport};
pub use registry::{RefHandle, Registry, RegistryStats, SharedRef, WriteEvent, WriteOrigin};
pub use server::{RelayServer, RelayStats, ServerConfig};
pub use storage::{CacheEntry, ItemMeta, LwwOutcome, Namespace, Store, StoreConfig, StoreError};
