//! Replicated Document: the session's single CRDT document.
//!
//! Every structured key maps to one root container whose type is fixed the
//! first time the key is requested or the first time a snapshot or update
//! carrying it is imported, whichever comes first. Root container names
//! cannot contain `/`, so the key's separators are stored as `:`;
//! normalization maps them back.
//!
//! Two streams leave the document:
//! - local update bytes, produced on every local commit, for the operation
//!   channel ([`ReplicatedDocument::subscribe_local_updates`]);
//! - change batches for containers touched by imported updates, materialized
//!   as JSON for the cache and the live references
//!   ([`ReplicatedDocument::subscribe_changes`]).

pub mod convert;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use loro::event::DiffEvent;
use loro::{
    ContainerID, ContainerType, EventTriggerKind, ExportMode, LoroCounter, LoroDoc, LoroList,
    LoroMap, LoroMovableList, LoroText, LoroTree, LoroValue, TreeID, TreeParentId, UndoManager,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::DurableCache;
use crate::error::{SyncError, SyncResult};
use crate::key::{StorageKey, SEPARATOR};

/// Blob name of the locally persisted snapshot.
pub const SNAPSHOT_BLOB: &str = "crdt";

/// Document tuning.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Minimum spacing between two local snapshot exports.
    pub snapshot_interval: Duration,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_millis(1000),
        }
    }
}

/// Undo steps kept by an [`UndoHistory`].
pub const UNDO_MAX_STEPS: usize = 100;
/// Local commits closer together than this undo as one step.
pub const UNDO_MERGE_INTERVAL_MS: i64 = 1000;

/// Separator used inside root container names.
const ROOT_SEPARATOR: char = ':';

/// The closed set of container types a key can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    Text,
    Map,
    List,
    SortedList,
    Counter,
    Tree,
}

impl ContainerKind {
    fn from_container_type(ty: &ContainerType) -> Option<Self> {
        match ty {
            ContainerType::Text => Some(ContainerKind::Text),
            ContainerType::Map => Some(ContainerKind::Map),
            ContainerType::List => Some(ContainerKind::List),
            ContainerType::MovableList => Some(ContainerKind::SortedList),
            ContainerType::Counter => Some(ContainerKind::Counter),
            ContainerType::Tree => Some(ContainerKind::Tree),
            _ => None,
        }
    }

    /// Materialized value of an empty container of this kind.
    pub fn empty_value(self) -> Value {
        match self {
            ContainerKind::Text => Value::String(String::new()),
            ContainerKind::Map => Value::Object(serde_json::Map::new()),
            ContainerKind::List | ContainerKind::SortedList | ContainerKind::Tree => {
                Value::Array(Vec::new())
            }
            ContainerKind::Counter => Value::from(0.0),
        }
    }
}

/// Materialized value of one container touched by an imported update.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerChange {
    pub key: StorageKey,
    pub kind: ContainerKind,
    pub value: Value,
}

/// Root container name for `key`.
pub fn root_name(key: &StorageKey) -> String {
    key.as_str().replace(SEPARATOR, &ROOT_SEPARATOR.to_string())
}

/// Storage key addressed by a root container name.
pub fn key_for_root(name: &str) -> SyncResult<StorageKey> {
    StorageKey::new(name)
}

pub struct ReplicatedDocument {
    doc: LoroDoc,
    kinds: Mutex<HashMap<StorageKey, ContainerKind>>,
}

impl std::fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("containers", &self.kinds.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDocument {
    pub fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            kinds: Mutex::new(HashMap::new()),
        }
    }

    /// Build a document from a snapshot. Every root it contains is bound to
    /// its stored type.
    pub fn from_snapshot(bytes: &[u8]) -> SyncResult<Self> {
        let document = Self::new();
        document.doc.import(bytes).map_err(SyncError::crdt)?;
        document.record_root_kinds();
        Ok(document)
    }

    /// Load the last local snapshot. A snapshot that cannot be read or
    /// decoded is logged, removed, and replaced by an empty document.
    pub fn load(cache: &DurableCache) -> Self {
        let bytes = match cache.get_blob(SNAPSHOT_BLOB) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Self::new(),
            Err(e) => {
                log::warn!("Unreadable local snapshot, starting empty: {e}");
                discard_snapshot(cache);
                return Self::new();
            }
        };

        match Self::from_snapshot(&bytes) {
            Ok(document) => {
                log::debug!("Loaded local snapshot ({} bytes)", bytes.len());
                document
            }
            Err(e) => {
                log::warn!("Corrupt local snapshot, starting empty: {e}");
                discard_snapshot(cache);
                Self::new()
            }
        }
    }

    /// Export and store the full snapshot.
    pub fn persist(&self, cache: &DurableCache) -> SyncResult<usize> {
        let snapshot = self.export_snapshot()?;
        cache.set_blob(SNAPSHOT_BLOB, &snapshot)?;
        Ok(snapshot.len())
    }

    // ─── Containers ───────────────────────────────────────────────────

    /// Bind `key` to `kind`, failing if it is already bound to another kind.
    fn claim(&self, key: &StorageKey, kind: ContainerKind) -> SyncResult<String> {
        let mut kinds = self.kinds.lock();
        match kinds.get(key) {
            Some(existing) if *existing != kind => Err(SyncError::KindMismatch {
                key: key.to_string(),
                existing: *existing,
                requested: kind,
            }),
            Some(_) => Ok(root_name(key)),
            None => {
                kinds.insert(key.clone(), kind);
                Ok(root_name(key))
            }
        }
    }

    pub fn get_or_create_text(&self, key: &StorageKey) -> SyncResult<LoroText> {
        let name = self.claim(key, ContainerKind::Text)?;
        Ok(self.doc.get_text(name.as_str()))
    }

    pub fn get_or_create_map(&self, key: &StorageKey) -> SyncResult<LoroMap> {
        let name = self.claim(key, ContainerKind::Map)?;
        Ok(self.doc.get_map(name.as_str()))
    }

    pub fn get_or_create_list(&self, key: &StorageKey) -> SyncResult<LoroList> {
        let name = self.claim(key, ContainerKind::List)?;
        Ok(self.doc.get_list(name.as_str()))
    }

    pub fn get_or_create_sorted_list(&self, key: &StorageKey) -> SyncResult<LoroMovableList> {
        let name = self.claim(key, ContainerKind::SortedList)?;
        Ok(self.doc.get_movable_list(name.as_str()))
    }

    pub fn get_or_create_counter(&self, key: &StorageKey) -> SyncResult<LoroCounter> {
        let name = self.claim(key, ContainerKind::Counter)?;
        Ok(self.doc.get_counter(name.as_str()))
    }

    pub fn get_or_create_tree(&self, key: &StorageKey) -> SyncResult<ReplicatedTree> {
        let name = self.claim(key, ContainerKind::Tree)?;
        Ok(ReplicatedTree {
            tree: self.doc.get_tree(name.as_str()),
        })
    }

    pub fn kind_of(&self, key: &StorageKey) -> Option<ContainerKind> {
        self.kinds.lock().get(key).copied()
    }

    /// Bind every root container present in the document to its type. A
    /// root whose key is already bound to another type keeps the existing
    /// binding.
    fn record_root_kinds(&self) {
        let LoroValue::Map(roots) = self.doc.get_value() else {
            return;
        };
        let mut kinds = self.kinds.lock();
        for (name, value) in roots.iter() {
            let LoroValue::Container(ContainerID::Root { container_type, .. }) = value else {
                continue;
            };
            let Some(kind) = ContainerKind::from_container_type(container_type) else {
                continue;
            };
            let Ok(key) = key_for_root(name) else {
                continue;
            };
            match kinds.get(&key) {
                Some(existing) if *existing != kind => {
                    log::warn!("Root {name:?} arrived as {kind:?}, {key} stays {existing:?}");
                }
                Some(_) => {}
                None => {
                    kinds.insert(key, kind);
                }
            }
        }
    }

    /// Commit pending local operations, emitting one local update.
    pub fn commit(&self) {
        self.doc.commit();
    }

    // ─── Encoding ─────────────────────────────────────────────────────

    pub fn export_snapshot(&self) -> SyncResult<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(SyncError::crdt)
    }

    /// Merge a snapshot or update from elsewhere. Bytes that fail to decode
    /// are logged and dropped; returns whether the import succeeded. Roots
    /// seen for the first time are bound to their imported type.
    pub fn apply_remote(&self, bytes: &[u8]) -> bool {
        match self.doc.import(bytes) {
            Ok(_) => {
                self.record_root_kinds();
                true
            }
            Err(e) => {
                log::warn!("Dropping undecodable update ({} bytes): {e}", bytes.len());
                false
            }
        }
    }

    // ─── Materialization ──────────────────────────────────────────────

    /// Current JSON value of the container bound to `key`.
    pub fn materialize(&self, key: &StorageKey, kind: ContainerKind) -> Value {
        let root = self.doc.get_deep_value();
        lookup(&root, &root_name(key), kind)
    }

    /// Whole document as JSON keyed by storage key.
    pub fn to_json(&self) -> Value {
        let root = self.doc.get_deep_value();
        match &root {
            LoroValue::Map(fields) => Value::Object(
                fields
                    .iter()
                    .filter_map(|(name, value)| {
                        let key = key_for_root(name).ok()?;
                        Some((key.to_string(), convert::to_json(value)))
                    })
                    .collect(),
            ),
            _ => Value::Object(serde_json::Map::new()),
        }
    }

    // ─── Streams ──────────────────────────────────────────────────────

    /// Bytes of every local commit, in commit order.
    pub fn subscribe_local_updates(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.doc
            .subscribe_local_update(Box::new(move |bytes: &Vec<u8>| {
                tx.send(bytes.clone()).is_ok()
            }))
            .detach();
        rx
    }

    /// Containers changed by imported updates, one batch per import.
    pub fn subscribe_changes(self: &Arc<Self>) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.doc
            .subscribe_root(Arc::new(move |event: DiffEvent| {
                if !matches!(event.triggered_by, EventTriggerKind::Import) {
                    return;
                }
                let mut touched: Vec<(String, ContainerKind)> = Vec::new();
                for diff in &event.events {
                    let root = diff
                        .path
                        .first()
                        .map(|(id, _)| id)
                        .unwrap_or(diff.target);
                    if let ContainerID::Root {
                        name,
                        container_type,
                    } = root
                    {
                        if let Some(kind) = ContainerKind::from_container_type(container_type) {
                            let entry = (name.to_string(), kind);
                            if !touched.contains(&entry) {
                                touched.push(entry);
                            }
                        }
                    }
                }
                if !touched.is_empty() {
                    let _ = tx.send(touched);
                }
            }))
            .detach();
        ChangeStream {
            document: Arc::clone(self),
            rx,
        }
    }

    /// Undo history of local commits made from now on. Remote updates are
    /// never undone.
    pub fn undo_history(&self) -> UndoHistory {
        let mut manager = UndoManager::new(&self.doc);
        manager.set_max_undo_steps(UNDO_MAX_STEPS);
        manager.set_merge_interval(UNDO_MERGE_INTERVAL_MS);
        UndoHistory { manager }
    }

    /// The underlying CRDT document.
    pub fn inner(&self) -> &LoroDoc {
        &self.doc
    }
}

/// Undo and redo over a document's local commits.
pub struct UndoHistory {
    manager: UndoManager,
}

impl std::fmt::Debug for UndoHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoHistory")
            .field("can_undo", &self.can_undo())
            .field("can_redo", &self.can_redo())
            .finish()
    }
}

impl UndoHistory {
    /// Revert the latest local step. Returns false if there was none.
    pub fn undo(&mut self) -> SyncResult<bool> {
        self.manager.undo().map_err(SyncError::crdt)
    }

    pub fn redo(&mut self) -> SyncResult<bool> {
        self.manager.redo().map_err(SyncError::crdt)
    }

    pub fn can_undo(&self) -> bool {
        self.manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.manager.can_redo()
    }
}

fn discard_snapshot(cache: &DurableCache) {
    if let Err(e) = cache.remove_blob(SNAPSHOT_BLOB) {
        log::error!("Failed to remove corrupt snapshot: {e}");
    }
}

fn lookup(root: &LoroValue, name: &str, kind: ContainerKind) -> Value {
    match root {
        LoroValue::Map(fields) => fields
            .get(name)
            .map(convert::to_json)
            .unwrap_or_else(|| kind.empty_value()),
        _ => kind.empty_value(),
    }
}

/// Receiver side of [`ReplicatedDocument::subscribe_changes`].
pub struct ChangeStream {
    document: Arc<ReplicatedDocument>,
    rx: mpsc::UnboundedReceiver<Vec<(String, ContainerKind)>>,
}

impl ChangeStream {
    /// Wait for the next import and materialize every container it touched.
    /// Containers whose type differs from the key's binding are skipped.
    /// Returns `None` once the document is gone.
    pub async fn recv(&mut self) -> Option<Vec<ContainerChange>> {
        let touched = self.rx.recv().await?;
        let root = self.document.doc.get_deep_value();
        let changes = touched
            .into_iter()
            .filter_map(|(name, kind)| {
                let Ok(key) = key_for_root(&name) else {
                    log::debug!("Ignoring change to unaddressable container {name:?}");
                    return None;
                };
                if let Some(bound) = self.document.kind_of(&key) {
                    if bound != kind {
                        log::debug!("Ignoring {kind:?} change to {key}, bound as {bound:?}");
                        return None;
                    }
                }
                Some(ContainerChange {
                    value: lookup(&root, &name, kind),
                    key,
                    kind,
                })
            })
            .collect();
        Some(changes)
    }
}

/// Tree container handle with optional-parent helpers.
#[derive(Debug, Clone)]
pub struct ReplicatedTree {
    tree: LoroTree,
}

impl ReplicatedTree {
    /// Create a node under `parent`, or at the root when `None`.
    pub fn create(&self, parent: Option<TreeID>) -> SyncResult<TreeID> {
        self.tree.create(parent_id(parent)).map_err(SyncError::crdt)
    }

    pub fn mov(&self, target: TreeID, parent: Option<TreeID>) -> SyncResult<()> {
        self.tree
            .mov(target, parent_id(parent))
            .map_err(SyncError::crdt)
    }

    pub fn delete(&self, target: TreeID) -> SyncResult<()> {
        self.tree.delete(target).map_err(SyncError::crdt)
    }

    pub fn inner(&self) -> &LoroTree {
        &self.tree
    }
}

fn parent_id(parent: Option<TreeID>) -> TreeParentId {
    match parent {
        Some(id) => TreeParentId::Node(id),
        None => TreeParentId::Root,
    }
}
