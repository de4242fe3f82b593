//! Typed container adapters.
//!
//! Each adapter is a [`RefHandle`] plus the session's
//! [`ReplicatedDocument`]. Reading goes through the shared cell. Whole-value
//! assignment publishes a write event, which [`project`] later turns into
//! container operations. Explicit container operations (`insert`, `push`,
//! ...) apply to the container directly, commit, and publish the value read
//! back from it.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use loro::UpdateOptions;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::document::{ContainerKind, ReplicatedDocument};
use crate::error::{SyncError, SyncResult};
use crate::key::StorageKey;
use crate::reconcile::{self, ListOps, ReconcileReport};
use crate::registry::{RefHandle, SharedRef, WriteEvent, WriteOrigin};

/// How a key's value is stored, chosen when its adapter is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Binding {
    /// Cache and key-value channel only.
    Opaque,
    Text,
    Map,
    List,
    /// Movable list kept unique and sorted by `field`.
    SortedSet { field: String },
}

impl Binding {
    pub fn kind(&self) -> Option<ContainerKind> {
        match self {
            Binding::Opaque => None,
            Binding::Text => Some(ContainerKind::Text),
            Binding::Map => Some(ContainerKind::Map),
            Binding::List => Some(ContainerKind::List),
            Binding::SortedSet { .. } => Some(ContainerKind::SortedList),
        }
    }

    /// Value used when nothing is cached yet.
    pub fn default_value(&self) -> Value {
        match self.kind() {
            Some(kind) => kind.empty_value(),
            None => Value::Null,
        }
    }

    /// Create the container for `key` if the binding has one.
    pub fn ensure_container(&self, document: &ReplicatedDocument, key: &StorageKey) -> SyncResult<()> {
        match self {
            Binding::Opaque => {}
            Binding::Text => {
                document.get_or_create_text(key)?;
            }
            Binding::Map => {
                document.get_or_create_map(key)?;
            }
            Binding::List => {
                document.get_or_create_list(key)?;
            }
            Binding::SortedSet { .. } => {
                document.get_or_create_sorted_list(key)?;
            }
        }
        Ok(())
    }
}

/// Apply a whole value to the container bound to `key` and commit.
///
/// Returns the container's value afterwards, or `None` for opaque keys.
/// Values of the wrong shape are rejected without touching the container.
pub fn project(
    document: &ReplicatedDocument,
    key: &StorageKey,
    binding: &Binding,
    value: &Value,
) -> SyncResult<Option<Value>> {
    let report = match binding {
        Binding::Opaque => return Ok(None),
        Binding::Text => {
            let text = expect_str(key, value)?;
            document
                .get_or_create_text(key)?
                .update(text, UpdateOptions::default())
                .map_err(SyncError::crdt)?;
            ReconcileReport::default()
        }
        Binding::Map => {
            let fields = expect_object(key, value)?;
            let map = document.get_or_create_map(key)?;
            for (field, item) in fields {
                map.insert(field, crate::document::convert::to_loro(item))
                    .map_err(SyncError::crdt)?;
            }
            ReconcileReport::default()
        }
        Binding::List => {
            let desired = expect_array(key, value)?;
            let mut list = document.get_or_create_list(key)?;
            let live = live_items(document, key, ContainerKind::List);
            reconcile::reconcile_list(&live, desired, &mut list)?
        }
        Binding::SortedSet { field } => {
            let desired = expect_array(key, value)?;
            let mut list = document.get_or_create_sorted_list(key)?;
            let live = live_items(document, key, ContainerKind::SortedList);
            reconcile::reconcile_sorted(live, desired, field, &mut list)?
        }
    };
    document.commit();
    if !report.is_noop() {
        log::trace!("Reconciled {key}: {report:?}");
    }

    let kind = binding.kind().unwrap_or(ContainerKind::Map);
    Ok(Some(document.materialize(key, kind)))
}

/// Project a published write unless it already came from the container.
pub fn project_event(document: &ReplicatedDocument, event: &WriteEvent) -> SyncResult<Option<Value>> {
    if event.origin == WriteOrigin::Container {
        return Ok(None);
    }
    project(document, &event.key, &event.binding, &event.value)
}

fn live_items(document: &ReplicatedDocument, key: &StorageKey, kind: ContainerKind) -> Vec<Value> {
    match document.materialize(key, kind) {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

fn expect_str<'a>(key: &StorageKey, value: &'a Value) -> SyncResult<&'a str> {
    value.as_str().ok_or_else(|| shape(key, "a string"))
}

fn expect_object<'a>(key: &StorageKey, value: &'a Value) -> SyncResult<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| shape(key, "an object"))
}

fn expect_array<'a>(key: &StorageKey, value: &'a Value) -> SyncResult<&'a [Value]> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| shape(key, "an array"))
}

fn shape(key: &StorageKey, expected: &'static str) -> SyncError {
    SyncError::Shape {
        key: key.to_string(),
        expected,
    }
}

// ─── Adapters ─────────────────────────────────────────────────────────

/// Opaque value: cache plus key-value channel.
#[derive(Debug)]
pub struct StorageItem {
    handle: RefHandle,
}

impl StorageItem {
    pub(crate) fn new(handle: RefHandle) -> Self {
        Self { handle }
    }

    pub fn key(&self) -> &StorageKey {
        self.handle.key()
    }

    pub fn get(&self) -> Value {
        self.handle.get()
    }

    pub fn set(&self, value: Value) -> u64 {
        self.handle.set(value)
    }

    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.handle.subscribe()
    }

    pub fn handle(&self) -> &RefHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut RefHandle {
        &mut self.handle
    }
}

/// Binary value stored as a base64 string in an opaque item. A key with
/// nothing stored reads as empty.
#[derive(Debug)]
pub struct StorageBytes {
    handle: RefHandle,
}

impl StorageBytes {
    pub(crate) fn new(handle: RefHandle) -> Self {
        Self { handle }
    }

    pub fn key(&self) -> &StorageKey {
        self.handle.key()
    }

    pub fn get(&self) -> SyncResult<Vec<u8>> {
        match self.handle.get() {
            Value::Null => Ok(Vec::new()),
            Value::String(encoded) => STANDARD
                .decode(encoded)
                .map_err(|_| shape(self.handle.key(), "base64 bytes")),
            _ => Err(shape(self.handle.key(), "base64 bytes")),
        }
    }

    pub fn set(&self, bytes: &[u8]) -> u64 {
        self.handle.set(Value::String(STANDARD.encode(bytes)))
    }

    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.handle.subscribe()
    }
}

/// Collaborative text.
#[derive(Debug)]
pub struct StorageText {
    handle: RefHandle,
}

impl StorageText {
    pub(crate) fn new(handle: RefHandle) -> Self {
        Self { handle }
    }

    pub fn key(&self) -> &StorageKey {
        self.handle.key()
    }

    pub fn get(&self) -> String {
        self.handle.get().as_str().unwrap_or_default().to_string()
    }

    /// Replace the whole text; the container computes the edit.
    pub fn set(&self, text: impl Into<String>) -> u64 {
        self.handle.set(Value::String(text.into()))
    }

    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.handle.subscribe()
    }

    pub fn shared(&self) -> &Arc<SharedRef> {
        self.handle.shared()
    }
}

/// Collaborative map of JSON values.
#[derive(Debug)]
pub struct StorageMap {
    handle: RefHandle,
    document: Arc<ReplicatedDocument>,
}

impl StorageMap {
    pub(crate) fn new(handle: RefHandle, document: Arc<ReplicatedDocument>) -> Self {
        Self { handle, document }
    }

    pub fn key(&self) -> &StorageKey {
        self.handle.key()
    }

    pub fn get(&self) -> Value {
        self.handle.get()
    }

    pub fn get_field(&self, field: &str) -> Option<Value> {
        self.handle.get().get(field).cloned()
    }

    /// Assign the whole object. Fields are set one by one; fields missing
    /// from `value` are kept.
    pub fn set(&self, value: Map<String, Value>) -> u64 {
        self.handle.set(Value::Object(value))
    }

    pub fn insert(&self, field: &str, value: Value) -> SyncResult<u64> {
        let key = self.handle.key().clone();
        self.document
            .get_or_create_map(&key)?
            .insert(field, crate::document::convert::to_loro(&value))
            .map_err(SyncError::crdt)?;
        Ok(self.commit(&key))
    }

    pub fn remove(&self, field: &str) -> SyncResult<u64> {
        let key = self.handle.key().clone();
        self.document
            .get_or_create_map(&key)?
            .delete(field)
            .map_err(SyncError::crdt)?;
        Ok(self.commit(&key))
    }

    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.handle.subscribe()
    }

    fn commit(&self, key: &StorageKey) -> u64 {
        self.document.commit();
        let value = self.document.materialize(key, ContainerKind::Map);
        self.handle.shared().set_from_container(value)
    }
}

/// Collaborative ordered list.
#[derive(Debug)]
pub struct StorageList {
    handle: RefHandle,
    document: Arc<ReplicatedDocument>,
}

impl StorageList {
    pub(crate) fn new(handle: RefHandle, document: Arc<ReplicatedDocument>) -> Self {
        Self { handle, document }
    }

    pub fn key(&self) -> &StorageKey {
        self.handle.key()
    }

    pub fn get(&self) -> Vec<Value> {
        as_items(self.handle.get())
    }

    /// Assign the whole sequence; positions that differ are rewritten.
    pub fn set(&self, items: Vec<Value>) -> u64 {
        self.handle.set(Value::Array(items))
    }

    pub fn push(&self, value: Value) -> SyncResult<u64> {
        self.apply(|list| ListOps::push(list, &value))
    }

    pub fn insert(&self, pos: usize, value: Value) -> SyncResult<u64> {
        self.apply(|list| ListOps::insert(list, pos, &value))
    }

    /// Delete `len` items starting at `pos`.
    pub fn delete(&self, pos: usize, len: usize) -> SyncResult<u64> {
        let key = self.handle.key().clone();
        self.document
            .get_or_create_list(&key)?
            .delete(pos, len)
            .map_err(SyncError::crdt)?;
        Ok(self.commit(&key))
    }

    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.handle.subscribe()
    }

    fn apply(&self, op: impl FnOnce(&mut loro::LoroList) -> SyncResult<()>) -> SyncResult<u64> {
        let key = self.handle.key().clone();
        let mut list = self.document.get_or_create_list(&key)?;
        op(&mut list)?;
        Ok(self.commit(&key))
    }

    fn commit(&self, key: &StorageKey) -> u64 {
        self.document.commit();
        let value = self.document.materialize(key, ContainerKind::List);
        self.handle.shared().set_from_container(value)
    }
}

/// Collaborative set of objects, unique and sorted by one field.
#[derive(Debug)]
pub struct StorageSet {
    handle: RefHandle,
    document: Arc<ReplicatedDocument>,
    field: String,
}

impl StorageSet {
    pub(crate) fn new(handle: RefHandle, document: Arc<ReplicatedDocument>, field: String) -> Self {
        Self {
            handle,
            document,
            field,
        }
    }

    pub fn key(&self) -> &StorageKey {
        self.handle.key()
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn get(&self) -> Vec<Value> {
        as_items(self.handle.get())
    }

    /// Reconcile towards `items`: one element per key, ascending.
    pub fn set(&self, items: Vec<Value>) -> u64 {
        self.handle.set(Value::Array(items))
    }

    pub fn push(&self, value: Value) -> SyncResult<u64> {
        self.apply(|list| ListOps::push(list, &value))
    }

    pub fn insert(&self, pos: usize, value: Value) -> SyncResult<u64> {
        self.apply(|list| ListOps::insert(list, pos, &value))
    }

    /// Delete `len` items starting at `pos`.
    pub fn delete(&self, pos: usize, len: usize) -> SyncResult<u64> {
        let key = self.handle.key().clone();
        self.document
            .get_or_create_sorted_list(&key)?
            .delete(pos, len)
            .map_err(SyncError::crdt)?;
        Ok(self.commit(&key))
    }

    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.handle.subscribe()
    }

    fn apply(
        &self,
        op: impl FnOnce(&mut loro::LoroMovableList) -> SyncResult<()>,
    ) -> SyncResult<u64> {
        let key = self.handle.key().clone();
        let mut list = self.document.get_or_create_sorted_list(&key)?;
        op(&mut list)?;
        Ok(self.commit(&key))
    }

    fn commit(&self, key: &StorageKey) -> u64 {
        self.document.commit();
        let value = self.document.materialize(key, ContainerKind::SortedList);
        self.handle.shared().set_from_container(value)
    }
}

/// Collaborative counter. Not backed by a shared reference: every
/// operation commits and the value is read from the document.
#[derive(Debug, Clone)]
pub struct StorageCounter {
    key: StorageKey,
    document: Arc<ReplicatedDocument>,
}

impl StorageCounter {
    pub(crate) fn new(key: StorageKey, document: Arc<ReplicatedDocument>) -> SyncResult<Self> {
        document.get_or_create_counter(&key)?;
        Ok(Self { key, document })
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub fn get(&self) -> f64 {
        self.document
            .materialize(&self.key, ContainerKind::Counter)
            .as_f64()
            .unwrap_or(0.0)
    }

    pub fn increment(&self, by: f64) -> SyncResult<()> {
        self.document
            .get_or_create_counter(&self.key)?
            .increment(by)
            .map_err(SyncError::crdt)?;
        self.document.commit();
        Ok(())
    }

    pub fn decrement(&self, by: f64) -> SyncResult<()> {
        self.document
            .get_or_create_counter(&self.key)?
            .decrement(by)
            .map_err(SyncError::crdt)?;
        self.document.commit();
        Ok(())
    }
}

fn as_items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}
