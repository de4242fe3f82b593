//! The client-side sync engine.
//!
//! [`SyncEngine`] is the session context: it owns the local store, the
//! Durable Cache, the single [`ReplicatedDocument`], the Shared Reference
//! Registry and, when a server is configured, one socket per channel. Typed
//! adapters are handed out by key and every piece of background work runs
//! on its own task:
//!
//! ```text
//!  adapter.set ──► write bus ─┬─► cache writer ──► project into container ──► cache
//!                             └─► kv forwarder ──► kv socket
//!  document commit ──► local updates ──► ops socket, snapshot throttle
//!  ops socket ──► import ──► change stream ──► cache, SharedRef::set_local
//!  kv socket  ──► LWW apply ──► cache, SharedRef::set_local
//! ```
//!
//! Inbound state reaches live references only through `set_local`, which
//! never publishes on the write bus, so nothing received is sent back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::adapters::{
    self, Binding, StorageBytes, StorageCounter, StorageItem, StorageList, StorageMap, StorageSet,
    StorageText,
};
use crate::browser::{self, StoragePath};
use crate::cache::DurableCache;
use crate::client::{ConnectionState, SendOutcome, Socket, SocketConfig, SocketEvent};
use crate::clock::LwwClock;
use crate::compute::{Compute, Derived};
use crate::document::{
    ChangeStream, DocumentConfig, ReplicatedDocument, ReplicatedTree, UndoHistory,
};
use crate::error::{SyncError, SyncResult};
use crate::key::StorageKey;
use crate::protocol::{Channel, Frame, KvFrame};
use crate::registry::{RefHandle, Registry, WriteBus, WriteEvent, DEFAULT_WRITE_INTERVAL};
use crate::storage::{LwwOutcome, Store, StoreConfig};
use crate::throttle::Throttle;

pub const DEFAULT_OPS_PATH: &str = "/api/crdt";
pub const DEFAULT_KV_PATH: &str = "/api/user-storage";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Relay base URL such as `ws://localhost:8080`. The engine is
    /// local-only when absent.
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub ops_path: String,
    pub kv_path: String,
    pub store: StoreConfig,
    pub document: DocumentConfig,
    /// Reconnection and queue tuning shared by both sockets; the URL and
    /// token are filled in per channel.
    pub socket: SocketConfig,
    /// Capacity of the write bus and the engine event stream.
    pub event_capacity: usize,
    /// Minimum spacing between two published writes of one key.
    pub write_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            ops_path: DEFAULT_OPS_PATH.to_string(),
            kv_path: DEFAULT_KV_PATH.to_string(),
            store: StoreConfig::default(),
            document: DocumentConfig::default(),
            socket: SocketConfig::default(),
            event_capacity: 1024,
            write_interval: DEFAULT_WRITE_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Local-only engine on a throwaway store.
    pub fn for_testing(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            store: StoreConfig::for_testing(path),
            document: DocumentConfig {
                snapshot_interval: Duration::from_millis(20),
            },
            write_interval: Duration::from_millis(20),
            ..Self::default()
        }
    }

    pub fn with_server(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self.token = Some(token.into());
        self
    }

    fn socket_for(&self, base: &str, path: &str) -> SocketConfig {
        SocketConfig {
            url: format!("{}{}", base.trim_end_matches('/'), path),
            token: self.token.clone(),
            ..self.socket.clone()
        }
    }
}

/// Connection lifecycle notifications, per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    Connected(Channel),
    Disconnected(Channel),
    /// Reconnection gave up; call [`SyncEngine::connect`] to try again.
    ConnectionFailed(Channel),
    /// The relay refused the token. Nothing is retried until
    /// [`SyncEngine::connect`] is called again.
    Unauthorized(Channel),
}

struct Sockets {
    ops: Arc<Socket>,
    kv: Arc<Socket>,
}

pub struct SyncEngine {
    store: Arc<Store>,
    cache: Arc<DurableCache>,
    document: Arc<ReplicatedDocument>,
    registry: Arc<Registry>,
    clock: Arc<LwwClock>,
    sockets: Option<Sockets>,
    events: broadcast::Sender<EngineEvent>,
    snapshots: Option<Arc<Throttle>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.store)
            .field("online", &self.sockets.is_some())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Open the local store, load the last snapshot and start the
    /// background tasks. Must be called inside a tokio runtime. Sockets
    /// stay closed until [`SyncEngine::connect`].
    pub fn start(config: EngineConfig) -> SyncResult<Self> {
        let store = Arc::new(Store::open(config.store.clone())?);
        let cache = Arc::new(DurableCache::new(&store));
        let document = Arc::new(ReplicatedDocument::load(&cache));
        let clock = Arc::new(LwwClock::new());
        let registry = Arc::new(
            Registry::new(config.event_capacity, Arc::clone(&clock))
                .with_write_interval(config.write_interval),
        );
        let (events, _) = broadcast::channel(config.event_capacity);

        let snapshots = {
            let document = Arc::clone(&document);
            let cache = Arc::clone(&cache);
            Arc::new(Throttle::spawn(config.document.snapshot_interval, move || {
                match document.persist(&cache) {
                    Ok(bytes) => trace!("Persisted local snapshot ({bytes} bytes)"),
                    Err(e) => warn!("Failed to persist local snapshot: {e}"),
                }
            }))
        };

        let mut tasks = Vec::new();
        let bus = Arc::clone(registry.bus());

        tasks.push(tokio::spawn(write_through(
            registry.subscribe_writes(),
            Arc::clone(&bus),
            Arc::clone(&cache),
            Arc::clone(&document),
            Arc::clone(&registry),
        )));
        tasks.push(tokio::spawn(apply_changes(
            document.subscribe_changes(),
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&clock),
            Arc::clone(&snapshots),
        )));

        let sockets = match &config.server_url {
            Some(base) => {
                let mut ops = Socket::spawn(config.socket_for(base, &config.ops_path));
                let mut kv = Socket::spawn(config.socket_for(base, &config.kv_path));
                let ops_events = ops.take_event_rx();
                let kv_events = kv.take_event_rx();
                let sockets = Sockets {
                    ops: Arc::new(ops),
                    kv: Arc::new(kv),
                };

                if let Some(rx) = ops_events {
                    tasks.push(tokio::spawn(drive_ops(
                        rx,
                        Arc::clone(&sockets.ops),
                        Arc::clone(&document),
                        events.clone(),
                    )));
                }
                if let Some(rx) = kv_events {
                    tasks.push(tokio::spawn(drive_kv(
                        rx,
                        Arc::clone(&cache),
                        Arc::clone(&registry),
                        Arc::clone(&clock),
                        events.clone(),
                    )));
                }
                tasks.push(tokio::spawn(forward_writes(
                    registry.subscribe_writes(),
                    Arc::clone(&bus),
                    Arc::clone(&sockets.kv),
                )));
                info!("Sync engine configured for {base}");
                Some(sockets)
            }
            None => {
                info!("Sync engine running local-only");
                None
            }
        };

        tasks.push(tokio::spawn(forward_updates(
            document.subscribe_local_updates(),
            sockets.as_ref().map(|s| Arc::clone(&s.ops)),
            Arc::clone(&snapshots),
        )));

        Ok(Self {
            store,
            cache,
            document,
            registry,
            clock,
            sockets,
            events,
            snapshots: Some(snapshots),
            tasks,
        })
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// Open both channels. Local-only engines stay offline.
    pub fn connect(&self) {
        match &self.sockets {
            Some(sockets) => {
                sockets.ops.open();
                sockets.kv.open();
            }
            None => warn!("connect() on a local-only engine"),
        }
    }

    /// Close both channels and stop reconnecting. Writes made while
    /// disconnected are queued.
    pub fn disconnect(&self) {
        if let Some(sockets) = &self.sockets {
            sockets.ops.close();
            sockets.kv.close();
        }
    }

    pub fn connection_state(&self, channel: Channel) -> Option<ConnectionState> {
        let sockets = self.sockets.as_ref()?;
        Some(match channel {
            Channel::Ops => sockets.ops.state(),
            Channel::Kv => sockets.kv.state(),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ─── Adapters ─────────────────────────────────────────────────────

    pub async fn item(&self, key: &str) -> SyncResult<StorageItem> {
        Ok(StorageItem::new(self.acquire(key, Binding::Opaque).await?))
    }

    /// Binary value, stored base64-encoded.
    pub async fn bytes(&self, key: &str) -> SyncResult<StorageBytes> {
        Ok(StorageBytes::new(self.acquire(key, Binding::Opaque).await?))
    }

    pub async fn text(&self, key: &str) -> SyncResult<StorageText> {
        Ok(StorageText::new(self.acquire(key, Binding::Text).await?))
    }

    pub async fn map(&self, key: &str) -> SyncResult<StorageMap> {
        let handle = self.acquire(key, Binding::Map).await?;
        Ok(StorageMap::new(handle, Arc::clone(&self.document)))
    }

    pub async fn list(&self, key: &str) -> SyncResult<StorageList> {
        let handle = self.acquire(key, Binding::List).await?;
        Ok(StorageList::new(handle, Arc::clone(&self.document)))
    }

    /// A list kept sorted and unique by `field`.
    pub async fn sorted_set(&self, key: &str, field: &str) -> SyncResult<StorageSet> {
        let binding = Binding::SortedSet {
            field: field.to_string(),
        };
        let handle = self.acquire(key, binding).await?;
        Ok(StorageSet::new(handle, Arc::clone(&self.document), field.to_string()))
    }

    /// Recompute `compute` over the text at `key` whenever it changes.
    pub async fn derived<C: Compute>(&self, key: &str, compute: C) -> SyncResult<Derived<C>> {
        Ok(Derived::spawn(self.text(key).await?, compute))
    }

    pub fn counter(&self, key: &str) -> SyncResult<StorageCounter> {
        StorageCounter::new(StorageKey::new(key)?, Arc::clone(&self.document))
    }

    /// Tree container. Call [`SyncEngine::commit`] after a batch of edits.
    pub fn tree(&self, key: &str) -> SyncResult<ReplicatedTree> {
        self.document.get_or_create_tree(&StorageKey::new(key)?)
    }

    pub fn commit(&self) {
        self.document.commit();
    }

    /// Undo history over local commits made from now on. Keep one per
    /// session: each manager tracks its own steps.
    pub fn undo_manager(&self) -> EngineUndo {
        EngineUndo {
            history: self.document.undo_history(),
            document: Arc::clone(&self.document),
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
            clock: Arc::clone(&self.clock),
        }
    }

    /// Point a handle at another key of the same binding. Fails with
    /// [`SyncError::BindingMismatch`] if `key` is live under another
    /// binding; the handle then keeps its key.
    pub async fn rekey(&self, handle: &mut RefHandle, key: &str) -> SyncResult<()> {
        let key = StorageKey::new(key)?;
        let hydrator = self.hydrator();
        let hydrate = hydrator.clone().run(key.clone(), handle.binding().clone());
        handle.rekey(key, move || hydrate).await?;
        self.announce(&hydrator).await;
        Ok(())
    }

    async fn acquire(&self, key: &str, binding: Binding) -> SyncResult<RefHandle> {
        let key = StorageKey::new(key)?;
        let hydrator = self.hydrator();
        let hydrate = hydrator.clone().run(key.clone(), binding.clone());
        let handle = self
            .registry
            .acquire(key.clone(), binding.clone(), move || hydrate)
            .await?;
        if *handle.binding() != binding {
            return Err(SyncError::BindingMismatch {
                key: key.to_string(),
                existing: format!("{:?}", handle.binding()),
                requested: format!("{:?}", binding),
            });
        }
        self.announce(&hydrator).await;
        Ok(handle)
    }

    fn hydrator(&self) -> Hydrator {
        Hydrator {
            cache: Arc::clone(&self.cache),
            document: Arc::clone(&self.document),
            announce: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Send the cached record read by a hydration so the server can answer
    /// with anything newer. Runs once the reference is live, so the answer
    /// always finds it.
    async fn announce(&self, hydrator: &Hydrator) {
        let Some(frame) = hydrator.announce.lock().take() else {
            return;
        };
        let Some(sockets) = &self.sockets else {
            return;
        };
        match frame.to_frame() {
            Ok(encoded) => {
                if sockets.kv.send(encoded).await == SendOutcome::Failed {
                    debug!("Hydration announce for {} was not sent", frame.key);
                }
            }
            Err(e) => warn!("Could not encode announce for {}: {e}", frame.key),
        }
    }

    // ─── Inspection ───────────────────────────────────────────────────

    /// Tree view of cached keys under `base`.
    pub fn browse(&self, base: &str) -> SyncResult<BTreeMap<String, StoragePath>> {
        Ok(browser::browse(&self.cache, base)?)
    }

    pub fn cache(&self) -> &Arc<DurableCache> {
        &self.cache
    }

    pub fn document(&self) -> &Arc<ReplicatedDocument> {
        &self.document
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<LwwClock> {
        &self.clock
    }

    /// Persist the snapshot now and flush the store.
    pub fn flush(&self) -> SyncResult<()> {
        self.document.persist(&self.cache)?;
        self.store.flush()?;
        Ok(())
    }

    /// Stop every task, persist, and release the store.
    pub async fn shutdown(mut self) -> SyncResult<()> {
        self.disconnect();
        for task in std::mem::take(&mut self.tasks) {
            task.abort();
            let _ = task.await;
        }
        if let Some(snapshots) = self.snapshots.take() {
            match Arc::try_unwrap(snapshots) {
                Ok(throttle) => throttle.stop().await,
                Err(_) => warn!("Snapshot throttle still shared at shutdown"),
            }
        }
        self.flush()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if !self.tasks.is_empty() {
            if let Err(e) = self.document.persist(&self.cache) {
                warn!("Failed to persist snapshot on drop: {e}");
            }
        }
    }
}

/// Undo and redo that also refresh live references and the cache, since
/// the reverted operations are local and never reach the change stream.
pub struct EngineUndo {
    history: UndoHistory,
    document: Arc<ReplicatedDocument>,
    registry: Arc<Registry>,
    cache: Arc<DurableCache>,
    clock: Arc<LwwClock>,
}

impl std::fmt::Debug for EngineUndo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineUndo")
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

impl EngineUndo {
    pub fn undo(&mut self) -> SyncResult<bool> {
        let reverted = self.history.undo()?;
        if reverted {
            self.refresh();
        }
        Ok(reverted)
    }

    pub fn redo(&mut self) -> SyncResult<bool> {
        let reapplied = self.history.redo()?;
        if reapplied {
            self.refresh();
        }
        Ok(reapplied)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    fn refresh(&self) {
        self.document.commit();
        for shared in self.registry.live() {
            let Some(kind) = shared.binding().kind() else {
                continue;
            };
            let value = self.document.materialize(shared.key(), kind);
            if shared.get() == value {
                continue;
            }
            if let Err(e) = self.cache.put(shared.key(), &value, self.clock.now()) {
                error!("Cache write for {} failed: {e}", shared.key());
            }
            shared.set_local(value);
        }
    }
}

/// Everything the first acquisition of a key needs.
#[derive(Clone)]
struct Hydrator {
    cache: Arc<DurableCache>,
    document: Arc<ReplicatedDocument>,
    /// The record to announce, set only if this hydration ran.
    announce: Arc<parking_lot::Mutex<Option<KvFrame>>>,
}

impl Hydrator {
    /// Read the cached record once and seed the container with it.
    async fn run(self, key: StorageKey, binding: Binding) -> SyncResult<Value> {
        let entry = self.cache.get_entry(&key)?;
        binding.ensure_container(&self.document, &key)?;

        let value = match (&entry, binding.kind()) {
            (Some(entry), Some(kind)) => {
                match adapters::project(&self.document, &key, &binding, &entry.value) {
                    Ok(Some(value)) => value,
                    Ok(None) => entry.value.clone(),
                    Err(SyncError::Shape { expected, .. }) => {
                        warn!("Cached value for {key} is not {expected}, using container state");
                        self.document.materialize(&key, kind)
                    }
                    Err(e) => return Err(e),
                }
            }
            (Some(entry), None) => entry.value.clone(),
            (None, Some(kind)) => self.document.materialize(&key, kind),
            (None, None) => binding.default_value(),
        };

        let (cached, updated_at) = match entry {
            Some(entry) => (entry.value, entry.updated_at),
            None => (Value::Null, 0),
        };
        *self.announce.lock() = Some(KvFrame::new(key.as_str(), cached, updated_at));

        Ok(value)
    }
}

// ─── Background tasks ─────────────────────────────────────────────────

/// Next write event, or `None` once the bus is gone.
async fn next_write(
    rx: &mut broadcast::Receiver<Arc<WriteEvent>>,
    bus: &WriteBus,
    consumer: &str,
) -> Option<Arc<WriteEvent>> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
                bus.record_lag(skipped);
                warn!("{consumer} lagged, skipped {skipped} writes");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Project assignments into their containers and write the resulting
/// value to the cache.
async fn write_through(
    mut rx: broadcast::Receiver<Arc<WriteEvent>>,
    bus: Arc<WriteBus>,
    cache: Arc<DurableCache>,
    document: Arc<ReplicatedDocument>,
    registry: Arc<Registry>,
) {
    while let Some(event) = next_write(&mut rx, &bus, "cache writer").await {
        let mut value = event.value.clone();
        match adapters::project_event(&document, &event) {
            Ok(Some(materialized)) if materialized != value => {
                // The container may hold more than was assigned (merged
                // fields, deduplicated items); show that unless a newer
                // assignment already replaced the value.
                if let Some(shared) = registry.get(&event.key) {
                    if shared.get() == event.value {
                        shared.set_local(materialized.clone());
                    }
                }
                value = materialized;
            }
            Ok(_) => {}
            Err(e) => warn!("Could not project write to {}: {e}", event.key),
        }
        if let Err(e) = cache.put(&event.key, &value, event.updated_at) {
            error!("Cache write for {} failed: {e}", event.key);
        }
    }
}

/// Send every local write on the key-value channel.
async fn forward_writes(
    mut rx: broadcast::Receiver<Arc<WriteEvent>>,
    bus: Arc<WriteBus>,
    kv: Arc<Socket>,
) {
    while let Some(event) = next_write(&mut rx, &bus, "kv forwarder").await {
        let frame = KvFrame::new(event.key.as_str(), event.value.clone(), event.updated_at);
        match frame.to_frame() {
            Ok(frame) => {
                if kv.send(frame).await == SendOutcome::Failed {
                    warn!("Dropped kv write for {}", event.key);
                }
            }
            Err(e) => warn!("Could not encode kv write for {}: {e}", event.key),
        }
    }
}

/// Send local commits on the operation channel and schedule a snapshot.
///
/// Nothing is queued while the channel is down: the snapshot sent on the
/// next open carries every missed update.
async fn forward_updates(
    mut updates: mpsc::UnboundedReceiver<Vec<u8>>,
    ops: Option<Arc<Socket>>,
    snapshots: Arc<Throttle>,
) {
    while let Some(bytes) = updates.recv().await {
        snapshots.trigger();
        if let Some(ops) = &ops {
            if ops.state() == ConnectionState::Open {
                let len = bytes.len();
                if ops.send(Frame::Binary(bytes)).await != SendOutcome::Sent {
                    debug!("Local update ({len} bytes) deferred to next snapshot");
                }
            }
        }
    }
}

/// Push containers changed by imports into the cache and live references.
async fn apply_changes(
    mut changes: ChangeStream,
    cache: Arc<DurableCache>,
    registry: Arc<Registry>,
    clock: Arc<LwwClock>,
    snapshots: Arc<Throttle>,
) {
    while let Some(batch) = changes.recv().await {
        for change in batch {
            if let Err(e) = cache.put(&change.key, &change.value, clock.now()) {
                error!("Cache write for {} failed: {e}", change.key);
            }
            if let Some(shared) = registry.get(&change.key) {
                shared.set_local(change.value);
            }
        }
        snapshots.trigger();
    }
}

async fn drive_ops(
    mut rx: mpsc::UnboundedReceiver<SocketEvent>,
    ops: Arc<Socket>,
    document: Arc<ReplicatedDocument>,
    events: broadcast::Sender<EngineEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            SocketEvent::Open => {
                let _ = events.send(EngineEvent::Connected(Channel::Ops));
                match document.export_snapshot() {
                    Ok(snapshot) => {
                        let len = snapshot.len();
                        match ops.send(Frame::Binary(snapshot)).await {
                            SendOutcome::Sent => debug!("Sent snapshot ({len} bytes)"),
                            // Closed again before the send; the next open
                            // exports a fresh snapshot.
                            SendOutcome::Queued => {
                                debug!("Snapshot ({len} bytes) queued behind a reconnect")
                            }
                            SendOutcome::Failed => warn!("Snapshot ({len} bytes) was not sent"),
                        }
                    }
                    Err(e) => warn!("Could not export snapshot: {e}"),
                }
            }
            SocketEvent::Message(Frame::Binary(bytes)) => {
                document.apply_remote(&bytes);
            }
            SocketEvent::Message(Frame::Text(_)) => {
                debug!("Ignoring text frame on ops channel");
            }
            SocketEvent::Closed => {
                let _ = events.send(EngineEvent::Disconnected(Channel::Ops));
            }
            SocketEvent::Failed => {
                let _ = events.send(EngineEvent::ConnectionFailed(Channel::Ops));
            }
            SocketEvent::Unauthorized => {
                let _ = events.send(EngineEvent::Unauthorized(Channel::Ops));
            }
        }
    }
}

async fn drive_kv(
    mut rx: mpsc::UnboundedReceiver<SocketEvent>,
    cache: Arc<DurableCache>,
    registry: Arc<Registry>,
    clock: Arc<LwwClock>,
    events: broadcast::Sender<EngineEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            SocketEvent::Open => {
                let _ = events.send(EngineEvent::Connected(Channel::Kv));
            }
            SocketEvent::Message(Frame::Text(text)) => {
                apply_kv(&text, &cache, &registry, &clock);
            }
            SocketEvent::Message(Frame::Binary(_)) => {
                debug!("Ignoring binary frame on kv channel");
            }
            SocketEvent::Closed => {
                let _ = events.send(EngineEvent::Disconnected(Channel::Kv));
            }
            SocketEvent::Failed => {
                let _ = events.send(EngineEvent::ConnectionFailed(Channel::Kv));
            }
            SocketEvent::Unauthorized => {
                let _ = events.send(EngineEvent::Unauthorized(Channel::Kv));
            }
        }
    }
}

/// Apply one inbound key-value record. Returns whether it was accepted.
///
/// An accepted record reaches the live reference whatever its binding.
/// Structured references are corrected by the operation channel once the
/// matching update is imported.
fn apply_kv(text: &str, cache: &DurableCache, registry: &Registry, clock: &LwwClock) -> bool {
    let frame = match KvFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Dropping malformed kv frame: {e}");
            return false;
        }
    };
    let key = match StorageKey::new(&frame.key) {
        Ok(key) => key,
        Err(e) => {
            warn!("Dropping kv frame: {e}");
            return false;
        }
    };
    clock.observe(frame.updated_at);

    match cache.apply_remote(&key, &frame.value, frame.updated_at) {
        Ok(LwwOutcome::Applied) => {
            if let Some(shared) = registry.get(&key) {
                shared.set_local(frame.value);
            }
            true
        }
        Ok(_) => {
            trace!("Ignoring stale kv frame for {key} at {}", frame.updated_at);
            false
        }
        Err(e) => {
            error!("Cache write for {key} failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    fn engine(dir: &TempDir) -> SyncEngine {
        SyncEngine::start(EngineConfig::for_testing(dir.path())).unwrap()
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

    fn key(raw: &str) -> StorageKey {
        StorageKey::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_item_writes_through_to_cache() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let item = engine.item("settings/theme").await.unwrap();
        assert_eq!(item.get(), Value::Null);
        let ts = item.set(json!("dark"));

        let cache = Arc::clone(engine.cache());
        eventually("cache write", || {
            cache.get_entry(&key("settings/theme")).unwrap().map(|e| e.updated_at) == Some(ts)
        })
        .await;
        assert_eq!(cache.get(&key("settings/theme")).unwrap(), Some(json!("dark")));
    }

    #[tokio::test]
    async fn test_hydrates_from_cache_and_seeds_container() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine
            .cache()
            .put(&key("notes/a.md"), &json!("cached text"), 10)
            .unwrap();

        let text = engine.text("notes/a.md").await.unwrap();
        assert_eq!(text.get(), "cached text");
        assert_eq!(
            engine.document().materialize(&key("notes/a.md"), crate::ContainerKind::Text),
            json!("cached text")
        );
    }

    #[tokio::test]
    async fn test_text_assignment_reaches_document() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let text = engine.text("notes/b.md").await.unwrap();
        text.set("hello");

        let document = Arc::clone(engine.document());
        eventually("projection", || {
            document.materialize(&key("notes/b.md"), crate::ContainerKind::Text) == json!("hello")
        })
        .await;
    }

    #[tokio::test]
    async fn test_map_assignment_keeps_existing_fields() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let map = engine.map("profile").await.unwrap();
        map.insert("name", json!("ada")).unwrap();

        let mut fields = serde_json::Map::new();
        fields.insert("age".into(), json!(36));
        map.set(fields);

        let cell = map.subscribe();
        eventually("merged value", || {
            *cell.borrow() == json!({"name": "ada", "age": 36})
        })
        .await;
    }

    #[tokio::test]
    async fn test_binding_mismatch() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let _item = engine.item("shared").await.unwrap();
        let err = engine.text("shared").await.unwrap_err();
        assert!(matches!(err, SyncError::BindingMismatch { .. }));
    }

    #[tokio::test]
    async fn test_imported_changes_reach_live_reference_and_cache() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let text = engine.text("notes/c.md").await.unwrap();
        let mut cell = text.subscribe();

        let remote = ReplicatedDocument::new();
        remote
            .get_or_create_text(&key("notes/c.md"))
            .unwrap()
            .insert(0, "from afar")
            .unwrap();
        remote.commit();
        assert!(engine
            .document()
            .apply_remote(&remote.export_snapshot().unwrap()));

        timeout(Duration::from_secs(5), cell.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text.get(), "from afar");

        let cache = Arc::clone(engine.cache());
        eventually("cache update", || {
            cache.get(&key("notes/c.md")).unwrap() == Some(json!("from afar"))
        })
        .await;
    }

    #[tokio::test]
    async fn test_apply_kv_is_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let item = engine.item("k").await.unwrap();

        let newer = r#"{"key":"k","value":1,"updatedAt":100}"#;
        let older = r#"{"key":"k","value":2,"updatedAt":50}"#;
        assert!(apply_kv(newer, engine.cache(), engine.registry(), engine.clock()));
        assert!(!apply_kv(older, engine.cache(), engine.registry(), engine.clock()));
        assert!(!apply_kv("garbage", engine.cache(), engine.registry(), engine.clock()));

        assert_eq!(item.get(), json!(1));
        assert_eq!(engine.cache().get(&key("k")).unwrap(), Some(json!(1)));
        assert!(engine.clock().now() > 100);
    }

    #[tokio::test]
    async fn test_apply_kv_reaches_structured_reference() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let text = engine.text("notes/kv.md").await.unwrap();
        let cell = text.subscribe();

        let frame = r#"{"key":"notes/kv.md","value":"from the relay","updatedAt":100}"#;
        assert!(apply_kv(frame, engine.cache(), engine.registry(), engine.clock()));

        assert!(cell.has_changed().unwrap());
        assert_eq!(text.get(), "from the relay");
        assert_eq!(
            engine.cache().get(&key("notes/kv.md")).unwrap(),
            Some(json!("from the relay"))
        );
    }

    #[tokio::test]
    async fn test_rekey_refuses_other_binding() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let _notes = engine.text("notes/a.md").await.unwrap();
        let mut item = engine.item("settings/theme").await.unwrap();

        let err = engine
            .rekey(item.handle_mut(), "notes/a.md")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::BindingMismatch { .. }));
        assert_eq!(item.key(), &key("settings/theme"));
        assert_eq!(engine.registry().refcount(&key("notes/a.md")), 1);
    }

    #[tokio::test]
    async fn test_undo_reverts_live_reference_and_cache() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let mut undo = engine.undo_manager();
        let list = engine.list("todo").await.unwrap();

        list.push(json!("first")).unwrap();
        let cache = Arc::clone(engine.cache());
        eventually("cache write", || {
            cache.get(&key("todo")).unwrap() == Some(json!(["first"]))
        })
        .await;
        assert!(undo.can_undo());
        assert!(undo.undo().unwrap());
        assert!(list.get().is_empty());
        assert_eq!(engine.cache().get(&key("todo")).unwrap(), Some(json!([])));

        assert!(undo.redo().unwrap());
        assert_eq!(list.get(), vec![json!("first")]);
    }

    #[tokio::test]
    async fn test_bytes_item_writes_base64() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let bytes = engine.bytes("blobs/key").await.unwrap();
        let ts = bytes.set(b"\x01\x02");
        assert_eq!(bytes.get().unwrap(), vec![1, 2]);

        let cache = Arc::clone(engine.cache());
        eventually("cache write", || {
            cache.get_entry(&key("blobs/key")).unwrap().map(|e| e.updated_at) == Some(ts)
        })
        .await;
        assert_eq!(cache.get(&key("blobs/key")).unwrap(), Some(json!("AQI=")));
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let engine = engine(&dir);
            let list = engine.list("todo").await.unwrap();
            list.push(json!("write tests")).unwrap();
            engine.shutdown().await.unwrap();
        }

        let engine = engine(&dir);
        assert_eq!(
            engine.document().materialize(&key("todo"), crate::ContainerKind::List),
            json!(["write tests"])
        );
        let list = engine.list("todo").await.unwrap();
        assert_eq!(list.get(), vec![json!("write tests")]);
    }

    #[tokio::test]
    async fn test_counter_and_tree() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let counter = engine.counter("stats/runs").unwrap();
        counter.increment(2.0).unwrap();
        assert_eq!(counter.get(), 2.0);

        let tree = engine.tree("outline").unwrap();
        let root = tree.create(None).unwrap();
        tree.create(Some(root)).unwrap();
        engine.commit();
        assert!(engine.text("stats/runs").await.is_err());
    }

    #[tokio::test]
    async fn test_local_only_connect_is_noop() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.connect();
        assert_eq!(engine.connection_state(Channel::Ops), None);
    }

    #[test]
    fn test_socket_urls() {
        let config = EngineConfig::default().with_server("ws://relay:9000/", "secret");
        let socket = config.socket_for("ws://relay:9000/", &config.kv_path);
        assert_eq!(socket.url, "ws://relay:9000/api/user-storage");
        assert_eq!(socket.token.as_deref(), Some("secret"));
        assert_eq!(socket.retries, 5);
    }
}
