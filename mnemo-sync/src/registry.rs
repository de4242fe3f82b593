//! Shared Reference Registry.
//!
//! One reactive cell per storage key, shared by every consumer of that key.
//! The table entry is created on the first `acquire`, which runs the
//! hydration future exactly once even when several consumers race for the
//! same key; everyone else awaits the same in-flight hydration. Each
//! acquisition is released exactly once, when its [`RefHandle`] drops, and
//! the cell is disposed when the last one goes.
//!
//! Writes through [`SharedRef::set`] update the cell at once and publish a
//! [`WriteEvent`] on the write bus. Publishing is throttled per key: the
//! first write of a burst goes out immediately, later ones collapse into a
//! single trailing event carrying the latest value. Values that arrive from
//! the network or from the CRDT document are applied with
//! [`SharedRef::set_local`], which updates the cell without publishing
//! anything, so remote state is never echoed back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch, OnceCell};

use crate::adapters::Binding;
use crate::broadcast::BroadcastGroup;
use crate::clock::LwwClock;
use crate::error::{SyncError, SyncResult};
use crate::key::StorageKey;
use crate::throttle::Throttle;

/// Minimum spacing between two published writes of one key.
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_millis(1000);

/// Where a published value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A whole-value assignment; structured bindings still have to project
    /// it into their container.
    Assign,
    /// The value was read back from a container after an explicit
    /// container operation; the container is already up to date.
    Container,
}

/// A local write, consumed independently by the cache writer, the
/// key-value forwarder and the CRDT projector.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEvent {
    pub key: StorageKey,
    pub value: Value,
    pub updated_at: u64,
    pub binding: Binding,
    pub origin: WriteOrigin,
}

pub type WriteBus = BroadcastGroup<Arc<WriteEvent>>;

type PendingWrite = Arc<Mutex<Option<WriteEvent>>>;

/// The live cell behind a key.
pub struct SharedRef {
    key: StorageKey,
    binding: Binding,
    cell: watch::Sender<Value>,
    bus: Arc<WriteBus>,
    clock: Arc<LwwClock>,
    pending: PendingWrite,
    publisher: Throttle,
}

impl std::fmt::Debug for SharedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRef")
            .field("key", &self.key)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl SharedRef {
    fn new(
        key: StorageKey,
        binding: Binding,
        initial: Value,
        bus: Arc<WriteBus>,
        clock: Arc<LwwClock>,
        interval: Duration,
    ) -> Self {
        let pending: PendingWrite = Arc::new(Mutex::new(None));
        let publisher = {
            let pending = Arc::clone(&pending);
            let bus = Arc::clone(&bus);
            Throttle::spawn(interval, move || flush(&pending, &bus))
        };
        Self {
            key,
            binding,
            cell: watch::channel(initial).0,
            bus,
            clock,
            pending,
            publisher,
        }
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn get(&self) -> Value {
        self.cell.borrow().clone()
    }

    /// Watch the value. The receiver sees every `set` and `set_local`.
    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.cell.subscribe()
    }

    /// Assign a value and schedule its publication. Returns the write's
    /// timestamp.
    pub fn set(&self, value: Value) -> u64 {
        self.publish(value, WriteOrigin::Assign)
    }

    /// Publish a value that already lives in the CRDT container.
    pub(crate) fn set_from_container(&self, value: Value) -> u64 {
        self.publish(value, WriteOrigin::Container)
    }

    /// Apply a value without publishing it.
    pub fn set_local(&self, value: Value) {
        self.cell.send_replace(value);
    }

    fn publish(&self, value: Value, origin: WriteOrigin) -> u64 {
        let updated_at = self.clock.now();
        self.cell.send_replace(value.clone());
        let event = WriteEvent {
            key: self.key.clone(),
            value,
            updated_at,
            binding: self.binding.clone(),
            origin,
        };
        {
            let mut pending = self.pending.lock();
            // An assignment still has to be projected; a container write
            // must not swallow it, and vice versa.
            if let Some(previous) = pending.take() {
                if previous.origin != origin {
                    self.bus.broadcast(Arc::new(previous));
                }
            }
            *pending = Some(event);
        }
        self.publisher.trigger();
        updated_at
    }
}

impl Drop for SharedRef {
    fn drop(&mut self) {
        flush(&self.pending, &self.bus);
    }
}

/// Publish the pending write, if any. Runs under the lock so events of one
/// key are never reordered.
fn flush(pending: &Mutex<Option<WriteEvent>>, bus: &WriteBus) {
    let mut pending = pending.lock();
    if let Some(event) = pending.take() {
        bus.broadcast(Arc::new(event));
    }
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Cells hydrated so far.
    pub created: u64,
    /// Cells torn down after their last release.
    pub disposed: u64,
    /// Keys currently held by at least one consumer.
    pub live: usize,
}

struct Slot {
    cell: Arc<OnceCell<Arc<SharedRef>>>,
    refcount: usize,
}

pub struct Registry {
    slots: Mutex<HashMap<StorageKey, Slot>>,
    bus: Arc<WriteBus>,
    clock: Arc<LwwClock>,
    write_interval: Duration,
    created: AtomicU64,
    disposed: AtomicU64,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(bus_capacity: usize, clock: Arc<LwwClock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            bus: Arc::new(BroadcastGroup::new(bus_capacity)),
            clock,
            write_interval: DEFAULT_WRITE_INTERVAL,
            created: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
        }
    }

    pub fn with_write_interval(mut self, interval: Duration) -> Self {
        self.write_interval = interval;
        self
    }

    /// Get the shared cell for `key`, running `hydrate` to produce its
    /// initial value if nobody holds the key yet.
    ///
    /// Concurrent callers for the same key share one hydration. If the
    /// hydration fails, every waiting caller retries with its own closure
    /// and this caller's acquisition is released.
    pub async fn acquire<F, Fut>(
        self: &Arc<Self>,
        key: StorageKey,
        binding: Binding,
        hydrate: F,
    ) -> SyncResult<RefHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<Value>>,
    {
        let cell = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                cell: Arc::new(OnceCell::new()),
                refcount: 0,
            });
            slot.refcount += 1;
            Arc::clone(&slot.cell)
        };
        // From here on the acquisition is released on every exit path,
        // including cancellation of this future.
        let lease = Lease {
            registry: Arc::clone(self),
            key: key.clone(),
        };

        let shared = cell
            .get_or_try_init(|| async {
                let initial = hydrate().await?;
                self.created.fetch_add(1, Ordering::Relaxed);
                log::debug!("Hydrated shared reference {key}");
                Ok::<_, SyncError>(Arc::new(SharedRef::new(
                    key.clone(),
                    binding,
                    initial,
                    Arc::clone(&self.bus),
                    Arc::clone(&self.clock),
                    self.write_interval,
                )))
            })
            .await?;

        Ok(RefHandle {
            shared: Arc::clone(shared),
            _lease: lease,
        })
    }

    /// The live cell for `key`, if some consumer holds it and it has
    /// finished hydrating. Does not count as an acquisition.
    pub fn get(&self, key: &StorageKey) -> Option<Arc<SharedRef>> {
        let slots = self.slots.lock();
        slots.get(key)?.cell.get().cloned()
    }

    fn release(&self, key: &StorageKey) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            log::error!("Release of {key} without a live acquisition");
            return;
        };
        slot.refcount = slot.refcount.saturating_sub(1);
        if slot.refcount > 0 {
            return;
        }
        if let Some(slot) = slots.remove(key) {
            if slot.cell.initialized() {
                self.disposed.fetch_add(1, Ordering::Relaxed);
                log::debug!("Disposed shared reference {key}");
            }
        }
    }

    /// Every hydrated cell currently held by a consumer.
    pub fn live(&self) -> Vec<Arc<SharedRef>> {
        let slots = self.slots.lock();
        slots.values().filter_map(|slot| slot.cell.get().cloned()).collect()
    }

    pub fn refcount(&self, key: &StorageKey) -> usize {
        self.slots.lock().get(key).map_or(0, |slot| slot.refcount)
    }

    /// Receive every published write.
    pub fn subscribe_writes(&self) -> broadcast::Receiver<Arc<WriteEvent>> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &Arc<WriteBus> {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<LwwClock> {
        &self.clock
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            created: self.created.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
            live: self.slots.lock().len(),
        }
    }
}

/// One acquisition of a key; released on drop.
struct Lease {
    registry: Arc<Registry>,
    key: StorageKey,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

/// A consumer's handle on a shared cell.
pub struct RefHandle {
    shared: Arc<SharedRef>,
    _lease: Lease,
}

impl std::fmt::Debug for RefHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefHandle")
            .field("key", &self.shared.key)
            .finish_non_exhaustive()
    }
}

impl RefHandle {
    pub fn shared(&self) -> &Arc<SharedRef> {
        &self.shared
    }

    /// Point this handle at another key.
    ///
    /// The new key is acquired before the old one is released, so a key
    /// shared with other consumers never drops to zero in between. On
    /// failure, including a key already live under another binding, the
    /// handle keeps its current key.
    pub async fn rekey<F, Fut>(&mut self, key: StorageKey, hydrate: F) -> SyncResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<Value>>,
    {
        if key == self.shared.key {
            return Ok(());
        }
        let registry = Arc::clone(&self._lease.registry);
        let binding = self.shared.binding.clone();
        let next = registry.acquire(key.clone(), binding.clone(), hydrate).await?;
        if next.shared.binding != binding {
            return Err(SyncError::BindingMismatch {
                key: key.to_string(),
                existing: format!("{:?}", next.shared.binding),
                requested: format!("{binding:?}"),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::ops::Deref for RefHandle {
    type Target = SharedRef;

    fn deref(&self) -> &SharedRef {
        &self.shared
    }
}
