//! Relay server for both sync channels.
//!
//! ```text
//! device A ──┐                          ┌── room (ops, users:alice) ── replica ── blob "crdt"
//!            ├── upgrade: path + token ─┤
//! device B ──┘                          └── room (kv,  users:alice) ── LWW items + meta
//! ```
//!
//! Every connection is authenticated in the upgrade handshake and bound to
//! its user's namespace. Frames on the operation channel are merged into the
//! namespace's replica, the resulting snapshot is persisted, and the raw
//! frame is relayed to the user's other connections. Frames on the
//! key-value channel are stored when strictly newer than the stored record
//! and relayed verbatim; older frames are answered with the stored record.
//!
//! Each user's records can also be read and written directly through
//! [`RelayServer::get_item`], [`RelayServer::set_item`] and
//! [`RelayServer::get_keys`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{bearer_token, Authenticator};
use crate::broadcast::RoomManager;
use crate::cache::DurableCache;
use crate::clock::epoch_ms;
use crate::document::{ReplicatedDocument, SNAPSHOT_BLOB};
use crate::engine::{DEFAULT_KV_PATH, DEFAULT_OPS_PATH};
use crate::error::SyncResult;
use crate::key::StorageKey;
use crate::protocol::{Channel, Frame, KvFrame, ProtocolError};
use crate::storage::{LwwOutcome, Namespace, Store, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub store: StoreConfig,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    pub ops_path: String,
    pub kv_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            store: StoreConfig {
                path: "mnemo_relay".into(),
                ..StoreConfig::default()
            },
            broadcast_capacity: 256,
            ops_path: DEFAULT_OPS_PATH.to_string(),
            kv_path: DEFAULT_KV_PATH.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            store: StoreConfig::for_testing(path),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_upgrades: u64,
    pub total_messages: u64,
    pub kv_accepted: u64,
    pub kv_stale: u64,
    pub persisted_snapshots: u64,
}

#[derive(Debug, Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_upgrades: AtomicU64,
    total_messages: AtomicU64,
    kv_accepted: AtomicU64,
    kv_stale: AtomicU64,
    persisted_snapshots: AtomicU64,
}

/// A relayed frame and the connection it came from.
#[derive(Debug, Clone)]
struct Envelope {
    from: Uuid,
    frame: Arc<Frame>,
}

type RoomKey = (Channel, Namespace);

/// What a handled frame asks the connection to do.
#[derive(Debug, PartialEq)]
enum Outbound {
    /// Answer the sender only.
    Reply(Frame),
    /// Relay to the namespace's other connections.
    Relay(Frame),
}

/// A namespace's merged document. Imports and the snapshot written after
/// them happen under `writer`, so a persisted snapshot never loses an
/// update that was already merged.
struct Replica {
    document: ReplicatedDocument,
    writer: Mutex<()>,
}

/// State shared by every connection.
struct Relay {
    config: ServerConfig,
    store: Arc<Store>,
    auth: Arc<dyn Authenticator>,
    rooms: RoomManager<RoomKey, Envelope>,
    /// One replica per namespace, loaded on first use.
    replicas: Mutex<HashMap<Namespace, Arc<Replica>>>,
    stats: AtomicRelayStats,
}

/// The relay server.
pub struct RelayServer {
    relay: Arc<Relay>,
}

impl RelayServer {
    /// Open the store. Connections are accepted by [`RelayServer::run`] or
    /// [`RelayServer::serve`].
    pub fn new(config: ServerConfig, auth: impl Authenticator) -> SyncResult<Self> {
        let store = Arc::new(Store::open(config.store.clone())?);
        let relay = Relay {
            rooms: RoomManager::new(config.broadcast_capacity),
            config,
            store,
            auth: Arc::new(auth),
            replicas: Mutex::new(HashMap::new()),
            stats: AtomicRelayStats::default(),
        };
        Ok(Self {
            relay: Arc::new(relay),
        })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> SyncResult<()> {
        let listener = TcpListener::bind(&self.relay.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> SyncResult<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = Arc::clone(&self.relay);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(relay, stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn stats(&self) -> RelayStats {
        let s = &self.relay.stats;
        RelayStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            rejected_upgrades: s.rejected_upgrades.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            kv_accepted: s.kv_accepted.load(Ordering::Relaxed),
            kv_stale: s.kv_stale.load(Ordering::Relaxed),
            persisted_snapshots: s.persisted_snapshots.load(Ordering::Relaxed),
        }
    }

    /// Stored state of one user.
    pub fn namespace(&self, user: &str) -> DurableCache {
        self.relay.cache(&Namespace::user(user))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.relay.config
    }

    /// One stored record of `user`.
    pub fn get_item(&self, user: &str, key: &str) -> SyncResult<Option<Value>> {
        let key = StorageKey::new(key)?;
        Ok(self.namespace(user).get(&key)?)
    }

    /// Keys of `user` under `base`, which may be empty.
    pub fn get_keys(&self, user: &str, base: &str) -> SyncResult<Vec<StorageKey>> {
        Ok(self.namespace(user).list_keys(base)?)
    }

    /// Store a record for `user` as a new write and relay it to the user's
    /// open key-value connections. Returns the record's timestamp, which is
    /// newer than anything stored for the key.
    pub async fn set_item(&self, user: &str, key: &str, value: Value) -> SyncResult<u64> {
        let key = StorageKey::new(key)?;
        let namespace = Namespace::user(user);
        let cache = self.relay.cache(&namespace);
        let stored = cache.get_entry(&key)?.map_or(0, |entry| entry.updated_at);
        let updated_at = epoch_ms().max(stored.saturating_add(1));
        cache.put(&key, &value, updated_at)?;
        self.relay.stats.kv_accepted.fetch_add(1, Ordering::Relaxed);

        let frame = KvFrame::new(key.as_str(), value, updated_at).to_frame()?;
        let room_key = (Channel::Kv, namespace);
        let room = self.relay.rooms.get_or_create(&room_key).await;
        let delivered = room.broadcast(Envelope {
            from: Uuid::nil(),
            frame: Arc::new(frame),
        });
        self.relay.rooms.remove_if_empty(&room_key).await;
        log::debug!("Stored {key} for {user}, relayed to {delivered} connections");
        Ok(updated_at)
    }
}

impl Relay {
    fn cache(&self, namespace: &Namespace) -> DurableCache {
        DurableCache::with_namespace(&self.store, namespace.clone())
    }

    fn replica(&self, namespace: &Namespace) -> Arc<Replica> {
        let mut replicas = self.replicas.lock();
        let replica = replicas.entry(namespace.clone()).or_insert_with(|| {
            log::debug!("Loading replica for {namespace}");
            Arc::new(Replica {
                document: ReplicatedDocument::load(&self.cache(namespace)),
                writer: Mutex::new(()),
            })
        });
        Arc::clone(replica)
    }

    /// Match the upgrade request to a channel and a namespace.
    fn route(&self, request: &Request) -> Result<RoomKey, ErrorResponse> {
        let path = request.uri().path();
        let channel = if path == self.config.ops_path {
            Channel::Ops
        } else if path == self.config.kv_path {
            Channel::Kv
        } else {
            return Err(reject(StatusCode::NOT_FOUND, "unknown endpoint"));
        };

        let user = bearer_token(request)
            .and_then(|token| self.auth.authenticate(&token))
            .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "invalid credentials"))?;
        Ok((channel, Namespace::user(&user)))
    }

    /// Merge an operation-channel frame and persist the new snapshot.
    fn handle_ops(&self, replica: &Replica, cache: &DurableCache, frame: Frame) -> Option<Outbound> {
        let Frame::Binary(bytes) = frame else {
            log::debug!("Ignoring text frame on ops channel");
            return None;
        };
        let _writer = replica.writer.lock();
        if !replica.document.apply_remote(&bytes) {
            return None;
        }
        match replica.document.persist(cache) {
            Ok(size) => {
                self.stats.persisted_snapshots.fetch_add(1, Ordering::Relaxed);
                log::trace!("Persisted snapshot ({size} bytes)");
            }
            Err(e) => log::error!("Failed to persist snapshot: {e}"),
        }
        Some(Outbound::Relay(Frame::Binary(bytes)))
    }

    /// Apply a key-value frame last-writer-wins.
    fn handle_kv(&self, cache: &DurableCache, frame: Frame) -> Option<Outbound> {
        let Frame::Text(text) = frame else {
            log::debug!("Ignoring binary frame on kv channel");
            return None;
        };
        let record = match KvFrame::decode(&text) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Dropping malformed kv frame: {e}");
                return None;
            }
        };
        let key = match StorageKey::new(&record.key) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("Dropping kv frame: {e}");
                return None;
            }
        };

        match cache.apply_remote(&key, &record.value, record.updated_at) {
            Ok(LwwOutcome::Applied) => {
                self.stats.kv_accepted.fetch_add(1, Ordering::Relaxed);
                Some(Outbound::Relay(Frame::Text(text)))
            }
            Ok(LwwOutcome::Stale { current }) => {
                self.stats.kv_stale.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Stale write to {key} at {} (stored {})",
                    record.updated_at,
                    current.updated_at
                );
                match current.to_frame().to_frame() {
                    Ok(reply) => Some(Outbound::Reply(reply)),
                    Err(e) => {
                        log::error!("Could not encode stored record for {key}: {e}");
                        None
                    }
                }
            }
            Ok(LwwOutcome::Unknown) => {
                self.stats.kv_stale.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                log::error!("Failed to store {key}: {e}");
                None
            }
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    relay: Arc<Relay>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), ProtocolError> {
    let mut route = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let key = relay.route(request)?;
        route = Some(key);
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            relay.stats.rejected_upgrades.fetch_add(1, Ordering::Relaxed);
            log::info!("Rejected upgrade from {addr}: {e}");
            return Ok(());
        }
    };
    let Some(key) = route else {
        return Ok(());
    };

    relay.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    relay.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("{} connection from {addr} for {}", key.0, key.1);

    let result = serve_room(&relay, ws, &key).await;

    relay.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("{} connection from {addr} closed", key.0);
    result
}

async fn serve_room(
    relay: &Relay,
    ws: WebSocketStream<TcpStream>,
    key: &RoomKey,
) -> Result<(), ProtocolError> {
    let (channel, namespace) = key;
    let cache = relay.cache(namespace);
    let replica = match channel {
        Channel::Ops => Some(relay.replica(namespace)),
        Channel::Kv => None,
    };

    let peer_id = Uuid::new_v4();
    let room = relay.rooms.get_or_create(key).await;
    let mut broadcast_rx = room.add_peer(peer_id).await;
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let result = async {
        if *channel == Channel::Ops {
            match cache.get_blob(SNAPSHOT_BLOB) {
                Ok(Some(snapshot)) => {
                    ws_sender.send(Message::Binary(snapshot.into())).await?;
                }
                Ok(None) => {}
                Err(e) => log::warn!("Unreadable snapshot for {namespace}: {e}"),
            }
        }

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(msg)) => {
                        let Some(frame) = Frame::from_message(msg) else {
                            continue;
                        };
                        relay.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        let outbound = match &replica {
                            Some(replica) => relay.handle_ops(replica, &cache, frame),
                            None => relay.handle_kv(&cache, frame),
                        };
                        match outbound {
                            Some(Outbound::Reply(frame)) => {
                                ws_sender.send(frame.into_message()).await?;
                            }
                            Some(Outbound::Relay(frame)) => {
                                room.broadcast(Envelope {
                                    from: peer_id,
                                    frame: Arc::new(frame),
                                });
                            }
                            None => {}
                        }
                    }
                    Some(Err(e)) => return Err(ProtocolError::from(e)),
                },

                msg = broadcast_rx.recv() => match msg {
                    Ok(envelope) => {
                        if envelope.from == peer_id {
                            continue;
                        }
                        ws_sender.send(envelope.frame.as_ref().clone().into_message()).await?;
                    }
                    Err(RecvError::Lagged(n)) => {
                        room.record_lag(n);
                        log::warn!("Peer {peer_id} in {namespace} lagged by {n} messages");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok::<(), ProtocolError>(())
    }
    .await;

    room.remove_peer(&peer_id).await;
    if relay.rooms.remove_if_empty(key).await {
        log::debug!("Room {channel}/{namespace} removed (empty)");
    }
    result
}
