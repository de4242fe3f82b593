//! Reconnecting websocket client shared by both sync channels.
//!
//! A [`Socket`] owns one background driver task. The driver keeps at most one
//! live connection, retries with a fixed delay up to a bounded attempt count,
//! sends a ping when the connection has been idle for the heartbeat interval,
//! and buffers frames in an [`OfflineQueue`] while disconnected. Queued frames
//! are replayed in order as soon as the connection opens. An upgrade refused
//! with 401 or 403 is not retried.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{Frame, ProtocolError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Connection tuning for one logical socket.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` on the upgrade request.
    pub token: Option<String>,
    /// Reconnection attempts after a failure before giving up.
    pub retries: u32,
    pub retry_delay: Duration,
    /// Idle time after which a ping is sent.
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    /// Frames buffered while the socket is not open.
    pub queue_capacity: usize,
}

impl SocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            retries: 5,
            retry_delay: Duration::from_millis(1000),
            heartbeat: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 10_000,
        }
    }
}

/// Connection state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Notifications from the driver task.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Open,
    Message(Frame),
    Closed,
    /// Reconnection attempts are exhausted; no further automatic retry.
    Failed,
    /// The server refused the credentials; no further automatic retry.
    Unauthorized,
}

/// How a send was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Buffered until the socket opens.
    Queued,
    Failed,
}

/// Frames waiting for the socket to open.
#[derive(Debug)]
pub struct OfflineQueue {
    frames: VecDeque<Frame>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            max_size,
        }
    }

    /// Returns false if the queue is full.
    pub fn enqueue(&mut self, frame: Frame) -> bool {
        if self.frames.len() >= self.max_size {
            return false;
        }
        self.frames.push_back(frame);
        true
    }

    /// Put a frame back at the head after a failed replay.
    fn requeue_front(&mut self, frame: Frame) {
        self.frames.push_front(frame);
    }

    fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.frames.iter().map(Frame::len).sum()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

enum Command {
    Open,
    Close,
    Send(Frame, oneshot::Sender<SendOutcome>),
}

enum SessionEnd {
    /// Closed on request.
    Closed,
    /// Connection dropped; reconnect.
    Lost,
    /// The owning handle was dropped.
    Shutdown,
}

/// Handle to a reconnecting websocket.
///
/// Dropping the handle closes the connection and stops the driver.
pub struct Socket {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    event_rx: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    task: JoinHandle<()>,
}

impl Socket {
    /// Spawn the driver. The socket stays closed until [`Socket::open`].
    pub fn spawn(config: SocketConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Closed);

        let driver = Driver {
            queue: OfflineQueue::new(config.queue_capacity),
            config,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
        };
        let task = tokio::spawn(driver.run());

        Self {
            commands,
            state,
            event_rx: Some(event_rx),
            task,
        }
    }

    /// Start connecting. No-op if already open or connecting.
    pub fn open(&self) {
        let _ = self.commands.send(Command::Open);
    }

    /// Close the connection and stop reconnecting. Queued frames are kept.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Send a frame, or queue it while the socket is not open.
    pub async fn send(&self, frame: Frame) -> SendOutcome {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Send(frame, tx)).is_err() {
            return SendOutcome::Failed;
        }
        rx.await.unwrap_or(SendOutcome::Failed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Take the event receiver. Only one consumer gets it.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SocketEvent>> {
        self.event_rx.take()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // Closing the command channel lets the driver close the socket
        // gracefully; abort covers a driver stuck in connect.
        let _ = self.commands.send(Command::Close);
        if self.state() == ConnectionState::Connecting {
            self.task.abort();
        }
    }
}

struct Driver {
    config: SocketConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SocketEvent>,
    state: watch::Sender<ConnectionState>,
    queue: OfflineQueue,
}

impl Driver {
    async fn run(mut self) {
        'idle: loop {
            // Closed: wait for an open request, queueing sends meanwhile.
            match self.commands.recv().await {
                None => return,
                Some(Command::Open) => {}
                Some(Command::Close) => continue,
                Some(Command::Send(frame, reply)) => {
                    self.enqueue(frame, reply);
                    continue;
                }
            }

            let mut failures = 0u32;
            loop {
                self.set_state(ConnectionState::Connecting);
                match self.connect().await {
                    Ok(ws) => {
                        failures = 0;
                        info!("socket open: {}", self.config.url);
                        self.set_state(ConnectionState::Open);
                        let _ = self.events.send(SocketEvent::Open);

                        let end = self.session(ws).await;
                        self.set_state(ConnectionState::Closed);
                        let _ = self.events.send(SocketEvent::Closed);
                        match end {
                            SessionEnd::Closed => continue 'idle,
                            SessionEnd::Shutdown => return,
                            SessionEnd::Lost => {
                                warn!("socket lost: {}", self.config.url);
                            }
                        }
                    }
                    Err(ProtocolError::Unauthorized(status)) => {
                        warn!(
                            "{} refused the upgrade with status {}, not retrying",
                            self.config.url, status
                        );
                        self.set_state(ConnectionState::Closed);
                        let _ = self.events.send(SocketEvent::Unauthorized);
                        continue 'idle;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "connect to {} failed (attempt {}): {}",
                            self.config.url, failures, e
                        );
                        if failures > self.config.retries {
                            warn!(
                                "giving up on {} after {} attempts",
                                self.config.url, failures
                            );
                            self.set_state(ConnectionState::Closed);
                            let _ = self.events.send(SocketEvent::Failed);
                            continue 'idle;
                        }
                    }
                }

                // Retry delay; a close request cancels the reconnect.
                let delay = tokio::time::sleep(self.config.retry_delay);
                tokio::pin!(delay);
                loop {
                    tokio::select! {
                        _ = &mut delay => break,
                        cmd = self.commands.recv() => match cmd {
                            None => return,
                            Some(Command::Open) => {}
                            Some(Command::Close) => {
                                self.set_state(ConnectionState::Closed);
                                continue 'idle;
                            }
                            Some(Command::Send(frame, reply)) => self.enqueue(frame, reply),
                        },
                    }
                }
                debug!("reconnecting to {}", self.config.url);
            }
        }
    }

    async fn connect(&self) -> Result<WsStream, ProtocolError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ProtocolError::WebSocket(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        match tokio::time::timeout(self.config.connect_timeout, connect_async(request)).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtocolError::WebSocket("connect timed out".into())),
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut source) = ws.split();

        if !self.replay(&mut sink).await {
            return SessionEnd::Lost;
        }

        loop {
            let idle = tokio::time::sleep(self.config.heartbeat);
            tokio::select! {
                msg = source.next() => {
                    if !self.on_message(msg) {
                        return SessionEnd::Lost;
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    None => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Close) => {
                        let _ = sink.close().await;
                        info!("socket closed: {}", self.config.url);
                        return SessionEnd::Closed;
                    }
                    Some(Command::Open) => {}
                    Some(Command::Send(frame, reply)) => {
                        if let Err(e) = sink.send(frame.into_message()).await {
                            warn!("send on {} failed: {}", self.config.url, e);
                            let _ = reply.send(SendOutcome::Failed);
                            return SessionEnd::Lost;
                        }
                        let _ = reply.send(SendOutcome::Sent);
                    }
                },
                _ = idle => {
                    trace!("heartbeat ping to {}", self.config.url);
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    /// Replay queued frames in order. Returns false if the connection broke.
    async fn replay(&mut self, sink: &mut WsSink) -> bool {
        if !self.queue.is_empty() {
            debug!("replaying {} queued frames", self.queue.len());
        }
        while let Some(frame) = self.queue.pop() {
            if let Err(e) = sink.send(frame.clone().into_message()).await {
                warn!("replay on {} failed: {}", self.config.url, e);
                self.queue.requeue_front(frame);
                return false;
            }
        }
        true
    }

    /// Returns false when the connection is gone.
    fn on_message(
        &self,
        msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> bool {
        match msg {
            Some(Ok(Message::Close(_))) | None => false,
            Some(Ok(msg)) => {
                if let Some(frame) = Frame::from_message(msg) {
                    let _ = self.events.send(SocketEvent::Message(frame));
                }
                true
            }
            Some(Err(e)) => {
                warn!("read on {} failed: {}", self.config.url, e);
                false
            }
        }
    }

    fn enqueue(&mut self, frame: Frame, reply: oneshot::Sender<SendOutcome>) {
        let outcome = if self.queue.enqueue(frame) {
            SendOutcome::Queued
        } else {
            warn!("offline queue full for {}, dropping frame", self.config.url);
            SendOutcome::Failed
        };
        let _ = reply.send(outcome);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}
