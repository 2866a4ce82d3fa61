//! Live TCP bridge server
//!
//! One task accepts connections; each connection gets a reader loop and a
//! writer task fed by a bounded channel. Outgoing invokes are correlated
//! through a single pending table keyed by request id. A pending entry is
//! removed exactly once: by its response, by its connection closing, by
//! the caller's timeout or by [`BridgeServer::close`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::frame::{EventFrame, Frame, FrameDecoder, RequestFrame, ResponseFrame, encode_frame};
use super::methods::{MethodContext, MethodRegistry};
use super::{Bridge, BridgeError, ClientSummary, InvokeOptions, InvokeTarget};
use crate::config::BridgeConfig;

/// Toggle this connection's event subscription on
pub const METHOD_SUBSCRIBE: &str = "bridge.subscribe";
/// Toggle this connection's event subscription off
pub const METHOD_UNSUBSCRIBE: &str = "bridge.unsubscribe";
/// Make this connection the target of untargeted invokes
pub const METHOD_SET_PRIMARY: &str = "bridge.setPrimary";
/// Liveness check answered by the server itself
pub const METHOD_PING: &str = "ping";

const READ_CHUNK: usize = 8 * 1024;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

struct Connection {
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    seq: u64,
    listener: bool,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

struct PendingInvoke {
    connection: String,
    method: String,
    reply: oneshot::Sender<Result<Value, BridgeError>>,
}

#[derive(Default)]
struct State {
    connections: HashMap<String, Connection>,
    pending: HashMap<String, PendingInvoke>,
    primary: Option<String>,
    closed: bool,
}

impl State {
    fn pick(&self, policy: InvokeTarget) -> Option<&String> {
        let by_seq = |(_, c): &(&String, &Connection)| c.seq;
        match policy {
            InvokeTarget::Primary => self
                .primary
                .as_ref()
                .filter(|id| self.connections.contains_key(*id))
                .or_else(|| self.connections.iter().min_by_key(by_seq).map(|(id, _)| id)),
            InvokeTarget::Newest => self.connections.iter().max_by_key(by_seq).map(|(id, _)| id),
        }
    }
}

struct Settings {
    keepalive: Duration,
    event_buffer: usize,
    max_frame_bytes: usize,
    invoke_target: InvokeTarget,
}

struct Inner {
    state: Mutex<State>,
    methods: MethodRegistry,
    settings: Settings,
    conn_counter: AtomicU64,
    /// Bumped on every new connection; wakes invokes waiting for a client
    generation: watch::Sender<u64>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Live bridge bound to a TCP address
pub struct BridgeServer {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for BridgeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl BridgeServer {
    /// Bind the listener and start accepting connections
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound
    pub async fn bind(config: &BridgeConfig, methods: MethodRegistry) -> crate::Result<Self> {
        let listener = TcpListener::bind(&config.bind).await?;
        let local_addr = listener.local_addr()?;

        for reserved in [METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE, METHOD_SET_PRIMARY, METHOD_PING] {
            if methods.contains(reserved) {
                tracing::warn!(method = reserved, "handler shadowed by built-in bridge method");
            }
        }

        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            methods,
            settings: Settings {
                keepalive: Duration::from_secs(config.keepalive_secs.max(1)),
                event_buffer: config.event_buffer.max(1),
                max_frame_bytes: config.max_frame_bytes,
                invoke_target: config.invoke_target,
            },
            conn_counter: AtomicU64::new(0),
            generation: watch::channel(0).0,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        tracing::info!(addr = %local_addr, target = ?config.invoke_target, "bridge listening");
        inner.tracker.spawn(accept_loop(inner.clone(), listener));

        Ok(Self { inner, local_addr })
    }

    /// Address the listener is bound to
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl Bridge for BridgeServer {
    async fn invoke(
        &self,
        method: &str,
        args: Value,
        options: InvokeOptions,
    ) -> Result<Value, BridgeError> {
        let call = self.inner.invoke(method, args, options.target);
        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                tracing::warn!(method, timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX), "bridge invoke timed out");
                BridgeError::Timeout(limit)
            })?,
            None => call.await,
        }
    }

    fn send_event(&self, event: EventFrame) {
        self.inner.broadcast(&event);
    }

    fn list_connected(&self) -> Vec<ClientSummary> {
        self.inner.summaries()
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

/// Removes a pending invoke when its caller stops waiting
struct PendingGuard {
    inner: Arc<Inner>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.lock().pending.remove(&self.id);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn invoke(
        self: &Arc<Self>,
        method: &str,
        args: Value,
        target: Option<String>,
    ) -> Result<Value, BridgeError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        let (client_id, outbound) = self
            .register_invoke(&request_id, method, target.as_deref(), reply_tx)
            .await?;
        let _guard = PendingGuard {
            inner: self.clone(),
            id: request_id.clone(),
        };

        let request = RequestFrame {
            id: request_id.clone(),
            method: method.to_string(),
            args,
        };
        outbound
            .send(request.into())
            .await
            .map_err(|_| BridgeError::ConnectionClosed)?;
        tracing::debug!(method, request_id = %request_id, client_id = %client_id, "bridge invoke sent");

        let outcome = reply_rx.await.unwrap_or(Err(BridgeError::ConnectionClosed));
        tracing::debug!(
            method,
            request_id = %request_id,
            ok = outcome.is_ok(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "bridge invoke settled"
        );
        outcome
    }

    /// Choose a connection and record the pending entry under one lock
    ///
    /// With no connection open, waits until one connects.
    async fn register_invoke(
        &self,
        request_id: &str,
        method: &str,
        target: Option<&str>,
        reply: oneshot::Sender<Result<Value, BridgeError>>,
    ) -> Result<(String, mpsc::Sender<Frame>), BridgeError> {
        loop {
            // Subscribe before inspecting state so a connect in between is not missed
            let mut generation = self.generation.subscribe();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(BridgeError::Closed);
                }
                let chosen = match target {
                    Some(id) if state.connections.contains_key(id) => Some(id.to_string()),
                    Some(id) => return Err(BridgeError::ClientNotFound(id.to_string())),
                    None => state.pick(self.settings.invoke_target).cloned(),
                };
                let outbound = chosen.and_then(|id| {
                    state
                        .connections
                        .get(&id)
                        .map(|c| (id.clone(), c.outbound.clone()))
                });
                if let Some((client_id, outbound)) = outbound {
                    state.pending.insert(
                        request_id.to_string(),
                        PendingInvoke {
                            connection: client_id.clone(),
                            method: method.to_string(),
                            reply,
                        },
                    );
                    return Ok((client_id, outbound));
                }
            }

            tracing::debug!(method, "no bridge client connected, waiting");
            // A waiting invoke counts as pending at close
            tokio::select! {
                () = self.shutdown.cancelled() => return Err(BridgeError::ConnectionClosed),
                changed = generation.changed() => {
                    if changed.is_err() {
                        return Err(BridgeError::ConnectionClosed);
                    }
                }
            }
        }
    }

    fn resolve(&self, client_id: &str, response: ResponseFrame) {
        let pending = {
            let mut state = self.lock();
            let owned = state
                .pending
                .get(&response.id)
                .is_some_and(|p| p.connection == client_id);
            if owned {
                state.pending.remove(&response.id)
            } else {
                None
            }
        };

        let Some(pending) = pending else {
            tracing::debug!(client_id, request_id = %response.id, "orphaned bridge response dropped");
            return;
        };
        let outcome = response.outcome.map_err(BridgeError::Remote);
        if pending.reply.send(outcome).is_err() {
            tracing::debug!(method = %pending.method, request_id = %response.id, "bridge invoke caller gone");
        }
    }

    fn broadcast(&self, event: &EventFrame) {
        let listeners: Vec<(String, mpsc::Sender<Frame>, CancellationToken)> = {
            let state = self.lock();
            state
                .connections
                .iter()
                .filter(|(_, c)| c.listener)
                .map(|(id, c)| (id.clone(), c.outbound.clone(), c.cancel.clone()))
                .collect()
        };

        let mut delivered = 0usize;
        for (client_id, outbound, cancel) in listeners {
            match outbound.try_send(Frame::Event(event.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(client_id = %client_id, event_type = %event.event_type, "bridge listener lagging, event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(client_id = %client_id, "bridge listener gone, closing");
                    cancel.cancel();
                }
            }
        }
        tracing::trace!(event_type = %event.event_type, delivered, "bridge event broadcast");
    }

    fn summaries(&self) -> Vec<ClientSummary> {
        let state = self.lock();
        let mut conns: Vec<_> = state.connections.iter().collect();
        conns.sort_by_key(|(_, c)| c.seq);
        conns
            .into_iter()
            .map(|(id, c)| ClientSummary {
                id: id.clone(),
                peer: c.peer.to_string(),
                connected_at: c.connected_at,
                listener: c.listener,
                primary: state.primary.as_deref() == Some(id.as_str()),
                pending: state.pending.values().filter(|p| &p.connection == id).count(),
            })
            .collect()
    }

    fn register_connection(
        &self,
        peer: SocketAddr,
        outbound: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Option<String> {
        let seq = self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let client_id = format!("bridge-conn-{seq}");
        {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            state.connections.insert(
                client_id.clone(),
                Connection {
                    peer,
                    connected_at: Utc::now(),
                    seq,
                    listener: true,
                    outbound,
                    cancel,
                },
            );
        }
        self.generation.send_modify(|g| *g += 1);
        Some(client_id)
    }

    fn unregister_connection(&self, client_id: &str) {
        let failed: Vec<PendingInvoke> = {
            let mut state = self.lock();
            state.connections.remove(client_id);
            if state.primary.as_deref() == Some(client_id) {
                state.primary = None;
            }
            let ids: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, p)| p.connection == client_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.pending.remove(id))
                .collect()
        };

        if !failed.is_empty() {
            tracing::warn!(client_id, failed = failed.len(), "failing pending bridge invokes");
        }
        for pending in failed {
            let _ = pending.reply.send(Err(BridgeError::ConnectionClosed));
        }
    }

    async fn close(&self) {
        let failed: Vec<PendingInvoke> = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.drain().map(|(_, p)| p).collect()
        };
        for pending in failed {
            let _ = pending.reply.send(Err(BridgeError::ConnectionClosed));
        }

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("bridge closed");
    }

    /// Answer a request arriving from the host
    async fn handle_request(
        self: &Arc<Self>,
        client_id: &str,
        request: RequestFrame,
        outbound: &mpsc::Sender<Frame>,
        cancel: &CancellationToken,
    ) {
        let builtin = match request.method.as_str() {
            METHOD_SUBSCRIBE | METHOD_UNSUBSCRIBE => {
                let listen = request.method == METHOD_SUBSCRIBE;
                if let Some(conn) = self.lock().connections.get_mut(client_id) {
                    conn.listener = listen;
                }
                tracing::debug!(client_id, listen, "bridge subscription changed");
                Some(json!({ "subscribed": listen }))
            }
            METHOD_SET_PRIMARY => {
                self.lock().primary = Some(client_id.to_string());
                tracing::info!(client_id, "bridge primary client set");
                Some(json!({ "primary": client_id }))
            }
            METHOD_PING => Some(json!({ "pong": true })),
            _ => None,
        };

        if let Some(result) = builtin {
            let _ = outbound.send(ResponseFrame::ok(request.id, result).into()).await;
            return;
        }

        // Handlers may be slow; never block this connection's reader on them
        let ctx = MethodContext {
            request_id: request.id,
            method: request.method,
            args: request.args,
            client_id: client_id.to_string(),
        };
        let inner = self.clone();
        let outbound = outbound.clone();
        let cancel = cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                response = inner.methods.dispatch(ctx) => {
                    let _ = outbound.send(response.into()).await;
                }
            }
        });
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_inner = inner.clone();
                    inner.tracker.spawn(handle_connection(conn_inner, stream, peer));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bridge accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    tracing::debug!("bridge accept loop stopped");
}

/// Low latency, long-lived duplex: no Nagle, periodic keepalive probes
fn configure_socket(stream: &TcpStream, keepalive: Duration) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(error = %e, "failed to set TCP_NODELAY on bridge socket");
    }
    let probe = TcpKeepalive::new().with_time(keepalive);
    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    let probe = probe.with_interval(keepalive);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&probe) {
        tracing::warn!(error = %e, "failed to enable keepalive on bridge socket");
    }
}

async fn handle_connection(inner: Arc<Inner>, stream: TcpStream, peer: SocketAddr) {
    configure_socket(&stream, inner.settings.keepalive);

    let (outbound, rx) = mpsc::channel(inner.settings.event_buffer);
    let cancel = inner.shutdown.child_token();
    let Some(client_id) = inner.register_connection(peer, outbound.clone(), cancel.clone()) else {
        tracing::debug!(peer = %peer, "bridge closed, connection refused");
        return;
    };
    tracing::info!(client_id = %client_id, peer = %peer, "bridge client connected");

    let (reader, writer) = stream.into_split();
    let writer_task = tokio::spawn(write_loop(writer, rx, cancel.clone(), client_id.clone()));

    read_loop(&inner, &client_id, reader, &outbound, &cancel).await;

    cancel.cancel();
    inner.unregister_connection(&client_id);
    drop(outbound);
    if let Err(e) = writer_task.await {
        tracing::debug!(client_id = %client_id, error = %e, "bridge writer task failed");
    }
    tracing::info!(client_id = %client_id, "bridge client disconnected");
}

async fn read_loop(
    inner: &Arc<Inner>,
    client_id: &str,
    mut reader: OwnedReadHalf,
    outbound: &mpsc::Sender<Frame>,
    cancel: &CancellationToken,
) {
    let mut decoder = FrameDecoder::new(inner.settings.max_frame_bytes);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(client_id, error = %e, "bridge read failed");
                break;
            }
        };

        for decoded in decoder.push(&buf[..n]) {
            match decoded {
                Ok(Frame::RpcResponse(response)) => inner.resolve(client_id, response),
                Ok(Frame::RpcRequest(request)) => {
                    inner.handle_request(client_id, request, outbound, cancel).await;
                }
                Ok(Frame::Event(event)) => {
                    tracing::debug!(client_id, event_type = %event.event_type, "event from bridge client ignored");
                }
                Err(e) => {
                    tracing::warn!(client_id, error = %e, "bridge protocol error");
                }
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    client_id: String,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                flush_queued(&mut writer, &mut rx, &client_id).await;
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if !write_frame(&mut writer, &frame, &client_id).await {
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Write frames queued before the connection was cancelled
async fn flush_queued(writer: &mut OwnedWriteHalf, rx: &mut mpsc::Receiver<Frame>, client_id: &str) {
    rx.close();
    let drain = async {
        while let Ok(frame) = rx.try_recv() {
            if !write_frame(writer, &frame, client_id).await {
                return;
            }
        }
    };
    if tokio::time::timeout(FLUSH_TIMEOUT, drain).await.is_err() {
        tracing::debug!(client_id, "bridge peer not reading, queued frames dropped");
    }
}

/// Returns `false` once the socket is unusable
async fn write_frame(writer: &mut OwnedWriteHalf, frame: &Frame, client_id: &str) -> bool {
    let line = match encode_frame(frame) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(client_id, kind = frame.kind(), error = %e, "dropping unencodable frame");
            return true;
        }
    };
    if let Err(e) = writer.write_all(&line).await {
        tracing::debug!(client_id, error = %e, "bridge write failed");
        return false;
    }
    true
}
