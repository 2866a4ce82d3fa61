//! Host-side bridge client
//!
//! Used by the CLI and by tests to play the role of the external host: it
//! answers gateway invokes through a [`RequestHandler`], calls gateway
//! methods, and receives broadcast events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::BridgeError;
use super::frame::{
    DEFAULT_MAX_FRAME_BYTES, EventFrame, Frame, FrameDecoder, RequestFrame, ResponseFrame,
    encode_frame,
};
use super::server::{METHOD_SET_PRIMARY, METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE};

const EVENT_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

/// Answers requests the gateway sends to the host
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, method: &str, args: Value) -> Result<Value, String>;
}

/// Handler for clients that expose no methods
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMethods;

#[async_trait]
impl RequestHandler for NoMethods {
    async fn handle(&self, method: &str, _args: Value) -> Result<Value, String> {
        Err(format!("unsupported method: {method}"))
    }
}

type Reply = oneshot::Sender<Result<Value, BridgeError>>;

#[derive(Default)]
struct Calls {
    pending: HashMap<String, Reply>,
    closed: bool,
}

struct Shared {
    calls: Mutex<Calls>,
    next_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail_all(&self) {
        let pending: Vec<Reply> = {
            let mut calls = self.lock();
            calls.closed = true;
            calls.pending.drain().map(|(_, reply)| reply).collect()
        };
        for reply in pending {
            let _ = reply.send(Err(BridgeError::ConnectionClosed));
        }
    }
}

struct CallGuard<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().pending.remove(&self.id);
    }
}

/// One connection to a gateway bridge, acting as the host
pub struct BridgeClient {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient").finish_non_exhaustive()
    }
}

impl BridgeClient {
    /// Connect to a bridge server
    ///
    /// Returns the client and the stream of events broadcast to it. The
    /// event stream ends when the connection closes.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] if the connection cannot be established
    pub async fn connect(
        addr: impl ToSocketAddrs,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(Self, mpsc::Receiver<EventFrame>), BridgeError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let shared = Arc::new(Shared {
            calls: Mutex::new(Calls::default()),
            next_id: AtomicU64::new(0),
        });
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(write_loop(writer, outbound_rx, cancel.clone()));
        tasks.spawn(read_loop(
            reader,
            shared.clone(),
            outbound.clone(),
            events_tx,
            handler,
            cancel.clone(),
            tasks.clone(),
        ));
        tracing::debug!(peer = %peer, "bridge client connected");

        Ok((
            Self {
                shared,
                outbound,
                cancel,
                tasks,
            },
            events_rx,
        ))
    }

    /// Call a gateway method and wait for its answer
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Remote`] for an error answer and
    /// [`BridgeError::ConnectionClosed`] if the connection goes away first
    pub async fn call(&self, method: &str, args: Value) -> Result<Value, BridgeError> {
        let seq = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("host-{seq}");
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut calls = self.shared.lock();
            if calls.closed {
                return Err(BridgeError::ConnectionClosed);
            }
            calls.pending.insert(id.clone(), reply_tx);
        }
        let _guard = CallGuard {
            shared: &self.shared,
            id: id.clone(),
        };

        let request = RequestFrame {
            id,
            method: method.to_string(),
            args,
        };
        self.outbound
            .send(request.into())
            .await
            .map_err(|_| BridgeError::ConnectionClosed)?;
        reply_rx.await.unwrap_or(Err(BridgeError::ConnectionClosed))
    }

    /// [`BridgeClient::call`] bounded by `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Timeout`] if no answer arrives in time
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        tokio::time::timeout(timeout, self.call(method, args))
            .await
            .map_err(|_| BridgeError::Timeout(timeout))?
    }

    /// Receive broadcast events (the default for new connections)
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails
    pub async fn subscribe(&self) -> Result<(), BridgeError> {
        self.call(METHOD_SUBSCRIBE, Value::Null).await.map(drop)
    }

    /// Stop receiving broadcast events
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails
    pub async fn unsubscribe(&self) -> Result<(), BridgeError> {
        self.call(METHOD_UNSUBSCRIBE, Value::Null).await.map(drop)
    }

    /// Become the target of the gateway's untargeted invokes
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails
    pub async fn set_primary(&self) -> Result<(), BridgeError> {
        self.call(METHOD_SET_PRIMARY, Value::Null).await.map(drop)
    }

    /// Whether the connection is still open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Close the connection; outstanding calls fail with `ConnectionClosed`
    pub async fn close(&self) {
        self.cancel.cancel();
        self.shared.fail_all();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    events: mpsc::Sender<EventFrame>,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "bridge client read failed");
                break;
            }
        };

        for decoded in decoder.push(&buf[..n]) {
            match decoded {
                Ok(Frame::RpcResponse(response)) => {
                    let reply = shared.lock().pending.remove(&response.id);
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(response.outcome.map_err(BridgeError::Remote));
                        }
                        None => tracing::debug!(request_id = %response.id, "orphaned response dropped"),
                    }
                }
                Ok(Frame::RpcRequest(request)) => {
                    let handler = handler.clone();
                    let outbound = outbound.clone();
                    let cancel = cancel.clone();
                    tasks.spawn(async move {
                        tokio::select! {
                            () = cancel.cancelled() => {}
                            outcome = handler.handle(&request.method, request.args) => {
                                let response = ResponseFrame {
                                    id: request.id,
                                    outcome,
                                };
                                let _ = outbound.send(response.into()).await;
                            }
                        }
                    });
                }
                Ok(Frame::Event(event)) => match events.try_send(event) {
                    Ok(()) | Err(TrySendError::Closed(_)) => {}
                    Err(TrySendError::Full(event)) => {
                        tracing::warn!(event_type = %event.event_type, "event receiver lagging, event dropped");
                    }
                },
                Err(e) => tracing::warn!(error = %e, "bridge protocol error"),
            }
        }
    }

    cancel.cancel();
    shared.fail_all();
    tracing::debug!("bridge client disconnected");
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let line = match encode_frame(&frame) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unencodable frame");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&line).await {
            tracing::debug!(error = %e, "bridge client write failed");
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}
