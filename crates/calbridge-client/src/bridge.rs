//! UI end of the bridge.
//!
//! A [`BridgeClient`] owns one byte stream to a worker: the in-process pipe
//! of a [`Worker`](calbridge_server::Worker) or a daemon's Unix socket. A
//! reader task routes responses to their callers by id and fans broadcasts
//! out to subscriptions; a writer task drains outgoing requests.
//!
//! Calls made before the worker announced its services wait for the
//! announcement instead of failing.

use std::collections::HashMap;
use std::fmt;
#[cfg(unix)]
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use calbridge_protocol::{
    BRIDGE_SERVICE, BroadcastFrame, Envelope, Frame, FrameReader, FrameWriter, PROTOCOL_VERSION,
    RequestFrame,
};
use futures_util::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::BridgeError;

/// Timeouts of a [`BridgeClient`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Applied to every call; `None` waits as long as the worker takes.
    pub request_timeout: Option<Duration>,
    /// How long a call waits for the worker to announce its services.
    pub ready_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            ready_timeout: Duration::from_secs(4),
        }
    }
}

impl BridgeConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
enum Readiness {
    Waiting,
    Ready(Vec<String>),
    Closed,
}

type Reply = oneshot::Sender<Result<Value, BridgeError>>;

struct Shared {
    config: BridgeConfig,
    outbox: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<String, Reply>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BroadcastFrame>>>,
    readiness: watch::Sender<Readiness>,
    requests: AtomicU64,
}

impl Shared {
    fn route(&self, frame: Frame) {
        match frame {
            Frame::Response(response) => {
                let reply = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&response.id);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(response.outcome.into_result().map_err(BridgeError::Remote));
                    }
                    None => warn!(id = %response.id, "response for unknown request dropped"),
                }
            }
            Frame::Broadcast(broadcast) => {
                trace!(event = %broadcast.event, "broadcast received");
                self.subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|subscriber| subscriber.send(broadcast.clone()).is_ok());
            }
            Frame::Ready { services } => {
                info!(?services, "worker ready");
                self.readiness.send_replace(Readiness::Ready(services));
            }
            Frame::Request(request) => {
                warn!(id = %request.id, "request from worker dropped");
            }
        }
    }

    /// Fails every waiting call and ends every subscription.
    fn shut_down(&self) {
        self.readiness.send_replace(Readiness::Closed);
        let pending: Vec<Reply> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, reply)| reply)
            .collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing outstanding requests");
        }
        for reply in pending {
            let _ = reply.send(Err(BridgeError::TransportClosed));
        }
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn is_closed(&self) -> bool {
        matches!(*self.readiness.borrow(), Readiness::Closed)
    }

    /// Stores the reply slot of call `id`. Fails if the bridge closed, even
    /// when it closed after the caller last checked.
    fn register(&self, id: &str) -> Result<oneshot::Receiver<Result<Value, BridgeError>>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), tx);
        // `shut_down` marks the bridge closed before draining `pending`.
        if self.is_closed() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id);
            return Err(BridgeError::TransportClosed);
        }
        Ok(rx)
    }
}

/// Removes a call's reply slot if the call is abandoned.
struct PendingSlot<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct BridgeClient {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeClient")
            .field("config", &self.shared.config)
            .field("readiness", &*self.shared.readiness.borrow())
            .finish()
    }
}

impl BridgeClient {
    /// Starts serving `stream`. Must be called inside a tokio runtime.
    pub fn new<S>(stream: S, config: BridgeConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbox, mut queue) = mpsc::unbounded_channel::<Frame>();
        let (readiness, _) = watch::channel(Readiness::Waiting);
        let shared = Arc::new(Shared {
            config,
            outbox,
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            readiness,
            requests: AtomicU64::new(0),
        });

        let writer_shared = shared.clone();
        let writer = tokio::spawn(async move {
            let mut writer = FrameWriter::new(write_half);
            while let Some(frame) = queue.recv().await {
                if let Err(e) = writer.write_message(&Envelope::new(frame)).await {
                    warn!(error = %e, "bridge write failed");
                    writer_shared.shut_down();
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            let mut reader = FrameReader::new(read_half);
            loop {
                match reader.read_message::<Envelope>().await {
                    Ok(Some(envelope)) => {
                        if !envelope.is_compatible() {
                            warn!(
                                version = %envelope.protocol_version,
                                expected = PROTOCOL_VERSION,
                                "frame with incompatible version dropped"
                            );
                            continue;
                        }
                        reader_shared.route(envelope.frame);
                    }
                    Ok(None) => {
                        debug!("worker closed the bridge");
                        break;
                    }
                    Err(e) if !e.is_fatal() => warn!(error = %e, "malformed frame dropped"),
                    Err(e) => {
                        warn!(error = %e, "bridge read failed");
                        break;
                    }
                }
            }
            reader_shared.shut_down();
        });

        Self {
            shared,
            reader,
            writer,
        }
    }

    /// Connects to a daemon's socket.
    #[cfg(unix)]
    pub async fn connect(path: impl AsRef<Path>, config: BridgeConfig) -> Result<Self, BridgeError> {
        let stream = tokio::net::UnixStream::connect(path.as_ref()).await?;
        debug!(socket = %path.as_ref().display(), "connected to daemon");
        Ok(Self::new(stream, config))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Calls `service.method` with positional `args`.
    pub async fn send(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, BridgeError> {
        match self.shared.config.request_timeout {
            Some(timeout) => self.send_with_timeout(service, method, args, timeout).await,
            None => self.dispatch(service, method, args).await,
        }
    }

    /// Like [`send`](Self::send) with an explicit timeout for this call.
    pub async fn send_with_timeout(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        tokio::time::timeout(timeout, self.dispatch(service, method, args))
            .await
            .map_err(|_| BridgeError::Timeout {
                service: service.to_string(),
                method: method.to_string(),
                timeout,
            })?
    }

    /// Calls with already-serialized arguments and decodes the result.
    pub async fn call<R: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<R, BridgeError> {
        let value = self.send(service, method, args).await?;
        Ok(serde_json::from_value(value).map_err(calbridge_protocol::ProtocolError::from)?)
    }

    /// Calls with `args` serialized into the argument list. A value that
    /// serializes to an array is spread; anything else is one argument.
    pub async fn send_typed<A, R>(&self, service: &str, method: &str, args: A) -> Result<R, BridgeError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = match serde_json::to_value(args).map_err(calbridge_protocol::ProtocolError::from)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        self.call(service, method, args).await
    }

    /// Round trip answered by the worker's bridge itself.
    pub async fn ping(&self) -> Result<(), BridgeError> {
        self.send(BRIDGE_SERVICE, "ping", Vec::new()).await.map(|_| ())
    }

    /// Resolves with the announced services once the worker is ready.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ServiceNotReady`] after `ready_timeout`,
    /// [`BridgeError::TransportClosed`] if the bridge closes first.
    pub async fn wait_ready(&self) -> Result<Vec<String>, BridgeError> {
        let timeout = self.shared.config.ready_timeout;
        let mut readiness = self.shared.readiness.subscribe();
        let wait = async {
            loop {
                let state = readiness.borrow_and_update().clone();
                match state {
                    Readiness::Ready(services) => return Ok(services),
                    Readiness::Closed => return Err(BridgeError::TransportClosed),
                    Readiness::Waiting => {}
                }
                if readiness.changed().await.is_err() {
                    return Err(BridgeError::TransportClosed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BridgeError::ServiceNotReady { timeout })?
    }

    /// Services the worker announced last, empty before the first
    /// announcement.
    pub fn services(&self) -> Vec<String> {
        match &*self.shared.readiness.borrow() {
            Readiness::Ready(services) => services.clone(),
            _ => Vec::new(),
        }
    }

    /// A stream of every broadcast received from now on, in emission order.
    /// It ends when the bridge closes.
    pub fn subscribe(&self) -> Broadcasts {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.shared.is_closed() {
            self.shared
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(tx);
        }
        Broadcasts { rx }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Tears the bridge down: outstanding calls fail with
    /// [`BridgeError::TransportClosed`] and subscriptions end.
    pub fn close(&self) {
        if self.shared.is_closed() && self.reader.is_finished() {
            return;
        }
        self.reader.abort();
        self.writer.abort();
        self.shared.shut_down();
        debug!("bridge closed");
    }

    async fn dispatch(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, BridgeError> {
        if self.shared.is_closed() {
            return Err(BridgeError::TransportClosed);
        }
        let services = self.wait_ready().await?;
        if service != BRIDGE_SERVICE && !services.iter().any(|name| name == service) {
            return Err(BridgeError::UnknownService(service.to_string()));
        }

        let sequence = self.shared.requests.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}", sequence, Uuid::new_v4().simple());
        let rx = self.shared.register(&id)?;
        let _slot = PendingSlot {
            shared: &self.shared,
            id: id.clone(),
        };

        trace!(%id, service, method, "sending request");
        self.shared
            .outbox
            .send(Frame::Request(RequestFrame::new(id, service, method, args)))
            .map_err(|_| BridgeError::TransportClosed)?;

        rx.await.unwrap_or(Err(BridgeError::TransportClosed))
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Broadcast subscription returned by [`BridgeClient::subscribe`].
#[derive(Debug)]
pub struct Broadcasts {
    rx: mpsc::UnboundedReceiver<BroadcastFrame>,
}

impl Broadcasts {
    pub async fn recv(&mut self) -> Option<BroadcastFrame> {
        self.rx.recv().await
    }
}

impl Stream for Broadcasts {
    type Item = BroadcastFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
