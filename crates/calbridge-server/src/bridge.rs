//! Worker end of the bridge.
//!
//! A [`WorkerBridge`] serves one byte stream. Requests are routed to one
//! dispatcher task per service: a dispatcher starts its service's requests
//! in arrival order and lets them run concurrently, so responses leave in
//! completion order. Different services never wait on each other.
//!
//! Everything the worker writes (responses, readiness announcements and
//! broadcasts) goes through one unbounded queue drained by a writer task,
//! so neither handlers nor [`Emitter::emit`] ever block on the peer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use calbridge_protocol::{
    BRIDGE_SERVICE, BroadcastFrame, Envelope, ErrorCode, ErrorResponse, EventName, Frame,
    FrameReader, FrameWriter, PROTOCOL_VERSION, RequestFrame, ResponseFrame,
};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, trace, warn};

use crate::error::ServerResult;
use crate::registry::ServiceRegistry;

type Outbox = mpsc::UnboundedSender<Frame>;

/// Fire-and-forget broadcast handle shared by all services of a worker.
///
/// Each connected bridge attaches its outgoing queue; an event is copied
/// onto every queue that is still open.
#[derive(Clone, Default)]
pub struct Emitter {
    sinks: Arc<Mutex<Vec<Outbox>>>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("sinks", &self.sinks.lock().map(|s| s.len()).unwrap_or(0))
            .finish()
    }
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: EventName, payload: Value) {
        let frame = Frame::Broadcast(BroadcastFrame::new(event, payload));
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        sinks.retain(|sink| sink.send(frame.clone()).is_ok());
        trace!(%event, receivers = sinks.len(), "broadcast emitted");
    }

    /// Number of attached connections.
    pub fn receivers(&self) -> usize {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|sink| !sink.is_closed())
            .count()
    }

    pub(crate) fn attach(&self, outbox: Outbox) {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outbox);
    }
}

/// Serves the registry's services over one connection.
#[derive(Debug, Clone)]
pub struct WorkerBridge {
    registry: Arc<ServiceRegistry>,
    emitter: Emitter,
}

impl WorkerBridge {
    pub fn new(registry: Arc<ServiceRegistry>, emitter: Emitter) -> Self {
        Self { registry, emitter }
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Runs until the peer closes the stream or it breaks.
    pub async fn serve<S>(self, stream: S) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbox, mut queue) = mpsc::unbounded_channel::<Frame>();

        let writer = tokio::spawn(async move {
            let mut writer = FrameWriter::new(write_half);
            while let Some(frame) = queue.recv().await {
                trace!(kind = frame.kind(), "writing frame");
                if let Err(e) = writer.write_message(&Envelope::new(frame)).await {
                    warn!(error = %e, "bridge write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        self.emitter.attach(outbox.clone());
        let mut names = self.registry.subscribe();
        let ready_outbox = outbox.clone();
        let announcer = tokio::spawn(async move {
            loop {
                let services = names.borrow_and_update().clone();
                debug!(?services, "announcing ready");
                if ready_outbox.send(Frame::Ready { services }).is_err() {
                    break;
                }
                if names.changed().await.is_err() {
                    break;
                }
            }
        });

        let result = self.read_loop(read_half, &outbox).await;

        announcer.abort();
        writer.abort();
        info!("bridge connection closed");
        result
    }

    async fn read_loop<R>(&self, read_half: R, outbox: &Outbox) -> ServerResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = FrameReader::new(read_half);
        let mut dispatchers: HashMap<String, mpsc::UnboundedSender<RequestFrame>> = HashMap::new();

        loop {
            let envelope: Envelope = match reader.read_message().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    debug!("peer closed the bridge");
                    return Ok(());
                }
                Err(e) if !e.is_fatal() => {
                    warn!(error = %e, "dropping malformed frame");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if !envelope.is_compatible() {
                warn!(
                    version = %envelope.protocol_version,
                    expected = PROTOCOL_VERSION,
                    "dropping frame with incompatible protocol version"
                );
                continue;
            }

            let request = match envelope.frame {
                Frame::Request(request) => request,
                other => {
                    warn!(kind = other.kind(), "dropping frame sent in the wrong direction");
                    continue;
                }
            };

            if request.service == BRIDGE_SERVICE {
                let _ = outbox.send(Frame::Response(answer_bridge(&request)));
                continue;
            }
            if self.registry.get(&request.service).is_none() {
                debug!(service = %request.service, "request for unknown service");
                let error = ErrorResponse::new(
                    ErrorCode::UnknownService,
                    format!("no service named {}", request.service),
                );
                let _ = outbox.send(Frame::Response(ResponseFrame::rejected(request.id, error)));
                continue;
            }

            let service = request.service.clone();
            let dispatcher = dispatchers
                .entry(service.clone())
                .or_insert_with(|| self.spawn_dispatcher(service.clone(), outbox.clone()));
            if let Err(mpsc::error::SendError(request)) = dispatcher.send(request) {
                // The dispatcher only stops when the registry lost the service.
                let replacement = self.spawn_dispatcher(service.clone(), outbox.clone());
                let _ = replacement.send(request);
                dispatchers.insert(service, replacement);
            }
        }
    }

    fn spawn_dispatcher(
        &self,
        service: String,
        outbox: Outbox,
    ) -> mpsc::UnboundedSender<RequestFrame> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestFrame>();
        let registry = self.registry.clone();
        debug!(service = %service, "starting dispatcher");
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let outbox = outbox.clone();
                let span = tracing::debug_span!(
                    "dispatch",
                    service = %request.service,
                    method = %request.method,
                    id = %request.id
                );
                let Some(target) = registry.get(&service) else {
                    let error = ErrorResponse::new(
                        ErrorCode::UnknownService,
                        format!("no service named {}", service),
                    );
                    let _ = outbox.send(Frame::Response(ResponseFrame::rejected(request.id, error)));
                    continue;
                };
                let call = target.call(&request.method, request.args);
                let id = request.id;
                tokio::spawn(
                    async move {
                        let outcome = call.await;
                        match outcome {
                            Ok(_) => debug!("request fulfilled"),
                            Err(ref e) => debug!(code = ?e.code, error = %e.message, "request rejected"),
                        }
                        let _ = outbox.send(Frame::Response(ResponseFrame {
                            id,
                            outcome: outcome.into(),
                        }));
                    }
                    .instrument(span),
                );
            }
        });
        tx
    }
}

fn answer_bridge(request: &RequestFrame) -> ResponseFrame {
    match request.method.as_str() {
        "ping" => ResponseFrame::fulfilled(&request.id, Value::String("pong".to_string())),
        other => ResponseFrame::rejected(
            &request.id,
            ErrorResponse::new(ErrorCode::MethodNotFound, format!("no bridge method named {}", other)),
        ),
    }
}
