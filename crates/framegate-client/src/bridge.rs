//! Client bridge: many in-flight calls multiplexed over one duplex stream.
//!
//! The bridge owns the stream. A read task pumps decoded responses out of a
//! `FramedRead` and routes them to pending calls by id; outgoing requests
//! flow through an unbounded channel into a write task so frame groups are
//! written atomically. All bookkeeping (pending map, handshake caches, id
//! allocation) lives behind one mutex that is never held across an await.
//!
//! Delivery is exactly-once per call. A response arrival, a trace going
//! inactive, and a bridge teardown all race for the same pending entry; the
//! pending-map removal plus the trace's one-shot finalizer guarantee a
//! single winner.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc, oneshot},
    task::AbortHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use framegate_core::{Finalizer, Service, Trace};
use framegate_proto::{
    Fingerprint, HEADER_PROTOCOLS, HandshakeMatch, HandshakeRequest, HandshakeResponse,
    META_TRACE_DEADLINE, META_TRACE_LABELS, Message, Packet, RequestEncoder, ResponseDecoder,
    SystemError,
};

use crate::errors::BridgeError;

/// Lifecycle notifications for bridge observers.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// The bridge was destroyed by a stream or codec failure.
    Error(String),
    /// The bridge released its streams.
    Closed,
}

/// A completed call: the response packet plus the service the responder
/// turned out to speak.
#[derive(Debug, Clone)]
pub struct CallReply {
    /// Response headers and body.
    pub packet: Packet,
    /// The negotiated server service for this call.
    pub server_service: Service,
}

struct CallRecord {
    tx: oneshot::Sender<Result<CallReply, BridgeError>>,
    meta: HashMap<String, Bytes>,
    request: Packet,
    service: Service,
    retried: bool,
    finalizer: Finalizer,
}

struct BridgeState {
    closed: bool,
    destroyed: bool,
    released: bool,
    next_id: i32,
    pending: HashMap<i32, CallRecord>,
    server_services: HashMap<Fingerprint, Service>,
    hashes: HashMap<Fingerprint, Fingerprint>,
    tasks: Vec<AbortHandle>,
}

impl BridgeState {
    fn allocate_id(&mut self) -> i32 {
        // Ids may be reused once the prior call has completed; skip ids
        // still outstanding.
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Build the outgoing message for a call under the current handshake
    /// caches.
    fn outgoing_message(
        &self,
        id: i32,
        service: &Service,
        meta: &HashMap<String, Bytes>,
        request: &Packet,
        retried: bool,
    ) -> Message<HandshakeRequest> {
        let client_hash = *service.hash();
        // Fall back to the client hash itself while the server is unknown.
        let server_hash = self.hashes.get(&client_hash).copied().unwrap_or(client_hash);
        let client_protocol = retried.then(|| service.protocol_text().to_string());
        let handshake =
            HandshakeRequest { client_hash, client_protocol, server_hash, meta: meta.clone() };
        Message::with_handshake(id, handshake, request.clone())
    }
}

struct Inner {
    service: Service,
    state: Mutex<BridgeState>,
    outbound: mpsc::UnboundedSender<Message<HandshakeRequest>>,
    events: broadcast::Sender<BridgeEvent>,
}

/// Client-side owner of a duplex stream and its pending calls.
pub struct ClientBridge {
    inner: Arc<Inner>,
}

impl ClientBridge {
    /// Take ownership of `stream` and start serving calls for `service`.
    pub fn new<S>(stream: S, service: Service) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);

        let inner = Arc::new(Inner {
            service,
            state: Mutex::new(BridgeState {
                closed: false,
                destroyed: false,
                released: false,
                next_id: 1,
                pending: HashMap::new(),
                server_services: HashMap::new(),
                hashes: HashMap::new(),
                tasks: Vec::new(),
            }),
            outbound: outbound_tx,
            events,
        });

        let read_task = tokio::spawn(read_loop(Arc::clone(&inner), reader));
        let write_task = tokio::spawn(write_loop(Arc::clone(&inner), writer, outbound_rx));
        {
            let mut state = inner.lock();
            if state.destroyed {
                // The read task already tore the bridge down (instant EOF).
                read_task.abort();
                write_task.abort();
            } else {
                state.tasks.push(read_task.abort_handle());
                state.tasks.push(write_task.abort_handle());
            }
        }

        Self { inner }
    }

    /// The service this bridge issues calls for.
    pub fn service(&self) -> &Service {
        &self.inner.service
    }

    /// Whether the bridge still accepts new calls.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    /// Issue a call and await its response.
    ///
    /// The trace's labels and deadline travel in handshake meta; the trace
    /// going inactive completes the call with its timeout error and drops
    /// any late response.
    pub async fn call(&self, trace: &Trace, request: Packet) -> Result<Packet, BridgeError> {
        let reply = self.call_service(trace, self.inner.service.clone(), request).await?;
        Ok(reply.packet)
    }

    /// Discover the peer's services via the well-known discovery protocol.
    ///
    /// A gateway answers with the `avro.protocols` header listing every
    /// service it routes; a plain single-service peer just negotiates its
    /// own protocol, which is returned as the sole entry.
    pub async fn ping(&self, trace: &Trace) -> Result<Vec<Service>, BridgeError> {
        let reply = self.call_service(trace, Service::discovery(), Packet::default()).await?;
        match reply.packet.headers.get(HEADER_PROTOCOLS) {
            Some(raw) => {
                let protocols: Vec<serde_json::Value> = serde_json::from_slice(raw)
                    .map_err(|err| {
                        BridgeError::Discovery(format!("invalid protocol list: {err}"))
                    })?;
                let mut services = Vec::with_capacity(protocols.len());
                for protocol in &protocols {
                    let service = Service::from_protocol(protocol).map_err(|err| {
                        BridgeError::Discovery(format!("invalid discovered protocol: {err}"))
                    })?;
                    services.push(service);
                }
                Ok(services)
            },
            None => Ok(vec![reply.server_service]),
        }
    }

    pub(crate) async fn call_service(
        &self,
        trace: &Trace,
        service: Service,
        request: Packet,
    ) -> Result<CallReply, BridgeError> {
        // Meta serialization failure fails only this call, before any
        // bridge state changes.
        let labels = trace.encode_labels()?;
        let mut meta = HashMap::new();
        meta.insert(META_TRACE_LABELS.to_string(), labels);
        if let Some(deadline) = trace.deadline() {
            meta.insert(META_TRACE_DEADLINE.to_string(), Trace::encode_deadline(deadline));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BridgeError::Closed);
            }
            let id = state.allocate_id();

            let expire_inner = Arc::clone(&self.inner);
            let timeout_error = trace.deadline_error();
            let finalizer = trace.once_inactive(move || expire_inner.expire(id, timeout_error));

            let message = state.outgoing_message(id, &service, &meta, &request, false);
            state.pending.insert(
                id,
                CallRecord { tx, meta, request, service, retried: false, finalizer },
            );
            if self.inner.outbound.send(message).is_err() {
                if let Some(record) = state.pending.remove(&id) {
                    record.finalizer.finish();
                }
                return Err(BridgeError::Destroyed("connection is gone".to_string()));
            }
        }

        rx.await
            .unwrap_or_else(|_| Err(BridgeError::Destroyed("bridge destroyed".to_string())))
    }

    /// Stop accepting new calls; in-flight calls may still complete. The
    /// streams are released once the pending map drains. Idempotent.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.inner.maybe_release(&mut state);
    }

    /// Close immediately and fail every pending call with a "bridge
    /// destroyed" error. `error` is reported to subscribers when present.
    pub fn destroy(&self, error: Option<String>) {
        self.inner.destroy(error);
    }
}

impl std::fmt::Debug for ClientBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ClientBridge")
            .field("service", &self.inner.service.name())
            .field("closed", &state.closed)
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a pending call whose trace went inactive and complete it
    /// with the trace's timeout error.
    fn expire(self: Arc<Self>, id: i32, error: SystemError) {
        let record = {
            let mut state = self.lock();
            let record = state.pending.remove(&id);
            self.maybe_release(&mut state);
            record
        };
        if let Some(record) = record
            && record.finalizer.finish()
        {
            let _ = record.tx.send(Err(BridgeError::System(error)));
        }
    }

    /// Route one decoded response to its pending call.
    fn handle_response(self: &Arc<Self>, message: Message<HandshakeResponse>) {
        enum Action {
            Deliver(CallRecord, Packet, Service),
            Retry(Message<HandshakeRequest>),
            Drop,
            Fatal(String),
        }

        let id = message.id;
        let action = {
            let mut state = self.lock();
            let client_hash = state.pending.get(&id).map(|record| *record.service.hash());

            // Learn the server's protocol when the response teaches it.
            let mut resolved = None;
            let mut fatal = None;
            if let Some(handshake) = &message.handshake {
                match &handshake.server_protocol {
                    Some(text) => match Service::from_protocol_text(text) {
                        Ok(service) => {
                            let server_hash = handshake.server_hash.unwrap_or(*service.hash());
                            state.server_services.insert(server_hash, service.clone());
                            if let Some(client_hash) = client_hash {
                                state.hashes.insert(client_hash, server_hash);
                            }
                            resolved = Some(service);
                        },
                        Err(err) => {
                            fatal = Some(format!("unparseable server protocol: {err}"));
                        },
                    },
                    None => {
                        // A bare fingerprint only helps if the service is
                        // already known; never map to an unknown hash.
                        if let (Some(server_hash), Some(client_hash)) =
                            (handshake.server_hash, client_hash)
                            && let Some(service) =
                                state.server_services.get(&server_hash).cloned()
                        {
                            state.hashes.insert(client_hash, server_hash);
                            resolved = Some(service);
                        }
                    },
                }
            }

            if let Some(reason) = fatal {
                Action::Fatal(reason)
            } else if let Some(record) = state.pending.get_mut(&id) {
                let outcome = message.handshake.as_ref().map(|h| h.outcome);
                if outcome == Some(HandshakeMatch::None) && !record.retried {
                    // Exactly one retry per call, now carrying the protocol
                    // text.
                    record.retried = true;
                    let (service, meta, request) =
                        (record.service.clone(), record.meta.clone(), record.request.clone());
                    let retry = state.outgoing_message(id, &service, &meta, &request, true);
                    Action::Retry(retry)
                } else if let Some(record) = state.pending.remove(&id) {
                    let server_service = resolved
                        .or_else(|| {
                            let server_hash = state.hashes.get(record.service.hash())?;
                            state.server_services.get(server_hash).cloned()
                        })
                        .unwrap_or_else(|| record.service.clone());
                    self.maybe_release(&mut state);
                    Action::Deliver(record, message.packet, server_service)
                } else {
                    Action::Drop
                }
            } else {
                tracing::debug!(id, "no callback for packet; dropping response");
                Action::Drop
            }
        };

        match action {
            Action::Deliver(record, packet, server_service) => {
                if record.finalizer.finish() {
                    let _ = record.tx.send(Ok(CallReply { packet, server_service }));
                } else {
                    tracing::debug!(id, "response lost the delivery race; dropping");
                }
            },
            Action::Retry(retry) => {
                tracing::debug!(id, "handshake mismatch; retrying with protocol text");
                if self.outbound.send(retry).is_err() {
                    self.destroy(Some("connection is gone".to_string()));
                }
            },
            Action::Drop => {},
            Action::Fatal(reason) => self.destroy(Some(reason)),
        }
    }

    /// Tear the bridge down: fail every pending call, notify subscribers,
    /// abort the stream tasks. Idempotent.
    fn destroy(&self, error: Option<String>) {
        let (records, tasks) = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.closed = true;
            state.released = true;
            let records: Vec<CallRecord> =
                state.pending.drain().map(|(_, record)| record).collect();
            (records, std::mem::take(&mut state.tasks))
        };

        let reason = error.clone().unwrap_or_else(|| "bridge destroyed".to_string());
        for record in records {
            if record.finalizer.finish() {
                let _ = record.tx.send(Err(BridgeError::Destroyed(reason.clone())));
            }
        }

        if let Some(message) = error {
            tracing::error!(error = %message, "bridge destroyed");
            let _ = self.events.send(BridgeEvent::Error(message));
        }
        let _ = self.events.send(BridgeEvent::Closed);
        for task in tasks {
            task.abort();
        }
    }

    /// Release the streams once the bridge is closed and drained.
    fn maybe_release(&self, state: &mut BridgeState) {
        if !state.closed || state.released || !state.pending.is_empty() {
            return;
        }
        state.released = true;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        let _ = self.events.send(BridgeEvent::Closed);
    }
}

async fn read_loop(inner: Arc<Inner>, reader: tokio::io::ReadHalf<impl AsyncRead + AsyncWrite>) {
    let mut frames = FramedRead::new(reader, ResponseDecoder::new());
    while let Some(next) = frames.next().await {
        match next {
            Ok(message) => inner.handle_response(message),
            Err(err) => {
                inner.destroy(Some(format!("response stream failed: {err}")));
                return;
            },
        }
    }
    // Premature end of the readable side.
    inner.destroy(Some("connection closed by peer".to_string()));
}

async fn write_loop(
    inner: Arc<Inner>,
    writer: tokio::io::WriteHalf<impl AsyncRead + AsyncWrite>,
    mut outbound: mpsc::UnboundedReceiver<Message<HandshakeRequest>>,
) {
    let mut sink = FramedWrite::new(writer, RequestEncoder::new());
    while let Some(message) = outbound.recv().await {
        if let Err(err) = sink.send(message).await {
            inner.destroy(Some(format!("request stream failed: {err}")));
            return;
        }
    }
}
