//! Server gateway: framed requests in, routed calls out.
//!
//! A [`Gateway`] accepts duplex streams and serves each on its own task
//! pair: a read task decoding frame groups and resolving handshakes, and a
//! write task serializing responses so groups stay atomic on the wire.
//! Handlers run on per-request tasks, so one slow call never blocks the
//! connection.
//!
//! The handshake policy follows the negotiation protocol: `BOTH` when the
//! client guessed the server's fingerprint right, `CLIENT` when the client
//! needs to learn the server's protocol, `NONE` (plus a retryable system
//! error) when the client itself is unknown. Connections are stateful: once
//! a client service is negotiated, later requests may omit the handshake
//! entirely. That mode is only safe with one client per connection.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use framegate_core::{Router, Service, Trace};
use framegate_proto::{
    BODY_EMPTY_OK, Fingerprint, HEADER_PROTOCOLS, HandshakeMatch, HandshakeRequest,
    HandshakeResponse, META_TRACE_DEADLINE, META_TRACE_LABELS, Message, Packet, RequestDecoder,
    ResponseEncoder, SystemError, codes,
};

use crate::errors::ConnectionError;

/// Shared cache of client services keyed by fingerprint.
///
/// Read-mostly; populated the first time a client ships its protocol text
/// and consulted by every connection of the gateway afterwards.
type ClientServices = Arc<Mutex<HashMap<Fingerprint, Service>>>;

/// Messages queued for the connection's write task.
enum Outbound {
    /// A regular response.
    Reply(Message<HandshakeResponse>),
    /// A response after which the connection closes.
    Final(Message<HandshakeResponse>),
}

/// Server-side acceptor mapping incoming calls onto a router.
pub struct Gateway {
    router: Router,
    client_services: ClientServices,
}

impl Gateway {
    /// Build a gateway serving `router`.
    pub fn new(router: Router) -> Self {
        Self { router, client_services: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// The router this gateway forwards calls into.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Attach a connection. The returned handle completes when the
    /// connection has fully shut down.
    pub fn accept<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let router = self.router.clone();
        let client_services = Arc::clone(&self.client_services);
        tokio::spawn(serve(router, client_services, stream))
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").field("router", &self.router).finish_non_exhaustive()
    }
}

async fn serve<S>(router: Router, client_services: ClientServices, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let writer_task = tokio::spawn(write_loop(
        router.clone(),
        FramedWrite::new(writer, ResponseEncoder::new()),
        outbound_rx,
        shutdown.clone(),
    ));

    let mut connection = Connection {
        router: router.clone(),
        client_services,
        outbound,
        client_svc: None,
        discovery_hash: *Service::discovery().hash(),
    };

    let mut requests = FramedRead::new(reader, RequestDecoder::new());
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            next = requests.next() => match next {
                None => break,
                Some(Ok(message)) => {
                    if let Err(err) = connection.handle(message) {
                        tracing::error!(error = %err, "protocol violation; closing connection");
                        router.emit_error(err.to_string());
                        shutdown.cancel();
                        break;
                    }
                },
                Some(Err(err)) => {
                    tracing::error!(error = %err, "request decode failed; closing connection");
                    router.emit_error(format!("request stream failed: {err}"));
                    shutdown.cancel();
                    break;
                },
            },
        }
    }

    // Dropping the connection releases its outbound sender; the write task
    // drains whatever in-flight handlers still produce, then finishes.
    drop(connection);
    let _ = writer_task.await;
}

async fn write_loop<W>(
    router: Router,
    mut sink: FramedWrite<W, ResponseEncoder>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            next = outbound.recv() => match next {
                None => break,
                Some(Outbound::Reply(message)) => {
                    if let Err(err) = sink.send(message).await {
                        tracing::error!(error = %err, "response write failed; closing connection");
                        router.emit_error(format!("response stream failed: {err}"));
                        shutdown.cancel();
                        break;
                    }
                },
                Some(Outbound::Final(message)) => {
                    if let Err(err) = sink.send(message).await {
                        router.emit_error(format!("response stream failed: {err}"));
                    }
                    shutdown.cancel();
                    break;
                },
            },
        }
    }
}

/// Per-connection state and request handling.
struct Connection {
    router: Router,
    client_services: ClientServices,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Last negotiated client service, reused when requests omit the
    /// handshake.
    client_svc: Option<Service>,
    discovery_hash: Fingerprint,
}

impl Connection {
    fn handle(&mut self, message: Message<HandshakeRequest>) -> Result<(), ConnectionError> {
        let Message { id, handshake, packet } = message;

        let (service, trace, reply) = match handshake {
            None => {
                let Some(service) = self.client_svc.clone() else {
                    return Err(ConnectionError::ExpectedHandshake);
                };
                // Stateful mode: no handshake in, none out, no trace meta.
                (service, Trace::new(), None)
            },
            Some(handshake) => {
                let deadline = handshake
                    .meta
                    .get(META_TRACE_DEADLINE)
                    .map(|raw| Trace::decode_deadline(raw))
                    .transpose()?;
                let trace = match deadline {
                    Some(deadline) => Trace::with_deadline(deadline),
                    None => Trace::new(),
                };
                if !trace.active() {
                    tracing::debug!(id, "trace inactive on arrival; dropping request");
                    return Ok(());
                }
                if let Some(raw) = handshake.meta.get(META_TRACE_LABELS) {
                    match Trace::decode_labels(raw) {
                        Ok(labels) => trace.merge_labels(labels),
                        Err(err) => {
                            tracing::warn!(id, error = %err, "ignoring undecodable trace labels");
                        },
                    }
                }

                // Discovery never reaches the router.
                if handshake.client_hash == self.discovery_hash {
                    self.respond_discovery(id);
                    return Ok(());
                }

                let service = match self.resolve_client(&handshake) {
                    Some(service) => service,
                    None => {
                        self.reject_unknown_client(id);
                        return Ok(());
                    },
                };

                let reply = self.negotiate(&service, &handshake);
                (service, trace, Some(reply))
            },
        };

        self.client_svc = Some(service);
        self.dispatch(id, trace, packet, reply);
        Ok(())
    }

    /// Look the client up by fingerprint, learning its protocol when the
    /// request ships one. `None` means the client stays unknown.
    fn resolve_client(&self, handshake: &HandshakeRequest) -> Option<Service> {
        let cached = {
            let services =
                self.client_services.lock().unwrap_or_else(PoisonError::into_inner);
            services.get(&handshake.client_hash).cloned()
        };
        if cached.is_some() {
            return cached;
        }
        let text = handshake.client_protocol.as_deref()?;
        match Service::from_protocol_text(text) {
            Ok(service) => {
                let mut services =
                    self.client_services.lock().unwrap_or_else(PoisonError::into_inner);
                services.insert(handshake.client_hash, service.clone());
                Some(service)
            },
            Err(err) => {
                tracing::debug!(error = %err, "unparseable client protocol");
                None
            },
        }
    }

    /// Build the handshake response for a recognized client.
    fn negotiate(&self, client: &Service, handshake: &HandshakeRequest) -> HandshakeResponse {
        let server = self
            .router
            .service_for(client)
            .cloned()
            .or_else(|| self.router.services().first().cloned())
            .unwrap_or_else(|| client.clone());

        if *server.hash() == handshake.server_hash {
            HandshakeResponse {
                outcome: HandshakeMatch::Both,
                server_protocol: None,
                server_hash: None,
                meta: HashMap::new(),
            }
        } else {
            // The client guessed wrong; teach it the server's protocol.
            HandshakeResponse {
                outcome: HandshakeMatch::Client,
                server_protocol: Some(server.protocol_text().to_string()),
                server_hash: Some(*server.hash()),
                meta: HashMap::new(),
            }
        }
    }

    /// Answer a discovery ping with the full protocol list.
    fn respond_discovery(&self, id: i32) {
        let protocols: Vec<serde_json::Value> =
            self.router.services().iter().map(|s| s.protocol().clone()).collect();
        let raw = match serde_json::to_vec(&protocols) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(error = %err, "discovery protocols are not serializable");
                return;
            },
        };
        let handshake = HandshakeResponse {
            outcome: HandshakeMatch::Both,
            server_protocol: None,
            server_hash: None,
            meta: HashMap::new(),
        };
        let packet = Packet::new(
            HashMap::from([(HEADER_PROTOCOLS.to_string(), Bytes::from(raw))]),
            Bytes::from_static(&[BODY_EMPTY_OK]),
        );
        self.send(Outbound::Reply(Message::with_handshake(id, handshake, packet)));
    }

    /// Reject an unknown client with a retryable system error. When this
    /// gateway routes exactly one service, its protocol rides along so the
    /// client can finish in a single retry.
    fn reject_unknown_client(&self, id: i32) {
        let mut handshake = HandshakeResponse {
            outcome: HandshakeMatch::None,
            server_protocol: None,
            server_hash: None,
            meta: HashMap::new(),
        };
        if let [only] = self.router.services() {
            handshake.server_protocol = Some(only.protocol_text().to_string());
            handshake.server_hash = Some(*only.hash());
        }
        let error = SystemError::new(
            codes::UNKNOWN_CLIENT_PROTOCOL,
            "unknown client protocol; retry with the protocol attached",
        );
        let packet = Packet::system_error(&error, HashMap::new());
        self.send(Outbound::Reply(Message::with_handshake(id, handshake, packet)));
    }

    /// Forward a decoded request into the router on its own task.
    fn dispatch(
        &self,
        id: i32,
        trace: Trace,
        request: Packet,
        handshake: Option<HandshakeResponse>,
    ) {
        let channel = self.router.channel();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            match channel.call(trace, request).await {
                Ok(response) => {
                    let message = Message { id, handshake, packet: response };
                    if outbound.send(Outbound::Reply(message)).is_err() {
                        tracing::debug!(id, "writer finished; dropping response");
                    }
                },
                Err(error) => {
                    let error = match error.downcast::<SystemError>() {
                        Ok(system) => *system,
                        Err(other) => SystemError::or_code(codes::CHANNEL_FAILURE, &other),
                    };
                    tracing::warn!(id, error = %error, "channel failed; closing connection");
                    let message = Message {
                        id,
                        handshake,
                        packet: Packet::system_error(&error, HashMap::new()),
                    };
                    let _ = outbound.send(Outbound::Final(message));
                },
            }
        });
    }

    fn send(&self, outbound: Outbound) {
        if self.outbound.send(outbound).is_err() {
            tracing::debug!("writer finished; dropping response");
        }
    }
}
