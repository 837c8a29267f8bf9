//! Router and channel seams.
//!
//! The transport never dispatches to business handlers itself. A gateway
//! forwards decoded requests into a [`Router`], whose [`Channel`] produces
//! the response packet; a client-side router delivers calls over a bridge.
//! Connection-scoped failures surface on the router's event channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use framegate_proto::Packet;

use crate::{service::Service, trace::Trace};

/// Boxed error a channel may fail with.
///
/// A gateway passes a `framegate_proto::SystemError` through to the wire
/// unchanged and wraps anything else under `CHANNEL_FAILURE`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Asynchronous request handler behind a router.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Handle one request, producing a response packet.
    async fn call(&self, trace: Trace, request: Packet) -> Result<Packet, BoxError>;
}

/// Events a router emits about the connections serving it.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// A connection failed (codec or I/O error); the connection closed.
    ConnectionError(String),
}

/// A set of services plus the channel that executes their calls.
#[derive(Clone)]
pub struct Router {
    services: Arc<Vec<Service>>,
    channel: Arc<dyn Channel>,
    events: broadcast::Sender<RouterEvent>,
}

impl Router {
    /// Build a router over `services`, dispatching through `channel`.
    pub fn new(services: Vec<Service>, channel: Arc<dyn Channel>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { services: Arc::new(services), channel, events }
    }

    /// Services this router can execute.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// The server-side service matching a client's service.
    ///
    /// Matches by fingerprint first, then by protocol name (the client may
    /// speak an older revision of a service this router owns), then falls
    /// back to a sole service.
    pub fn service_for(&self, client: &Service) -> Option<&Service> {
        if let Some(exact) = self.services.iter().find(|s| s.hash() == client.hash()) {
            return Some(exact);
        }
        if let Some(named) =
            self.services.iter().find(|s| !s.name().is_empty() && s.name() == client.name())
        {
            return Some(named);
        }
        match self.services.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// The handler channel.
    pub fn channel(&self) -> Arc<dyn Channel> {
        self.channel.clone()
    }

    /// Publish a connection-scoped error to subscribers.
    pub fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(error = %message, "router connection error");
        // Delivery is best-effort; nobody may be listening.
        let _ = self.events.send(RouterEvent::ConnectionError(message));
    }

    /// Subscribe to router events.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("services", &self.services.iter().map(Service::name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoChannel;

    #[async_trait]
    impl Channel for EchoChannel {
        async fn call(&self, _trace: Trace, request: Packet) -> Result<Packet, BoxError> {
            Ok(request)
        }
    }

    fn service(name: &str) -> Service {
        Service::from_protocol_text(&format!("{{\"protocol\":\"{name}\"}}")).unwrap()
    }

    #[test]
    fn resolves_by_hash_then_name_then_singleton() {
        let a = service("A");
        let b = service("B");
        let router = Router::new(vec![a.clone(), b.clone()], Arc::new(EchoChannel));

        assert_eq!(router.service_for(&a), Some(&a));

        // Same name, different text: resolves by name.
        let a_v2 = Service::from_protocol_text("{\"protocol\":\"A\",\"messages\":{}}").unwrap();
        assert_eq!(router.service_for(&a_v2), Some(&a));

        // Unknown client against a multi-service router: no match.
        let c = service("C");
        assert_eq!(router.service_for(&c), None);

        // Unknown client against a single-service router: the sole service.
        let single = Router::new(vec![b.clone()], Arc::new(EchoChannel));
        assert_eq!(single.service_for(&c), Some(&b));
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let router = Router::new(vec![service("A")], Arc::new(EchoChannel));
        let mut events = router.subscribe();
        router.emit_error("decoder failed");
        match events.recv().await.unwrap() {
            RouterEvent::ConnectionError(message) => assert_eq!(message, "decoder failed"),
        }
    }
}
