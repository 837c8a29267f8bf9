//! Service discovery over a fresh duplex stream.
//!
//! [`netty_router`] bootstraps a connection: it pings the peer through the
//! well-known discovery service, learns which protocols the peer routes,
//! and hands back a [`BridgeRouter`] that issues calls for any of them over
//! the same bridge.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use framegate_core::{Service, Trace};
use framegate_proto::Packet;

use crate::{
    bridge::{BridgeEvent, ClientBridge},
    errors::BridgeError,
};

/// Options for [`netty_router`].
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    /// Deadline applied to the discovery ping. `None` means no deadline.
    pub timeout: Option<Duration>,
}

/// A discovered set of services callable over one bridge.
#[derive(Debug)]
pub struct BridgeRouter {
    bridge: ClientBridge,
    services: Vec<Service>,
}

impl BridgeRouter {
    /// Services the remote peer routes.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// The underlying bridge.
    pub fn bridge(&self) -> &ClientBridge {
        &self.bridge
    }

    /// Issue a call for one of the discovered services.
    pub async fn call(
        &self,
        trace: &Trace,
        service: &Service,
        request: Packet,
    ) -> Result<Packet, BridgeError> {
        let reply = self.bridge.call_service(trace, service.clone(), request).await?;
        Ok(reply.packet)
    }

    /// Subscribe to the bridge's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.bridge.subscribe()
    }

    /// Close the underlying bridge. Idempotent.
    pub fn close(&self) {
        self.bridge.close();
    }
}

/// Perform discovery on `stream`, then deliver a router over the bridge.
pub async fn netty_router<S>(stream: S, options: RouterOptions) -> Result<BridgeRouter, BridgeError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let bridge = ClientBridge::new(stream, Service::discovery());
    let trace = match options.timeout {
        Some(timeout) => Trace::with_timeout(timeout),
        None => Trace::new(),
    };
    let services = bridge.ping(&trace).await?;
    tracing::debug!(count = services.len(), "discovery complete");
    Ok(BridgeRouter { bridge, services })
}
