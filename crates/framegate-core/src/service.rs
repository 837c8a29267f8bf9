//! Service identity: a protocol description plus its fingerprint.
//!
//! A service is the unit the transport negotiates over. The transport never
//! interprets the protocol JSON beyond its name; it cares only that both
//! sides derive the same 16-byte fingerprint from the same protocol text.

use md5::{Digest, Md5};
use serde_json::Value;
use thiserror::Error;

use framegate_proto::Fingerprint;

/// Protocol text of the well-known discovery service.
pub const DISCOVERY_PROTOCOL: &str = "{\"protocol\":\"avro.netty.DiscoveryService\"}";

/// Errors constructing a [`Service`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The protocol text was not valid JSON.
    #[error("invalid protocol text: {0}")]
    InvalidProtocol(#[from] serde_json::Error),
}

/// A named protocol with a stable fingerprint.
///
/// The fingerprint is the MD5 digest of the protocol's canonical JSON
/// rendering, so every side that parses the same protocol derives the same
/// fingerprint no matter how the text was formatted in transit.
/// [`Service::protocol_text`] returns that canonical rendering, and it is
/// what travels on the wire. Services compare equal by fingerprint.
#[derive(Debug, Clone)]
pub struct Service {
    name: String,
    protocol: Value,
    protocol_text: String,
    hash: Fingerprint,
}

impl Service {
    /// Parse a service from its protocol text.
    pub fn from_protocol_text(text: &str) -> Result<Self, ServiceError> {
        let protocol: Value = serde_json::from_str(text)?;
        Self::from_parsed(protocol)
    }

    /// Build a service from an already-parsed protocol value.
    pub fn from_protocol(protocol: &Value) -> Result<Self, ServiceError> {
        Self::from_parsed(protocol.clone())
    }

    fn from_parsed(protocol: Value) -> Result<Self, ServiceError> {
        let text = serde_json::to_string(&protocol)?;
        let name = protocol
            .get("protocol")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let hash = fingerprint(&text);
        Ok(Self { name, protocol, protocol_text: text, hash })
    }

    /// The well-known discovery service.
    pub fn discovery() -> Self {
        let hash = fingerprint(DISCOVERY_PROTOCOL);
        Self {
            name: "avro.netty.DiscoveryService".to_string(),
            protocol: serde_json::json!({"protocol": "avro.netty.DiscoveryService"}),
            protocol_text: DISCOVERY_PROTOCOL.to_string(),
            hash,
        }
    }

    /// Protocol name, empty when the protocol text carries none.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parsed protocol description.
    pub fn protocol(&self) -> &Value {
        &self.protocol
    }

    /// The exact text the fingerprint was computed over.
    pub fn protocol_text(&self) -> &str {
        &self.protocol_text
    }

    /// 16-byte protocol fingerprint.
    pub fn hash(&self) -> &Fingerprint {
        &self.hash
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Service {}

fn fingerprint(text: &str) -> Fingerprint {
    let digest = Md5::digest(text.as_bytes());
    digest.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_matches_across_sides() {
        let text = "{\"protocol\":\"Echo\",\"messages\":{}}";
        let client_side = Service::from_protocol_text(text).unwrap();
        let server_side = Service::from_protocol_text(text).unwrap();
        assert_eq!(client_side.hash(), server_side.hash());
        assert_eq!(client_side, server_side);
        assert_eq!(client_side.name(), "Echo");
    }

    #[test]
    fn different_protocols_fingerprint_differently() {
        let a = Service::from_protocol_text("{\"protocol\":\"A\"}").unwrap();
        let b = Service::from_protocol_text("{\"protocol\":\"B\"}").unwrap();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn formatting_does_not_change_the_fingerprint() {
        // Key order and whitespace differ; the protocol is the same.
        let a = Service::from_protocol_text("{\"protocol\":\"Echo\",\"messages\":{}}").unwrap();
        let b = Service::from_protocol_text("{ \"messages\": {}, \"protocol\": \"Echo\" }").unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.protocol_text(), b.protocol_text());
    }

    #[test]
    fn discovery_round_trips_through_text() {
        let discovery = Service::discovery();
        let reparsed = Service::from_protocol_text(discovery.protocol_text()).unwrap();
        assert_eq!(discovery.hash(), reparsed.hash());
        assert_eq!(discovery.name(), "avro.netty.DiscoveryService");
    }

    #[test]
    fn invalid_protocol_text_rejected() {
        assert!(Service::from_protocol_text("not json").is_err());
    }
}
