//! Message and identity types moved by channels.
//!
//! Content schemas are opaque to this layer: a [`Message`] carries a type tag
//! and raw bytes, and the transports move [`WireMessage`]s (identity envelope
//! plus message) as postcard-encoded datagrams.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Routing token associated with the caller, used by the transport to
/// address replies.
pub type Identity = Vec<u8>;

/// Generates a fresh random routing identity for the current process.
///
/// Combines the process ID with a random nonce so reconnecting processes
/// never collide, even if PIDs are reused.
#[must_use]
pub fn random_identity() -> Identity {
    let nonce: [u8; 8] = rand::random();
    let mut id = Vec::with_capacity(12);
    id.extend_from_slice(&std::process::id().to_be_bytes());
    id.extend_from_slice(&nonce);
    id
}

/// A protocol message: a type tag plus opaque content bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol message type (e.g. `"execute_request"`, `"ping"`).
    pub msg_type: String,
    /// Opaque serialized content; schemas live above this layer.
    pub content: Vec<u8>,
}

impl Message {
    /// Creates a new message.
    pub fn new(msg_type: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type.into(),
            content,
        }
    }
}

/// What actually travels on the wire: the identity envelope plus the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Sender identities, outermost first. Empty for client-originated sends
    /// on connected sockets (the transport routes by connection).
    pub identities: Vec<Identity>,
    /// The message proper.
    pub message: Message,
}

impl WireMessage {
    /// Wraps a message with no identity envelope.
    #[must_use]
    pub fn bare(message: Message) -> Self {
        Self {
            identities: Vec::new(),
            message,
        }
    }

    /// Serializes this wire message into a datagram payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`](crate::Error::Codec) if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserializes a wire message from a datagram payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`](crate::Error::Codec) on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_wire_message() {
        let wire = WireMessage {
            identities: vec![vec![1, 2, 3]],
            message: Message::new("execute_request", b"{\"code\":\"1+1\"}".to_vec()),
        };

        let bytes = wire.encode().unwrap();
        let decoded = WireMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, wire);
    }

    #[test]
    fn bare_has_no_identities() {
        let wire = WireMessage::bare(Message::new("ping", Vec::new()));
        assert!(wire.identities.is_empty());
        assert_eq!(wire.message.msg_type, "ping");
    }

    #[test]
    fn identity_uniqueness() {
        let a = random_identity();
        let b = random_identity();
        assert_ne!(a, b);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(WireMessage::decode(&[0xff; 3]).is_err());
    }
}
