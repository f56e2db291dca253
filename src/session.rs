//! Session seam: signed send/receive primitives for synchronous channels.
//!
//! Message authentication lives above this crate. Sync channels delegate
//! their traffic to the owning session so a signing implementation can wrap
//! outbound messages and verify inbound ones without the channel knowing.

use crate::error::Result;
use crate::message::{Identity, Message, WireMessage};
use crate::transport::Socket;

/// Signing/framing primitives keyed by a channel's socket.
pub trait Session: Send + Sync {
    /// Frames, signs and sends a message on `socket`, blocking until the
    /// transport accepts it.
    fn send(&self, socket: &mut dyn Socket, msg_type: &str, content: Vec<u8>) -> Result<()>;

    /// Receives and verifies one message from `socket`, blocking until one
    /// arrives. Returns the full identity envelope alongside the message.
    fn recv(&self, socket: &mut dyn Socket) -> Result<(Vec<Identity>, Message)>;
}

/// Unsigned passthrough session: frames messages as-is, verifies nothing.
#[derive(Debug, Default)]
pub struct PlainSession;

impl PlainSession {
    /// Creates the passthrough session.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Session for PlainSession {
    fn send(&self, socket: &mut dyn Socket, msg_type: &str, content: Vec<u8>) -> Result<()> {
        socket.send(&WireMessage::bare(Message::new(msg_type, content)))
    }

    fn recv(&self, socket: &mut dyn Socket) -> Result<(Vec<Identity>, Message)> {
        let wire = socket.recv()?;
        Ok((wire.identities, wire.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::message::random_identity;
    use crate::transport::Transport;
    use crate::transport::mem::MemTransport;

    #[test]
    fn plain_session_roundtrip() {
        let transport = MemTransport::new();
        let mut socket = transport
            .connect(ChannelKind::Shell, "mem://shell", &random_identity())
            .unwrap();

        let session = PlainSession::new();
        session
            .send(socket.as_mut(), "execute_request", b"1+1".to_vec())
            .unwrap();

        let (identities, message) = session.recv(socket.as_mut()).unwrap();
        assert!(identities.is_empty());
        assert_eq!(message.msg_type, "execute_request");
        assert_eq!(message.content, b"1+1");
    }
}
