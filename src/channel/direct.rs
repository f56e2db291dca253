//! Synchronous channel: direct socket access on the caller's thread.

use std::sync::Arc;

use crate::channel::{Channel, ChannelKind};
use crate::error::{Error, Result};
use crate::message::{Identity, Message};
use crate::session::Session;
use crate::trace::debug;
use crate::transport::{Linger, Transport};

/// A channel whose send/receive block the calling thread until the transport
/// completes. Owns its socket exclusively; the socket exists iff the channel
/// is alive.
pub struct SyncChannel {
    kind: ChannelKind,
    endpoint: String,
    transport: Arc<dyn Transport>,
    session: Arc<dyn Session>,
    socket: Option<Box<dyn crate::transport::Socket>>,
}

impl SyncChannel {
    /// Creates a stopped channel.
    pub fn new(
        kind: ChannelKind,
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        session: Arc<dyn Session>,
    ) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            transport,
            session,
            socket: None,
        }
    }

    /// Signs and sends a message through the owning session, blocking until
    /// the transport accepts it.
    ///
    /// # Errors
    ///
    /// [`Error::NotAlive`] if the channel is stopped; transport failures
    /// propagate untouched.
    pub fn send(&mut self, msg_type: &str, content: Vec<u8>) -> Result<()> {
        let session = Arc::clone(&self.session);
        let socket = self.socket.as_mut().ok_or(Error::NotAlive)?;
        session.send(socket.as_mut(), msg_type, content)
    }

    /// Blocks until a message arrives; the identity envelope is consumed
    /// and discarded.
    ///
    /// # Errors
    ///
    /// [`Error::NotAlive`] if the channel is stopped; transport failures
    /// propagate untouched.
    pub fn get_message(&mut self) -> Result<Message> {
        self.recv_with_identities().map(|(_, message)| message)
    }

    /// Blocks until a message arrives and returns the full
    /// `(identities, message)` pair for callers that need routing
    /// information.
    ///
    /// # Errors
    ///
    /// [`Error::NotAlive`] if the channel is stopped; transport failures
    /// propagate untouched.
    pub fn recv_with_identities(&mut self) -> Result<(Vec<Identity>, Message)> {
        let session = Arc::clone(&self.session);
        let socket = self.socket.as_mut().ok_or(Error::NotAlive)?;
        session.recv(socket.as_mut())
    }
}

impl Channel for SyncChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn start(&mut self, identity: &Identity) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }

        let mut socket = self
            .transport
            .connect(self.kind, &self.endpoint, identity)?;

        // Broadcast channels subscribe to everything up front; callers never
        // manage topic filters themselves.
        if self.kind == ChannelKind::IoPub {
            socket.subscribe_all()?;
        }

        debug!(kind = %self.kind, endpoint = %self.endpoint, "sync channel started");
        self.socket = Some(socket);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut socket) = self.socket.take() else {
            return Ok(());
        };
        match socket.close(Linger::Graceful) {
            // The desired end state was already reached.
            Ok(()) | Err(Error::SocketClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn is_alive(&self) -> bool {
        self.socket.is_some()
    }
}
