//! Transport seam: socket connect/send/recv primitives consumed by channels.
//!
//! Channels never touch sockets directly; they go through these traits so the
//! same lifecycle logic runs over UDP ([`udp::UdpTransport`]) or the
//! in-process loopback ([`mem::MemTransport`]) used by tests.

pub mod mem;
pub mod udp;

use crate::channel::ChannelKind;
use crate::error::Result;
use crate::message::{Identity, WireMessage};

/// Close behavior for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linger {
    /// Flush pending traffic before closing.
    Graceful,
    /// Zero linger: discard pending traffic and close immediately.
    Immediate,
}

/// Factory for channel sockets.
///
/// `connect` receives the channel kind so transports can apply kind-specific
/// configuration (the broadcast kind is additionally subscribed via
/// [`Socket::subscribe_all`] by the channel itself).
pub trait Transport: Send + Sync {
    /// Connects a socket for `kind` to `endpoint`, registering `identity` as
    /// the routing token for replies.
    fn connect(
        &self,
        kind: ChannelKind,
        endpoint: &str,
        identity: &Identity,
    ) -> Result<Box<dyn Socket>>;
}

/// A connected channel socket.
pub trait Socket: Send {
    /// Sends a wire message, blocking until the transport accepts it.
    fn send(&mut self, wire: &WireMessage) -> Result<()>;

    /// Receives a wire message, blocking until one arrives.
    fn recv(&mut self) -> Result<WireMessage>;

    /// Attempts to receive, returning `Ok(None)` instead of would-block.
    ///
    /// Useful in polling loops where an empty socket is expected.
    fn try_recv(&mut self) -> Result<Option<WireMessage>>;

    /// Subscribes to all broadcast topics. No-op for non-broadcast sockets.
    fn subscribe_all(&mut self) -> Result<()>;

    /// Closes the socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SocketClosed`](crate::Error::SocketClosed) if the
    /// transport considers the socket already gone.
    fn close(&mut self, linger: Linger) -> Result<()>;
}
