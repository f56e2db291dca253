//! Channel abstraction: kinds, the shared lifecycle contract, and the three
//! execution variants.
//!
//! A channel is a logical, typed path to a remote kernel. All variants share
//! the same start/stop contract; what differs is who moves the bytes:
//!
//! - [`direct::SyncChannel`] — socket I/O on the caller's thread.
//! - [`queued::AsyncChannel`] — I/O delegated to the [`ioloop`] worker,
//!   arrivals buffered in a [`MessageQueue`].
//! - [`heartbeat::HeartbeatChannel`] — a recurring liveness probe with
//!   reconnect-on-miss recovery.
//!
//! [`ioloop`]: crate::ioloop
//! [`MessageQueue`]: crate::queue::MessageQueue

pub mod direct;
pub mod heartbeat;
pub mod queued;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Identity;

/// The class of protocol traffic a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Out-of-band control requests (interrupt, shutdown).
    Control,
    /// Code execution and introspection requests.
    Shell,
    /// Broadcast status and output (subscribe-all on connect).
    IoPub,
    /// Kernel-initiated input requests.
    Stdin,
    /// Liveness probes.
    Heartbeat,
}

impl ChannelKind {
    /// Protocol name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Shell => "shell",
            Self::IoPub => "iopub",
            Self::Stdin => "stdin",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle contract shared by every channel variant.
///
/// `start` and `stop` are idempotent: starting an alive channel and stopping
/// a stopped one are no-ops, never errors.
pub trait Channel {
    /// The kind of traffic this channel carries. Immutable.
    fn kind(&self) -> ChannelKind;

    /// The transport address this channel talks to. Immutable.
    fn endpoint(&self) -> &str;

    /// Establishes whatever connection or registration the variant needs,
    /// using `identity` as the transport routing token.
    fn start(&mut self, identity: &Identity) -> Result<()>;

    /// Releases the variant's resources.
    fn stop(&mut self) -> Result<()>;

    /// Whether the channel currently holds its liveness resource (socket,
    /// worker registration, or timer — per variant).
    fn is_alive(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_matches_protocol_names() {
        assert_eq!(ChannelKind::Control.to_string(), "control");
        assert_eq!(ChannelKind::Shell.to_string(), "shell");
        assert_eq!(ChannelKind::IoPub.to_string(), "iopub");
        assert_eq!(ChannelKind::Stdin.to_string(), "stdin");
        assert_eq!(ChannelKind::Heartbeat.to_string(), "heartbeat");
    }
}
