//! Error types for klink.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by channels, transports and the I/O loop.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An async channel failed to report alive within the startup deadline.
    #[error("channel failed to start within {0:?}")]
    StartupTimeout(Duration),

    /// No message arrived within the caller-supplied deadline.
    #[error("no message arrived within {0:?}")]
    ReceiveTimeout(Duration),

    /// An operation requiring liveness was invoked on a stopped channel.
    #[error("channel is not alive")]
    NotAlive,

    /// The transport considers the socket already gone.
    ///
    /// `SyncChannel::stop` treats this as success; everywhere else it
    /// propagates.
    #[error("socket already closed")]
    SocketClosed,

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(postcard::Error),

    /// Transport-level failure that is not a plain I/O error.
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable description from the transport.
        message: String,
    },

    /// The I/O-loop worker is no longer accepting instructions.
    #[error("I/O loop is gone")]
    IoLoopClosed,
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Self::Codec(err)
    }
}

/// Convenience result type for klink operations.
pub type Result<T> = std::result::Result<T, Error>;
