//! Channel lifecycle and liveness layer for client-to-kernel messaging.
//!
//! A client talks to a compute kernel over a set of typed channels (shell,
//! control, iopub, stdin, heartbeat). This crate provides the channel layer:
//! uniform start/stop lifecycle, three execution variants, and kernel
//! liveness detection.
//!
//! - [`SyncChannel`] does socket I/O on the caller's thread.
//! - [`AsyncChannel`] delegates I/O to the [`IoLoop`] worker and buffers
//!   arrivals in a growable FIFO queue.
//! - [`HeartbeatChannel`] probes the kernel once per period and reconnects
//!   when a probe goes unanswered.
//!
//! Transports are pluggable behind the [`Transport`] seam; [`UdpTransport`]
//! is the wire implementation, [`transport::mem::MemTransport`] a scriptable
//! in-process loopback for tests. Message signing plugs in above the channel
//! layer through the [`Session`] seam.

pub mod channel;
pub mod error;
pub mod ioloop;
pub mod message;
pub mod queue;
pub mod session;
pub mod trace;
pub mod transport;

pub use channel::direct::SyncChannel;
pub use channel::heartbeat::{DEFAULT_TIME_TO_DEAD, HeartbeatChannel};
pub use channel::queued::{AsyncChannel, START_TIMEOUT};
pub use channel::{Channel, ChannelKind};
pub use error::{Error, Result};
pub use ioloop::{ChannelStatus, IoLoop, IoLoopHandle};
pub use message::{Identity, Message, WireMessage, random_identity};
pub use queue::{Delivery, MessageQueue};
pub use session::{PlainSession, Session};
pub use transport::udp::UdpTransport;
pub use transport::{Linger, Socket, Transport};

#[cfg(feature = "tracing")]
pub use trace::init_tracing;
