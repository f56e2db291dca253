//! Asynchronous channel: I/O delegated to the [`ioloop`] worker.
//!
//! The channel handle never touches a socket. Starting posts a connect
//! instruction and waits for the worker to report Running; sends are
//! fire-and-forget instructions; arrivals are buffered by the worker into
//! the channel's [`MessageQueue`] and consumed here with optional deadlines.
//!
//! [`ioloop`]: crate::ioloop
//! [`MessageQueue`]: crate::queue::MessageQueue

use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Channel, ChannelKind};
use crate::error::{Error, Result};
use crate::ioloop::{ChannelShared, ChannelStatus, Instruction, IoLoopHandle};
use crate::message::{Identity, Message};
use crate::queue::Delivery;
use crate::trace::debug;

/// How long `start` waits for the worker to bring the socket up.
pub const START_TIMEOUT: Duration = Duration::from_millis(500);

/// A channel whose socket lives on the I/O-loop worker thread.
///
/// The handle posts instructions and drains the receive queue; the worker
/// owns the socket and drives the status this handle observes. The queue
/// outlives start/stop cycles, so deliveries that arrived before a stop stay
/// readable after it.
pub struct AsyncChannel {
    kind: ChannelKind,
    endpoint: String,
    handle: IoLoopHandle,
    shared: Arc<ChannelShared>,
}

impl AsyncChannel {
    /// Creates a stopped channel registered on `handle`'s worker.
    ///
    /// One channel per kind per worker; a second channel of the same kind
    /// replaces the first's registration.
    pub fn new(kind: ChannelKind, endpoint: impl Into<String>, handle: &IoLoopHandle) -> Self {
        let endpoint = endpoint.into();
        let shared = handle.register(kind, endpoint.clone());
        Self {
            kind,
            endpoint,
            handle: handle.clone(),
            shared,
        }
    }

    /// Queues a message for sending on the worker. Fire-and-forget: a send
    /// on a stopped channel is dropped by the worker, not reported here.
    ///
    /// # Errors
    ///
    /// [`Error::IoLoopClosed`] if the worker thread is gone.
    pub fn send(&self, msg_type: &str, content: Vec<u8>) -> Result<()> {
        self.handle.instruct(Instruction::Send {
            kind: self.kind,
            msg_type: msg_type.to_string(),
            content,
        })
    }

    /// Removes the oldest delivery from the receive queue.
    ///
    /// With `timeout: None` this never blocks: an empty queue yields
    /// `Ok(None)` immediately. With a timeout it waits up to that long,
    /// returning as soon as a delivery arrives.
    ///
    /// # Errors
    ///
    /// [`Error::ReceiveTimeout`] if a timeout was given and nothing arrived
    /// in time.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Option<Delivery>> {
        match timeout {
            None => Ok(self.shared.queue.try_pop()),
            Some(timeout) => self.shared.queue.pop_deadline(timeout).map(Some),
        }
    }

    /// Like [`Self::receive`], with the identity envelope discarded.
    ///
    /// # Errors
    ///
    /// [`Error::ReceiveTimeout`] if a timeout was given and nothing arrived
    /// in time.
    pub fn get_message(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        Ok(self.receive(timeout)?.map(|(_, message)| message))
    }

    /// Number of deliveries waiting in the receive queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Channel for AsyncChannel {
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

        self.handle.instruct(Instruction::Start {
            kind: self.kind,
            identity: identity.clone(),
        })?;

        if !self.shared.wait_running(START_TIMEOUT) {
            return Err(Error::StartupTimeout(START_TIMEOUT));
        }
        debug!(kind = %self.kind, endpoint = %self.endpoint, "async channel started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        match self.handle.instruct(Instruction::Stop { kind: self.kind }) {
            // A dead worker means the socket is already gone.
            Ok(()) | Err(Error::IoLoopClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn is_alive(&self) -> bool {
        self.handle.is_running() && self.shared.status() != ChannelStatus::Stopped
    }
}
