//! In-process loopback transport with scriptable kernel behavior.
//!
//! Stands in for a real kernel in unit and integration tests: each endpoint
//! is given a [`Responder`] that decides what happens to traffic sent to it.
//! The transport records connects, sends and subscriptions so tests can
//! observe reconnects and probe emission without reaching into channels.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::channel::ChannelKind;
use crate::error::{Error, Result};
use crate::message::{Identity, WireMessage};
use crate::transport::{Linger, Socket, Transport};

/// Scripted behavior of a mem endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Responder {
    /// Echo every sent message straight back to the sending socket.
    Echo,
    /// Accept traffic, never reply (a dead kernel).
    Silent,
    /// Reject connection attempts outright.
    Refuse,
}

/// Inbound delivery queue for one connected socket.
#[derive(Debug, Default)]
struct Inbox {
    messages: Mutex<VecDeque<WireMessage>>,
    available: Condvar,
}

impl Inbox {
    fn push(&self, wire: WireMessage) {
        let mut messages = self.messages.lock().expect("inbox lock poisoned");
        messages.push_back(wire);
        drop(messages);
        self.available.notify_one();
    }

    fn try_pop(&self) -> Option<WireMessage> {
        self.messages
            .lock()
            .expect("inbox lock poisoned")
            .pop_front()
    }

    fn pop_blocking(&self) -> WireMessage {
        let mut messages = self.messages.lock().expect("inbox lock poisoned");
        loop {
            if let Some(wire) = messages.pop_front() {
                return wire;
            }
            messages = self
                .available
                .wait(messages)
                .expect("inbox lock poisoned");
        }
    }
}

#[derive(Debug, Default)]
struct EndpointState {
    responder: Option<Responder>,
    connects: usize,
    sent: Vec<WireMessage>,
    subscribed: bool,
    /// Inbox of the most recently connected socket.
    inbox: Option<Arc<Inbox>>,
}

/// Shared loopback transport. Cloning yields another handle onto the same
/// endpoints, so tests keep one handle for scripting and hand another to
/// the channels under test.
#[derive(Debug, Clone, Default)]
pub struct MemTransport {
    endpoints: Arc<Mutex<HashMap<String, EndpointState>>>,
}

impl MemTransport {
    /// Creates a transport with no scripted endpoints (default is Echo).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the behavior of `endpoint`.
    pub fn set_responder(&self, endpoint: &str, responder: Responder) {
        let mut endpoints = self.endpoints.lock().expect("mem lock poisoned");
        endpoints.entry(endpoint.to_string()).or_default().responder = Some(responder);
    }

    /// Number of times `endpoint` has been connected to (reconnects count).
    #[must_use]
    pub fn connects(&self, endpoint: &str) -> usize {
        let endpoints = self.endpoints.lock().expect("mem lock poisoned");
        endpoints.get(endpoint).map_or(0, |s| s.connects)
    }

    /// Number of messages sent to `endpoint` across all sockets.
    #[must_use]
    pub fn sent_count(&self, endpoint: &str) -> usize {
        let endpoints = self.endpoints.lock().expect("mem lock poisoned");
        endpoints.get(endpoint).map_or(0, |s| s.sent.len())
    }

    /// The most recent message sent to `endpoint`, if any.
    #[must_use]
    pub fn last_sent(&self, endpoint: &str) -> Option<WireMessage> {
        let endpoints = self.endpoints.lock().expect("mem lock poisoned");
        endpoints.get(endpoint).and_then(|s| s.sent.last().cloned())
    }

    /// Whether the currently connected socket subscribed to all topics.
    #[must_use]
    pub fn subscribed(&self, endpoint: &str) -> bool {
        let endpoints = self.endpoints.lock().expect("mem lock poisoned");
        endpoints.get(endpoint).is_some_and(|s| s.subscribed)
    }

    /// Delivers `wire` inbound on the socket currently connected to
    /// `endpoint` (kernel-originated traffic, e.g. iopub broadcasts).
    ///
    /// Silently drops if nothing is connected.
    pub fn inject(&self, endpoint: &str, wire: WireMessage) {
        let inbox = {
            let endpoints = self.endpoints.lock().expect("mem lock poisoned");
            endpoints.get(endpoint).and_then(|s| s.inbox.clone())
        };
        if let Some(inbox) = inbox {
            inbox.push(wire);
        }
    }
}

impl Transport for MemTransport {
    fn connect(
        &self,
        _kind: ChannelKind,
        endpoint: &str,
        _identity: &Identity,
    ) -> Result<Box<dyn Socket>> {
        let mut endpoints = self.endpoints.lock().expect("mem lock poisoned");
        let state = endpoints.entry(endpoint.to_string()).or_default();

        let responder = state.responder.unwrap_or(Responder::Echo);
        if responder == Responder::Refuse {
            return Err(Error::Transport {
                message: format!("endpoint refused: {endpoint}"),
            });
        }

        let inbox = Arc::new(Inbox::default());
        state.connects += 1;
        state.subscribed = false;
        state.inbox = Some(Arc::clone(&inbox));

        Ok(Box::new(MemSocket {
            endpoint: endpoint.to_string(),
            endpoints: Arc::clone(&self.endpoints),
            inbox,
            closed: false,
        }))
    }
}

struct MemSocket {
    endpoint: String,
    endpoints: Arc<Mutex<HashMap<String, EndpointState>>>,
    inbox: Arc<Inbox>,
    closed: bool,
}

impl MemSocket {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::SocketClosed);
        }
        Ok(())
    }
}

impl Socket for MemSocket {
    fn send(&mut self, wire: &WireMessage) -> Result<()> {
        self.ensure_open()?;
        let responder = {
            let mut endpoints = self.endpoints.lock().expect("mem lock poisoned");
            let state = endpoints.entry(self.endpoint.clone()).or_default();
            state.sent.push(wire.clone());
            state.responder.unwrap_or(Responder::Echo)
        };
        if responder == Responder::Echo {
            self.inbox.push(wire.clone());
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<WireMessage> {
        self.ensure_open()?;
        Ok(self.inbox.pop_blocking())
    }

    fn try_recv(&mut self) -> Result<Option<WireMessage>> {
        self.ensure_open()?;
        Ok(self.inbox.try_pop())
    }

    fn subscribe_all(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mut endpoints = self.endpoints.lock().expect("mem lock poisoned");
        endpoints
            .entry(self.endpoint.clone())
            .or_default()
            .subscribed = true;
        Ok(())
    }

    fn close(&mut self, _linger: Linger) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}
