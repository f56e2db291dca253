//! Receive queue for asynchronously delivered messages.
//!
//! A growable FIFO of `(identities, message)` pairs. The I/O-loop worker is
//! the single producer; the channel consumer is the single consumer. The
//! queue starts small and grows on overflow rather than dropping — delivery
//! order always equals arrival order.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use minstant::Instant;

use crate::error::{Error, Result};
use crate::message::{Identity, Message};

/// Initial queue capacity; the queue grows past this rather than dropping.
pub const INITIAL_QUEUE_CAPACITY: usize = 10;

/// A received-message entry: the identity envelope and the message.
pub type Delivery = (Vec<Identity>, Message);

/// FIFO queue of received messages with blocking and non-blocking removal.
#[derive(Debug)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<Delivery>>,
    available: Condvar,
}

impl MessageQueue {
    /// Creates an empty queue with the default initial capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(INITIAL_QUEUE_CAPACITY)),
            available: Condvar::new(),
        }
    }

    /// Appends a delivery, growing the queue if at capacity.
    ///
    /// This is the only mutation path into the queue besides [`Self::try_pop`]
    /// and [`Self::pop_deadline`]; only the delivery callback should call it.
    pub fn push(&self, identities: Vec<Identity>, message: Message) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.push_back((identities, message));
        drop(inner);
        self.available.notify_one();
    }

    /// Removes and returns the oldest delivery, or `None` if empty.
    ///
    /// Never blocks; an empty queue is not an error.
    #[must_use]
    pub fn try_pop(&self) -> Option<Delivery> {
        self.inner.lock().expect("queue lock poisoned").pop_front()
    }

    /// Removes and returns the oldest delivery, waiting up to `timeout` for
    /// one to arrive.
    ///
    /// Returns as soon as a delivery is available, not at the deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReceiveTimeout`] if nothing arrives in time.
    pub fn pop_deadline(&self, timeout: Duration) -> Result<Delivery> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        loop {
            if let Some(delivery) = inner.pop_front() {
                return Ok(delivery);
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(Error::ReceiveTimeout(timeout));
            };
            let (guard, wait) = self
                .available
                .wait_timeout(inner, remaining)
                .expect("queue lock poisoned");
            inner = guard;
            if wait.timed_out() && inner.is_empty() {
                return Err(Error::ReceiveTimeout(timeout));
            }
        }
    }

    /// Returns the number of queued deliveries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    /// Returns `true` if no deliveries are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
