//! I/O-loop worker for asynchronous channels.
//!
//! Responsibilities:
//! - Own the actual sockets of every [`AsyncChannel`] attached to it.
//! - Apply channel instructions (start/stop/send) posted by channel handles.
//! - Drain inbound traffic into each channel's [`MessageQueue`].
//! - Drive per-channel status transitions observed by `is_alive()`.
//!
//! Channels never reach into the worker; they post typed [`Instruction`]s and
//! watch their own status converge.
//!
//! [`AsyncChannel`]: crate::channel::queued::AsyncChannel
//! [`MessageQueue`]: crate::queue::MessageQueue

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use crate::channel::ChannelKind;
use crate::error::{Error, Result};
use crate::message::{Identity, Message, WireMessage};
use crate::queue::MessageQueue;
use crate::trace::{debug, info, warn};
use crate::transport::{Linger, Socket, Transport};

/// Pause between worker ticks when idle, to avoid busy-spinning.
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Instructions posted to the worker by channel handles.
#[derive(Debug)]
pub enum Instruction {
    /// Connect the socket for `kind` and report Running.
    Start {
        /// Channel to start.
        kind: ChannelKind,
        /// Routing identity for the transport connection.
        identity: Identity,
    },
    /// Close the socket for `kind`; status converges to Stopped.
    Stop {
        /// Channel to stop.
        kind: ChannelKind,
    },
    /// Send a message on `kind`'s socket. Fire-and-forget.
    Send {
        /// Channel to send on.
        kind: ChannelKind,
        /// Protocol message type.
        msg_type: String,
        /// Opaque content bytes.
        content: Vec<u8>,
    },
    /// Stop all channels and exit the worker thread.
    Shutdown,
}

/// Lifecycle status of an async channel, driven by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// No socket; the channel is down.
    Stopped,
    /// Start instruction accepted, socket connecting.
    Starting,
    /// Socket connected and polled for traffic.
    Running,
}

/// Per-channel state shared between the worker and its channel handle.
///
/// The queue lives here so it exists for the channel's full lifetime,
/// independent of status; the worker is its only producer.
pub(crate) struct ChannelShared {
    pub(crate) endpoint: String,
    pub(crate) queue: MessageQueue,
    status: Mutex<ChannelStatus>,
    status_changed: Condvar,
}

impl ChannelShared {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            queue: MessageQueue::new(),
            status: Mutex::new(ChannelStatus::Stopped),
            status_changed: Condvar::new(),
        }
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    fn set_status(&self, status: ChannelStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
        self.status_changed.notify_all();
    }

    /// Waits until the status reaches Running, or `timeout` elapses.
    ///
    /// Returns `true` if the channel came up in time. A connect failure sends
    /// the status back to Stopped, which keeps the wait going until the
    /// deadline; callers see that as a startup timeout.
    pub(crate) fn wait_running(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock().expect("status lock poisoned");
        while *status != ChannelStatus::Running {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, _) = self
                .status_changed
                .wait_timeout(status, remaining)
                .expect("status lock poisoned");
            status = guard;
        }
        true
    }
}

/// Clonable handle onto a running worker.
///
/// Channels hold one of these; it posts instructions and exposes whether the
/// worker thread is still attached.
#[derive(Clone)]
pub struct IoLoopHandle {
    instructions: mpsc::Sender<Instruction>,
    registry: Arc<Mutex<HashMap<ChannelKind, Arc<ChannelShared>>>>,
    running: Arc<AtomicBool>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl IoLoopHandle {
    /// Registers a channel of `kind` talking to `endpoint`.
    ///
    /// One channel per kind per worker; re-registering a kind replaces the
    /// previous registration.
    pub(crate) fn register(&self, kind: ChannelKind, endpoint: String) -> Arc<ChannelShared> {
        let shared = Arc::new(ChannelShared::new(endpoint));
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .insert(kind, Arc::clone(&shared));
        shared
    }

    /// Posts an instruction to the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoLoopClosed`] if the worker thread is gone.
    pub(crate) fn instruct(&self, instruction: Instruction) -> Result<()> {
        self.instructions
            .send(instruction)
            .map_err(|_| Error::IoLoopClosed)
    }

    /// Whether the worker thread is attached and running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Asks the worker to stop all channels and exit, then joins it.
    ///
    /// Idempotent; later calls are no-ops.
    pub fn shutdown(&self) {
        let _ = self.instructions.send(Instruction::Shutdown);
        let handle = self
            .thread
            .lock()
            .expect("thread lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// The worker: owns sockets, drains instructions, delivers arrivals.
pub struct IoLoop {
    transport: Arc<dyn Transport>,
    instructions: mpsc::Receiver<Instruction>,
    registry: Arc<Mutex<HashMap<ChannelKind, Arc<ChannelShared>>>>,
    sockets: HashMap<ChannelKind, (Arc<ChannelShared>, Box<dyn Socket>)>,
    running: Arc<AtomicBool>,
    shutdown: bool,
}

impl IoLoop {
    /// Spawns the worker thread over `transport` and returns a handle.
    #[must_use]
    pub fn spawn(transport: Arc<dyn Transport>) -> IoLoopHandle {
        let (tx, rx) = mpsc::channel();
        let registry = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let mut worker = Self {
            transport,
            instructions: rx,
            registry: Arc::clone(&registry),
            sockets: HashMap::new(),
            running: Arc::clone(&running),
            shutdown: false,
        };

        let thread = thread::Builder::new()
            .name("klink-ioloop".into())
            .spawn(move || worker.run())
            .expect("spawn ioloop thread");

        IoLoopHandle {
            instructions: tx,
            registry,
            running,
            thread: Arc::new(Mutex::new(Some(thread))),
        }
    }

    /// Worker event loop: drain instructions, poll sockets, repeat.
    fn run(&mut self) {
        info!("ioloop worker started");
        while !self.shutdown {
            self.drain_instructions();
            self.poll_sockets();
            thread::sleep(TICK_INTERVAL);
        }
        self.do_shutdown();
        self.running.store(false, Ordering::Release);
        info!("ioloop worker exited");
    }

    fn drain_instructions(&mut self) {
        loop {
            match self.instructions.try_recv() {
                Ok(Instruction::Start { kind, identity }) => self.handle_start(kind, &identity),
                Ok(Instruction::Stop { kind }) => self.handle_stop(kind),
                Ok(Instruction::Send {
                    kind,
                    msg_type,
                    content,
                }) => self.handle_send(kind, msg_type, content),
                Ok(Instruction::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => {
                    // All handles dropped counts as shutdown.
                    self.shutdown = true;
                    return;
                }
                Err(mpsc::TryRecvError::Empty) => return,
            }
        }
    }

    fn handle_start(&mut self, kind: ChannelKind, identity: &Identity) {
        let shared = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            registry.get(&kind).cloned()
        };
        let Some(shared) = shared else {
            warn!(kind = %kind, "start instruction for unregistered channel, dropping");
            return;
        };
        if self.sockets.contains_key(&kind) {
            debug!(kind = %kind, "channel already started");
            return;
        }

        shared.set_status(ChannelStatus::Starting);
        match self.transport.connect(kind, &shared.endpoint, identity) {
            Ok(mut socket) => {
                // Same transport-level rule as the sync variant: broadcast
                // sockets subscribe to everything up front.
                if kind == ChannelKind::IoPub
                    && let Err(e) = socket.subscribe_all()
                {
                    warn!(kind = %kind, error = %e, "subscribe-all failed");
                }
                info!(kind = %kind, endpoint = %shared.endpoint, "channel started");
                shared.set_status(ChannelStatus::Running);
                self.sockets.insert(kind, (shared, socket));
            }
            Err(e) => {
                warn!(kind = %kind, endpoint = %shared.endpoint, error = %e, "connect failed");
                shared.set_status(ChannelStatus::Stopped);
            }
        }
    }

    fn handle_stop(&mut self, kind: ChannelKind) {
        let Some((shared, mut socket)) = self.sockets.remove(&kind) else {
            return;
        };
        match socket.close(Linger::Graceful) {
            Ok(()) | Err(Error::SocketClosed) => {}
            Err(e) => warn!(kind = %kind, error = %e, "close failed"),
        }
        shared.set_status(ChannelStatus::Stopped);
        info!(kind = %kind, "channel stopped");
    }

    fn handle_send(&mut self, kind: ChannelKind, msg_type: String, content: Vec<u8>) {
        let Some((_, socket)) = self.sockets.get_mut(&kind) else {
            warn!(kind = %kind, msg_type = %msg_type, "send on stopped channel, dropping");
            return;
        };
        let wire = WireMessage::bare(Message::new(msg_type, content));
        if let Err(e) = socket.send(&wire) {
            warn!(kind = %kind, error = %e, "send failed, dropping");
        }
    }

    /// Drains every connected socket into its channel's queue.
    fn poll_sockets(&mut self) {
        for (kind, (shared, socket)) in &mut self.sockets {
            loop {
                match socket.try_recv() {
                    Ok(Some(wire)) => {
                        debug!(kind = %kind, msg_type = %wire.message.msg_type, "delivery");
                        shared.queue.push(wire.identities, wire.message);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "recv failed");
                        break;
                    }
                }
            }
        }
    }

    /// Graceful shutdown: close every socket and converge all statuses.
    fn do_shutdown(&mut self) {
        for (kind, (shared, mut socket)) in self.sockets.drain() {
            match socket.close(Linger::Graceful) {
                Ok(()) | Err(Error::SocketClosed) => {}
                Err(e) => warn!(kind = %kind, error = %e, "close failed during shutdown"),
            }
            shared.set_status(ChannelStatus::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::random_identity;
    use crate::transport::mem::{MemTransport, Responder};

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn start_connects_and_runs() {
        let transport = MemTransport::new();
        let handle = IoLoop::spawn(Arc::new(transport.clone()));
        let shared = handle.register(ChannelKind::Shell, "mem://shell".into());

        handle
            .instruct(Instruction::Start {
                kind: ChannelKind::Shell,
                identity: random_identity(),
            })
            .unwrap();

        assert!(shared.wait_running(Duration::from_millis(500)));
        assert_eq!(shared.status(), ChannelStatus::Running);
        assert_eq!(transport.connects("mem://shell"), 1);

        handle.shutdown();
        assert!(!handle.is_running());
        assert_eq!(shared.status(), ChannelStatus::Stopped);
    }

    #[test]
    fn failed_connect_converges_to_stopped() {
        let transport = MemTransport::new();
        transport.set_responder("mem://shell", Responder::Refuse);
        let handle = IoLoop::spawn(Arc::new(transport));
        let shared = handle.register(ChannelKind::Shell, "mem://shell".into());

        handle
            .instruct(Instruction::Start {
                kind: ChannelKind::Shell,
                identity: random_identity(),
            })
            .unwrap();

        assert!(!shared.wait_running(Duration::from_millis(200)));
        handle.shutdown();
    }

    #[test]
    fn inbound_traffic_lands_in_queue() {
        let transport = MemTransport::new();
        let handle = IoLoop::spawn(Arc::new(transport.clone()));
        let shared = handle.register(ChannelKind::IoPub, "mem://iopub".into());

        handle
            .instruct(Instruction::Start {
                kind: ChannelKind::IoPub,
                identity: random_identity(),
            })
            .unwrap();
        assert!(shared.wait_running(Duration::from_millis(500)));

        transport.inject(
            "mem://iopub",
            WireMessage::bare(Message::new("status", b"busy".to_vec())),
        );

        assert!(wait_for(|| !shared.queue.is_empty()));
        let (_, message) = shared.queue.try_pop().unwrap();
        assert_eq!(message.msg_type, "status");

        handle.shutdown();
    }

    #[test]
    fn send_goes_out_on_the_channel_socket() {
        let transport = MemTransport::new();
        transport.set_responder("mem://stdin", Responder::Silent);
        let handle = IoLoop::spawn(Arc::new(transport.clone()));
        let shared = handle.register(ChannelKind::Stdin, "mem://stdin".into());

        handle
            .instruct(Instruction::Start {
                kind: ChannelKind::Stdin,
                identity: random_identity(),
            })
            .unwrap();
        assert!(shared.wait_running(Duration::from_millis(500)));

        handle
            .instruct(Instruction::Send {
                kind: ChannelKind::Stdin,
                msg_type: "input_reply".into(),
                content: b"42".to_vec(),
            })
            .unwrap();

        assert!(wait_for(|| transport.sent_count("mem://stdin") == 1));
        assert_eq!(
            transport.last_sent("mem://stdin").unwrap().message.msg_type,
            "input_reply"
        );

        handle.shutdown();
    }

    #[test]
    fn dropping_every_handle_stops_the_worker() {
        let transport = MemTransport::new();
        let handle = IoLoop::spawn(Arc::new(transport));
        let running = handle.running.clone();
        drop(handle);

        let deadline = Instant::now() + Duration::from_secs(2);
        while running.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!running.load(Ordering::Acquire));
    }

    #[test]
    fn instruct_after_shutdown_is_ioloop_closed() {
        let transport = MemTransport::new();
        let handle = IoLoop::spawn(Arc::new(transport));
        handle.shutdown();

        let result = handle.instruct(Instruction::Stop {
            kind: ChannelKind::Shell,
        });
        assert!(matches!(result, Err(Error::IoLoopClosed)));
    }
}
