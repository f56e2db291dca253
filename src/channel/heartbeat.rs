//! Heartbeat channel: recurring liveness probe with reconnect-on-miss.
//!
//! A monitor thread owns the probe socket and fires once per period. Each
//! firing first judges the previous probe — a reply means the kernel is
//! beating, silence means it is not and the socket is torn down with no
//! linger and reconnected — then sends the next probe unless paused.
//!
//! The channel starts paused and optimistically beating: no probe goes out
//! until [`HeartbeatChannel::unpause`], and `is_beating` reports `true` until
//! a probe actually goes unanswered.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use crate::channel::{Channel, ChannelKind};
use crate::error::{Error, Result};
use crate::message::{Identity, Message, WireMessage};
use crate::trace::{debug, info, warn};
use crate::transport::{Linger, Socket, Transport};

/// Default probe period: a kernel silent for this long is considered dead.
pub const DEFAULT_TIME_TO_DEAD: Duration = Duration::from_secs(1);

/// State shared between the channel handle and the monitor thread.
struct Flags {
    /// Did the last judged probe get a reply.
    beating: AtomicBool,
    /// Probe emission suppressed; the timer keeps firing.
    paused: AtomicBool,
    /// Monitor exit request.
    stop: AtomicBool,
    /// Monitor thread is running.
    active: AtomicBool,
    /// Wake the monitor before its deadline (unpause wants a prompt probe).
    nudge: AtomicBool,
    /// Successful reconnects after a missed probe.
    reconnects: AtomicUsize,
    wakeup: Mutex<()>,
    wakeup_changed: Condvar,
}

impl Flags {
    fn new() -> Self {
        Self {
            beating: AtomicBool::new(true),
            paused: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            active: AtomicBool::new(false),
            nudge: AtomicBool::new(false),
            reconnects: AtomicUsize::new(0),
            wakeup: Mutex::new(()),
            wakeup_changed: Condvar::new(),
        }
    }

    fn wake(&self) {
        // Hold the lock across the notify so a monitor that just checked its
        // flags cannot miss the wakeup.
        let _guard = self.wakeup.lock().expect("wakeup lock poisoned");
        self.wakeup_changed.notify_all();
    }

    /// Sleeps until the period elapses, a stop arrives, or — when no probe
    /// is awaiting judgement — a nudge arrives.
    fn wait_period(&self, period: Duration, probe_pending: bool) {
        let deadline = Instant::now() + period;
        let mut guard = self.wakeup.lock().expect("wakeup lock poisoned");
        loop {
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            // A nudge during a pending probe must not shorten the judgement
            // window, or silence would be misread as a miss.
            if self.nudge.swap(false, Ordering::AcqRel) && !probe_pending {
                return;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return;
            };
            let (g, _) = self
                .wakeup_changed
                .wait_timeout(guard, remaining)
                .expect("wakeup lock poisoned");
            guard = g;
        }
    }
}

/// The liveness channel. Fixed to [`ChannelKind::Heartbeat`] traffic.
pub struct HeartbeatChannel {
    endpoint: String,
    transport: Arc<dyn Transport>,
    time_to_dead: Duration,
    flags: Arc<Flags>,
    monitor: Option<JoinHandle<()>>,
}

impl HeartbeatChannel {
    /// Creates a stopped heartbeat channel with probe period `time_to_dead`.
    pub fn new(
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        time_to_dead: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            time_to_dead,
            flags: Arc::new(Flags::new()),
            monitor: None,
        }
    }

    /// Whether the last judged probe got a reply. Optimistically `true`
    /// until a probe actually goes unanswered.
    ///
    /// # Errors
    ///
    /// [`Error::NotAlive`] if the channel is stopped.
    pub fn is_beating(&self) -> Result<bool> {
        self.ensure_alive()?;
        Ok(self.flags.beating.load(Ordering::Acquire))
    }

    /// Suppresses probe emission. The timer keeps firing, so liveness and
    /// the beating verdict are unchanged.
    ///
    /// # Errors
    ///
    /// [`Error::NotAlive`] if the channel is stopped.
    pub fn pause(&self) -> Result<()> {
        self.ensure_alive()?;
        self.flags.paused.store(true, Ordering::Release);
        Ok(())
    }

    /// Resumes probing. The next probe goes out promptly, not at the next
    /// scheduled firing.
    ///
    /// # Errors
    ///
    /// [`Error::NotAlive`] if the channel is stopped.
    pub fn unpause(&self) -> Result<()> {
        self.ensure_alive()?;
        self.flags.paused.store(false, Ordering::Release);
        self.flags.nudge.store(true, Ordering::Release);
        self.flags.wake();
        Ok(())
    }

    /// Number of reconnects performed after missed probes since start.
    #[must_use]
    pub fn reconnects(&self) -> usize {
        self.flags.reconnects.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(Error::NotAlive)
        }
    }
}

impl Channel for HeartbeatChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Heartbeat
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn start(&mut self, identity: &Identity) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }

        let socket =
            self.transport
                .connect(ChannelKind::Heartbeat, &self.endpoint, identity)?;

        self.flags.beating.store(true, Ordering::Release);
        self.flags.paused.store(true, Ordering::Release);
        self.flags.stop.store(false, Ordering::Release);
        self.flags.nudge.store(false, Ordering::Release);
        self.flags.reconnects.store(0, Ordering::Release);
        self.flags.active.store(true, Ordering::Release);

        let monitor = Monitor {
            endpoint: self.endpoint.clone(),
            transport: Arc::clone(&self.transport),
            identity: identity.clone(),
            time_to_dead: self.time_to_dead,
            flags: Arc::clone(&self.flags),
        };
        let handle = thread::Builder::new()
            .name("klink-heartbeat".into())
            .spawn(move || monitor.run(socket))?;

        info!(endpoint = %self.endpoint, "heartbeat started");
        self.monitor = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(monitor) = self.monitor.take() else {
            return Ok(());
        };
        self.flags.stop.store(true, Ordering::Release);
        self.flags.wake();
        let _ = monitor.join();
        info!(endpoint = %self.endpoint, "heartbeat stopped");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.monitor.is_some() && self.flags.active.load(Ordering::Acquire)
    }
}

impl Drop for HeartbeatChannel {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// The monitor thread body: owns the probe socket for its whole life.
struct Monitor {
    endpoint: String,
    transport: Arc<dyn Transport>,
    identity: Identity,
    time_to_dead: Duration,
    flags: Arc<Flags>,
}

impl Monitor {
    fn run(self, socket: Box<dyn Socket>) {
        let mut socket = Some(socket);
        let mut probe_pending = false;

        while !self.flags.stop.load(Ordering::Acquire) {
            if probe_pending {
                probe_pending = false;
                socket = self.judge_probe(socket);
            }

            if socket.is_none() {
                socket = self.reconnect();
            }

            if !self.flags.paused.load(Ordering::Acquire)
                && let Some(sock) = socket.as_mut()
            {
                let probe = WireMessage::bare(Message::new("ping", Vec::new()));
                match sock.send(&probe) {
                    Ok(()) => {
                        debug!(endpoint = %self.endpoint, "probe sent");
                        probe_pending = true;
                    }
                    Err(e) => warn!(endpoint = %self.endpoint, error = %e, "probe send failed"),
                }
            }

            self.flags.wait_period(self.time_to_dead, probe_pending);
        }

        if let Some(mut sock) = socket {
            let _ = sock.close(Linger::Immediate);
        }
        self.flags.active.store(false, Ordering::Release);
    }

    /// Decides whether the previous probe was answered. Any inbound traffic
    /// counts as a reply. Silence is a miss: the socket is closed with no
    /// linger and dropped for reconnection.
    fn judge_probe(&self, socket: Option<Box<dyn Socket>>) -> Option<Box<dyn Socket>> {
        let mut sock = socket?;
        match sock.try_recv() {
            Ok(Some(_)) => {
                self.flags.beating.store(true, Ordering::Release);
                Some(sock)
            }
            Ok(None) => {
                warn!(endpoint = %self.endpoint, "probe unanswered, kernel presumed dead");
                self.flags.beating.store(false, Ordering::Release);
                match sock.close(Linger::Immediate) {
                    Ok(()) | Err(Error::SocketClosed) => {}
                    Err(e) => warn!(endpoint = %self.endpoint, error = %e, "close failed"),
                }
                None
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "probe recv failed");
                Some(sock)
            }
        }
    }

    fn reconnect(&self) -> Option<Box<dyn Socket>> {
        match self
            .transport
            .connect(ChannelKind::Heartbeat, &self.endpoint, &self.identity)
        {
            Ok(sock) => {
                self.flags.reconnects.fetch_add(1, Ordering::AcqRel);
                info!(endpoint = %self.endpoint, "heartbeat reconnected");
                Some(sock)
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "reconnect failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    use crate::message::random_identity;
    use crate::transport::mem::{MemTransport, Responder};

    const FAST: Duration = Duration::from_millis(25);

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

    fn heartbeat(transport: &MemTransport, period: Duration) -> HeartbeatChannel {
        HeartbeatChannel::new("mem://hb", Arc::new(transport.clone()), period)
    }

    #[test]
    #[serial]
    fn starts_paused_and_optimistically_beating() {
        let transport = MemTransport::new();
        transport.set_responder("mem://hb", Responder::Silent);
        let mut channel = heartbeat(&transport, FAST);

        channel.start(&random_identity()).unwrap();
        assert!(channel.is_alive());
        assert!(channel.is_beating().unwrap());

        thread::sleep(FAST * 4);
        // Paused: the timer fires but nothing goes out.
        assert_eq!(transport.sent_count("mem://hb"), 0);
        assert!(channel.is_beating().unwrap());

        channel.stop().unwrap();
    }

    #[test]
    #[serial]
    fn unpause_probes_promptly() {
        let transport = MemTransport::new();
        transport.set_responder("mem://hb", Responder::Silent);
        // Long period: only the unpause nudge can explain a prompt probe.
        let mut channel = heartbeat(&transport, Duration::from_secs(30));

        channel.start(&random_identity()).unwrap();
        channel.unpause().unwrap();

        assert!(wait_for(|| transport.sent_count("mem://hb") >= 1));
        assert_eq!(
            transport.last_sent("mem://hb").unwrap().message.msg_type,
            "ping"
        );

        channel.stop().unwrap();
    }

    #[test]
    #[serial]
    fn reply_keeps_beating_without_reconnect() {
        let transport = MemTransport::new();
        let mut channel = heartbeat(&transport, FAST);

        channel.start(&random_identity()).unwrap();
        channel.unpause().unwrap();

        // Several full probe cycles against an echoing kernel.
        thread::sleep(FAST * 8);
        assert!(channel.is_beating().unwrap());
        assert_eq!(channel.reconnects(), 0);
        assert_eq!(transport.connects("mem://hb"), 1);

        channel.stop().unwrap();
    }

    #[test]
    #[serial]
    fn missed_probe_reconnects_and_clears_beating() {
        let transport = MemTransport::new();
        transport.set_responder("mem://hb", Responder::Silent);
        let mut channel = heartbeat(&transport, FAST);

        channel.start(&random_identity()).unwrap();
        channel.unpause().unwrap();

        assert!(wait_for(|| channel.reconnects() >= 1));
        assert!(!channel.is_beating().unwrap());
        // A dead kernel stops the beating verdict, not the channel.
        assert!(channel.is_alive());
        assert!(transport.connects("mem://hb") >= 2);

        channel.stop().unwrap();
    }

    #[test]
    #[serial]
    fn pause_suppresses_probes_but_keeps_timer() {
        let transport = MemTransport::new();
        let mut channel = heartbeat(&transport, FAST);

        channel.start(&random_identity()).unwrap();
        channel.unpause().unwrap();
        assert!(wait_for(|| transport.sent_count("mem://hb") >= 1));

        channel.pause().unwrap();
        // Let any in-flight firing finish before snapshotting.
        thread::sleep(FAST * 3);
        let snapshot = transport.sent_count("mem://hb");
        thread::sleep(FAST * 4);
        assert_eq!(transport.sent_count("mem://hb"), snapshot);
        assert!(channel.is_alive());

        channel.stop().unwrap();
    }

    #[test]
    fn stopped_channel_rejects_probe_controls() {
        let transport = MemTransport::new();
        let mut channel = heartbeat(&transport, FAST);

        assert!(matches!(channel.is_beating(), Err(Error::NotAlive)));
        assert!(matches!(channel.pause(), Err(Error::NotAlive)));
        assert!(matches!(channel.unpause(), Err(Error::NotAlive)));

        channel.start(&random_identity()).unwrap();
        channel.stop().unwrap();
        assert!(!channel.is_alive());
        assert!(matches!(channel.is_beating(), Err(Error::NotAlive)));
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let transport = MemTransport::new();
        let mut channel = heartbeat(&transport, FAST);
        let identity = random_identity();

        channel.start(&identity).unwrap();
        channel.start(&identity).unwrap();
        assert_eq!(transport.connects("mem://hb"), 1);

        channel.stop().unwrap();
        channel.stop().unwrap();
        assert!(!channel.is_alive());
    }

    #[test]
    fn refused_connect_propagates_from_start() {
        let transport = MemTransport::new();
        transport.set_responder("mem://hb", Responder::Refuse);
        let mut channel = heartbeat(&transport, FAST);

        assert!(channel.start(&random_identity()).is_err());
        assert!(!channel.is_alive());
    }
}
