//! Connected-UDP transport: one datagram carries one postcard-encoded
//! [`WireMessage`].
//!
//! Sockets are non-blocking mio sockets; blocking `send`/`recv` are built on
//! a per-socket [`Poll`] so a sync channel can park its own thread without
//! spinning.
//!
//! [`Poll`]: mio::Poll

use std::io::ErrorKind;
use std::net::SocketAddr;

use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};

use crate::channel::ChannelKind;
use crate::error::{Error, Result};
use crate::message::{Identity, WireMessage};
use crate::trace::debug;
use crate::transport::{Linger, Socket, Transport};

/// Largest datagram we accept (UDP payload ceiling).
const MAX_DATAGRAM: usize = 65535;

const SOCKET_TOKEN: Token = Token(0);

/// UDP transport: each `connect` binds an ephemeral local socket and
/// connects it to the kernel endpoint, so replies are filtered by peer.
#[derive(Debug, Default)]
pub struct UdpTransport;

impl UdpTransport {
    /// Creates the transport.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Transport for UdpTransport {
    fn connect(
        &self,
        kind: ChannelKind,
        endpoint: &str,
        _identity: &Identity,
    ) -> Result<Box<dyn Socket>> {
        let peer: SocketAddr = endpoint.parse().map_err(|_| Error::Transport {
            message: format!("invalid endpoint address: {endpoint}"),
        })?;

        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().expect("static addr is valid")
        } else {
            "[::]:0".parse().expect("static addr is valid")
        };

        let mut socket = MioUdpSocket::bind(bind_addr)?;
        socket.connect(peer)?;

        let poll = Poll::new()?;
        poll.registry().register(
            &mut socket,
            SOCKET_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        debug!(kind = %kind, endpoint = %endpoint, "udp socket connected");

        Ok(Box::new(UdpChannelSocket {
            socket: Some(socket),
            poll,
            events: Events::with_capacity(4),
            recv_buf: vec![0u8; MAX_DATAGRAM],
        }))
    }
}

struct UdpChannelSocket {
    /// `None` once closed.
    socket: Option<MioUdpSocket>,
    poll: Poll,
    events: Events,
    recv_buf: Vec<u8>,
}

impl UdpChannelSocket {
    fn socket(&self) -> Result<&MioUdpSocket> {
        self.socket.as_ref().ok_or(Error::SocketClosed)
    }

    /// Blocks on the poller until the socket reports readiness.
    fn wait_ready(&mut self) -> Result<()> {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Socket for UdpChannelSocket {
    fn send(&mut self, wire: &WireMessage) -> Result<()> {
        let payload = wire.encode()?;
        loop {
            match self.socket()?.send(&payload) {
                Ok(_) => return Ok(()),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => self.wait_ready()?,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn recv(&mut self) -> Result<WireMessage> {
        loop {
            if let Some(wire) = self.try_recv()? {
                return Ok(wire);
            }
            self.wait_ready()?;
        }
    }

    fn try_recv(&mut self) -> Result<Option<WireMessage>> {
        loop {
            // Split borrow: recv into the owned buffer without holding &self.
            let result = match &self.socket {
                Some(socket) => socket.recv(&mut self.recv_buf),
                None => return Err(Error::SocketClosed),
            };
            match result {
                Ok(len) => return Ok(Some(WireMessage::decode(&self.recv_buf[..len])?)),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn subscribe_all(&mut self) -> Result<()> {
        // Datagram fan-out is sender-side; there is no subscription filter
        // to clear on a connected UDP socket.
        self.socket().map(|_| ())
    }

    fn close(&mut self, _linger: Linger) -> Result<()> {
        // UDP has no linger semantics: dropping the socket discards
        // everything immediately either way.
        let Some(mut socket) = self.socket.take() else {
            return Err(Error::SocketClosed);
        };
        self.poll.registry().deregister(&mut socket)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, random_identity};
    use std::net::UdpSocket as StdUdpSocket;
    use std::time::Duration;

    fn bind_kernel_side() -> (StdUdpSocket, String) {
        let socket = StdUdpSocket::bind("127.0.0.1:0").expect("bind ephemeral");
        let endpoint = socket.local_addr().expect("local addr").to_string();
        (socket, endpoint)
    }

    fn connect(endpoint: &str) -> Box<dyn Socket> {
        UdpTransport::new()
            .connect(ChannelKind::Shell, endpoint, &random_identity())
            .expect("connect")
    }

    #[test]
    fn send_recv_loopback() {
        let (kernel, endpoint) = bind_kernel_side();
        let mut socket = connect(&endpoint);

        let request = WireMessage::bare(Message::new("kernel_info_request", Vec::new()));
        socket.send(&request).unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = kernel.recv_from(&mut buf).unwrap();
        let received = WireMessage::decode(&buf[..len]).unwrap();
        assert_eq!(received, request);

        // Echo a reply back to the channel socket.
        let reply = WireMessage::bare(Message::new("kernel_info_reply", b"ok".to_vec()));
        kernel.send_to(&reply.encode().unwrap(), from).unwrap();

        assert_eq!(socket.recv().unwrap(), reply);
    }

    #[test]
    fn try_recv_empty_is_none() {
        let (_kernel, endpoint) = bind_kernel_side();
        let mut socket = connect(&endpoint);
        assert!(socket.try_recv().unwrap().is_none());
    }

    #[test]
    fn try_recv_sees_reply_without_blocking() {
        let (kernel, endpoint) = bind_kernel_side();
        let mut socket = connect(&endpoint);

        socket
            .send(&WireMessage::bare(Message::new("ping", Vec::new())))
            .unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = kernel.recv_from(&mut buf).unwrap();
        kernel.send_to(&buf[..len], from).unwrap();

        // Give the datagram a moment to land.
        let mut reply = None;
        for _ in 0..100 {
            if let Some(wire) = socket.try_recv().unwrap() {
                reply = Some(wire);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(reply.unwrap().message.msg_type, "ping");
    }

    #[test]
    fn double_close_reports_already_closed() {
        let (_kernel, endpoint) = bind_kernel_side();
        let mut socket = connect(&endpoint);

        socket.close(Linger::Graceful).unwrap();
        assert!(matches!(
            socket.close(Linger::Immediate),
            Err(Error::SocketClosed)
        ));
    }

    #[test]
    fn invalid_endpoint_rejected() {
        let result =
            UdpTransport::new().connect(ChannelKind::Control, "not-an-addr", &random_identity());
        assert!(matches!(result, Err(Error::Transport { .. })));
    }
}
