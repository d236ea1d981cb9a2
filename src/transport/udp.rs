//! Datagram transport: one UDP packet per message.
//!
//! Writes are buffered until the link switches to reading or stops, at which
//! point the buffered bytes leave as a single datagram. Reads consume the
//! most recently received datagram, pulling another one off the socket only
//! when the current one is exhausted.
use std::{
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use log::{debug, info, trace};

use crate::{
    config::RpcConfig,
    error::{ErrorNum, Result},
};

use super::{Listener, Mode, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Server,
    Client,
}

pub struct UdpTransport {
    socket: Option<UdpSocket>,
    state: State,
    peer: Option<SocketAddr>,
    max_packet: usize,
    inbound: Vec<u8>,
    cursor: usize,
    outbound: Vec<u8>,
}

impl UdpTransport {
    pub fn connect(addr: &str, config: &RpcConfig) -> Result<Self> {
        let target = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ErrorNum::Address(addr.to_string()))?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };

        let socket = UdpSocket::bind(local)?;
        socket.connect(target)?;
        socket.set_read_timeout(config.read_timeout)?;
        debug!("udp client bound to {} for {target}", socket.local_addr()?);

        Ok(Self::new(socket, State::Client, Some(target), config.max_packet))
    }

    fn new(socket: UdpSocket, state: State, peer: Option<SocketAddr>, max_packet: usize) -> Self {
        Self {
            socket: Some(socket),
            state,
            peer,
            max_packet,
            inbound: Vec::new(),
            cursor: 0,
            outbound: Vec::new(),
        }
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or_else(|| ErrorNum::Closed.into())
    }

    fn receive(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.max_packet];
        let len = match self.state {
            State::Client => self.socket()?.recv(&mut buf)?,
            State::Server => {
                let (len, from) = self.socket()?.recv_from(&mut buf)?;
                self.peer = Some(from);
                len
            }
        };
        if len == 0 {
            return Err(ErrorNum::NoData.into());
        }

        trace!("received datagram of {len} bytes");
        buf.truncate(len);
        self.inbound = buf;
        self.cursor = 0;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.outbound.is_empty() {
            return Ok(());
        }

        let message = std::mem::take(&mut self.outbound);
        let socket = self.socket()?;
        match (self.state, self.peer) {
            (State::Client, _) => socket.send(&message)?,
            (State::Server, Some(peer)) => socket.send_to(&message, peer)?,
            (State::Server, None) => {
                return Err(ErrorNum::Protocol("no peer to reply to".to_string()).into());
            }
        };
        trace!("sent datagram of {} bytes", message.len());
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.socket()?;
        let mut filled = 0;
        while filled < buf.len() {
            if self.cursor == self.inbound.len() {
                self.receive()?;
            }
            let n = (buf.len() - filled).min(self.inbound.len() - self.cursor);
            buf[filled..filled + n].copy_from_slice(&self.inbound[self.cursor..self.cursor + n]);
            self.cursor += n;
            filled += n;
        }
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.socket()?;
        if self.outbound.len() + buf.len() > self.max_packet {
            self.outbound.clear();
            return Err(ErrorNum::Protocol(format!(
                "message exceeds maximum packet size of {} bytes",
                self.max_packet
            ))
            .into());
        }
        self.outbound.extend_from_slice(buf);
        Ok(())
    }

    fn set_mode(&mut self, mode: Mode) -> Result<()> {
        match mode {
            Mode::Write => Ok(()),
            Mode::Read => self.flush(),
            Mode::Stop => {
                let res = self.flush();
                self.inbound.clear();
                self.cursor = 0;
                res
            }
        }
    }

    fn readable(&mut self) -> Result<bool> {
        if self.cursor < self.inbound.len() {
            return Ok(true);
        }

        let socket = self.socket()?;
        socket.set_nonblocking(true)?;
        let mut peeked = [0u8; 1];
        let res = socket.peek_from(&mut peeked);
        socket.set_nonblocking(false)?;

        match res {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn close(&mut self) {
        self.socket = None;
        self.inbound.clear();
        self.cursor = 0;
        self.outbound.clear();
    }

    fn is_stream(&self) -> bool {
        false
    }
}

/// Bound UDP socket; each accepted "connection" shares it and answers
/// whoever sent the last datagram.
pub struct UdpListener {
    socket: Option<UdpSocket>,
    max_packet: usize,
    read_timeout: Option<Duration>,
}

impl UdpListener {
    pub fn bind(addr: &str, config: &RpcConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        info!("listening for datagrams at {}", socket.local_addr()?);
        Ok(Self {
            socket: Some(socket),
            max_packet: config.max_packet,
            read_timeout: config.read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.socket {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(ErrorNum::Closed.into()),
        }
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or_else(|| ErrorNum::Closed.into())
    }
}

impl Listener for UdpListener {
    fn accept(&mut self) -> Result<Box<dyn Transport>> {
        let socket = self.socket()?.try_clone()?;
        socket.set_read_timeout(self.read_timeout)?;
        Ok(Box::new(UdpTransport::new(
            socket,
            State::Server,
            None,
            self.max_packet,
        )))
    }

    fn readable(&mut self) -> Result<bool> {
        let socket = self.socket()?;
        socket.set_nonblocking(true)?;
        let mut peeked = [0u8; 1];
        let res = socket.peek_from(&mut peeked);
        socket.set_nonblocking(false)?;

        match res {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn close(&mut self) {
        self.socket = None;
    }
}
