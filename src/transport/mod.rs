//! Byte-level transports the RPC layer runs on.
//!
//! A [`Transport`] is a bidirectional byte channel; a [`Listener`] produces
//! transports for incoming connections. The protocol only relies on the
//! primitives defined here, so any link that can move bytes in both
//! directions (sockets, serial lines, pipes) can carry it.
//!
//! # Modes
//!
//! Every logical exchange is bracketed by mode switches: [`Mode::Write`]
//! before sending, [`Mode::Read`] before receiving and [`Mode::Stop`] once
//! the exchange is complete. Stream transports ignore them; message-oriented
//! transports use them to decide when a buffered message is complete.
//!
//! # Transports
//!
//! - [`tcp`]: reliable stream over TCP.
//! - [`udp`]: one datagram per message.
//! - [`memory`]: scripted in-process transport.
use std::str::FromStr;

use crate::{
    config::RpcConfig,
    error::{ErrorNum, Result, RpcError},
};

pub mod memory;
pub mod tcp;
pub mod udp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    Stop,
}

pub trait Transport {
    /// Fill `buf` completely, or fail with [`ErrorNum::Eof`] / [`ErrorNum::NoData`].
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf`.
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;

    /// Hint that the link is switching direction or finishing an exchange.
    fn set_mode(&mut self, _mode: Mode) -> Result<()> {
        Ok(())
    }

    /// Whether a read would make progress without blocking.
    fn readable(&mut self) -> Result<bool>;

    fn is_open(&self) -> bool;

    fn close(&mut self);

    /// `false` for transports where each message is a complete frame.
    fn is_stream(&self) -> bool {
        true
    }
}

pub trait Listener {
    /// Wait for the next connection.
    fn accept(&mut self) -> Result<Box<dyn Transport>>;

    /// Whether a connection is waiting to be accepted.
    fn readable(&mut self) -> Result<bool>;

    fn is_open(&self) -> bool;

    fn close(&mut self);
}

/// Identifies where to connect or listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddr {
    Tcp(String),
    Udp(String),
}

impl TransportAddr {
    pub fn from_parts(host: &str, port: u16) -> Self {
        if host.contains(':') {
            Self::Tcp(format!("[{host}]:{port}"))
        } else {
            Self::Tcp(format!("{host}:{port}"))
        }
    }

    pub fn connect(&self, config: &RpcConfig) -> Result<Box<dyn Transport>> {
        match self {
            Self::Tcp(addr) => Ok(Box::new(tcp::TcpTransport::connect(
                addr.as_str(),
                config.read_timeout,
            )?)),
            Self::Udp(addr) => Ok(Box::new(udp::UdpTransport::connect(addr, config)?)),
        }
    }

    pub fn listen(&self, config: &RpcConfig) -> Result<Box<dyn Listener>> {
        match self {
            Self::Tcp(addr) => Ok(Box::new(tcp::TcpListenerTransport::bind(
                addr.as_str(),
                config.read_timeout,
            )?)),
            Self::Udp(addr) => Ok(Box::new(udp::UdpListener::bind(addr, config)?)),
        }
    }
}

impl FromStr for TransportAddr {
    type Err = RpcError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, udp) = match s.trim() {
            s if s.starts_with("udp://") => (&s["udp://".len()..], true),
            s if s.starts_with("tcp://") => (&s["tcp://".len()..], false),
            s => (s, false),
        };

        if addr.is_empty() || !addr.contains(':') {
            return Err(ErrorNum::Address(s.to_string()).into());
        }

        Ok(if udp {
            Self::Udp(addr.to_string())
        } else {
            Self::Tcp(addr.to_string())
        })
    }
}
