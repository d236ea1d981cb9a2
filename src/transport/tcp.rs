//! Stream transport over TCP.
use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{debug, info};

use crate::error::{ErrorNum, Result, RpcError};

use super::{Listener, Transport};

pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(addr: A, read_timeout: Option<Duration>) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream, read_timeout)
    }

    pub fn from_stream(stream: TcpStream, read_timeout: Option<Duration>) -> Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(read_timeout)?;
        Ok(Self {
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ErrorNum::Closed.into())
    }

    /// Convert an io failure, dropping the socket if it can no longer be used.
    fn fail(&mut self, e: io::Error) -> RpcError {
        let err: RpcError = e.into();
        if matches!(err.errnum, ErrorNum::Eof | ErrorNum::Io(_)) {
            debug!("tcp transport failed: {err}");
            self.close();
        }
        err
    }
}

impl Transport for TcpTransport {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let res = self.stream()?.read_exact(buf);
        res.map_err(|e| self.fail(e))
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let res = self.stream()?.write_all(buf);
        res.map_err(|e| self.fail(e))
    }

    fn readable(&mut self) -> Result<bool> {
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut peeked = [0u8; 1];
        let res = stream.peek(&mut peeked);
        stream.set_nonblocking(false)?;

        match res {
            // A zero-length peek means the peer hung up; the next read reports it.
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

pub struct TcpListenerTransport {
    listener: Option<TcpListener>,
    pending: Option<TcpStream>,
    read_timeout: Option<Duration>,
}

impl TcpListenerTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A, read_timeout: Option<Duration>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!("listening at {}", listener.local_addr()?);
        Ok(Self {
            listener: Some(listener),
            pending: None,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(ErrorNum::Closed.into()),
        }
    }

    fn listener(&self) -> Result<&TcpListener> {
        self.listener
            .as_ref()
            .ok_or_else(|| ErrorNum::Closed.into())
    }
}

impl Listener for TcpListenerTransport {
    fn accept(&mut self) -> Result<Box<dyn Transport>> {
        let stream = match self.pending.take() {
            Some(stream) => stream,
            None => {
                let (stream, peer) = self.listener()?.accept()?;
                info!("accepted connection from {peer}");
                stream
            }
        };
        Ok(Box::new(TcpTransport::from_stream(
            stream,
            self.read_timeout,
        )?))
    }

    fn readable(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }

        let listener = self.listener()?;
        listener.set_nonblocking(true)?;
        let res = listener.accept();
        listener.set_nonblocking(false)?;

        match res {
            Ok((stream, peer)) => {
                info!("accepted connection from {peer}");
                self.pending = Some(stream);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    fn close(&mut self) {
        self.pending = None;
        self.listener = None;
    }
}
