//! Negotiated link state and fixed-width wire primitives.
//!
//! A [`Link`] owns a [`Transport`] together with the number format agreed
//! during negotiation. All primitive reads switch the transport to
//! [`Mode::Read`] and all writes to [`Mode::Write`] before touching it;
//! [`Link::exchange`] adds the closing [`Mode::Stop`] on every exit path.
//!
//! Fixed-width values are encoded with `bincode` using fixed integer
//! encoding in the negotiated byte order.
use bincode::{Decode, Encode, decode_from_slice, encode_to_vec};
use log::{debug, info};

use crate::{
    config::NumberFormat,
    error::{ErrorNum, Result},
    transport::{Mode, Transport},
};

/// Largest piece of a length-prefixed string read at once.
const READ_CHUNK: usize = 64 * 1024;

/// A number as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireNumber {
    Integer(i64),
    Float(f64),
}

impl WireNumber {
    pub fn as_integer(&self) -> i64 {
        match *self {
            WireNumber::Integer(i) => i,
            WireNumber::Float(f) => f as i64,
        }
    }

    pub fn as_float(&self) -> f64 {
        match *self {
            WireNumber::Integer(i) => i as f64,
            WireNumber::Float(f) => f,
        }
    }
}

pub struct Link {
    tpt: Box<dyn Transport>,
    mode: Mode,
    local: NumberFormat,
    net: NumberFormat,
    staging: Option<Vec<u8>>,
    allow_bytecode: bool,
}

impl Link {
    /// Until negotiation completes the wire format is the local one.
    pub fn new(tpt: Box<dyn Transport>, local: NumberFormat) -> Self {
        Self {
            tpt,
            mode: Mode::Stop,
            local,
            net: local,
            staging: None,
            allow_bytecode: false,
        }
    }

    pub fn set_allow_bytecode(&mut self, allow: bool) {
        self.allow_bytecode = allow;
    }

    pub fn allows_bytecode(&self) -> bool {
        self.allow_bytecode
    }

    pub fn local(&self) -> NumberFormat {
        self.local
    }

    pub fn net(&self) -> NumberFormat {
        self.net
    }

    pub(crate) fn commit(&mut self, net: NumberFormat) {
        info!(
            "link format: little={} lnum_bytes={} intnum={}",
            net.little, net.lnum_bytes, net.intnum
        );
        self.net = net;
    }

    pub fn is_open(&self) -> bool {
        self.tpt.is_open()
    }

    pub fn readable(&mut self) -> Result<bool> {
        if !self.is_open() {
            return Err(ErrorNum::Closed.into());
        }
        self.tpt.readable()
    }

    pub fn close(&mut self) {
        self.staging = None;
        self.mode = Mode::Stop;
        self.tpt.close();
    }

    fn enter(&mut self, mode: Mode) -> Result<()> {
        if !self.tpt.is_open() {
            return Err(ErrorNum::Closed.into());
        }
        if self.mode != mode {
            self.tpt.set_mode(mode)?;
            self.mode = mode;
        }
        Ok(())
    }

    /// End the current exchange.
    pub fn stop(&mut self) -> Result<()> {
        if self.mode == Mode::Stop {
            return Ok(());
        }
        self.mode = Mode::Stop;
        if !self.tpt.is_open() {
            return Ok(());
        }
        self.tpt.set_mode(Mode::Stop)
    }

    /// Run one logical exchange, stopping the transport however it ends.
    pub fn exchange<T>(&mut self, f: impl FnOnce(&mut Link) -> Result<T>) -> Result<T> {
        let mut link = scopeguard::guard(self, |link| {
            if let Err(e) = link.stop() {
                debug!("failed to stop transport: {e}");
            }
        });
        f(&mut **link)
    }

    /// Collect everything `f` writes and send it only if `f` succeeds, so a
    /// value that cannot be marshalled never leaves a half-written frame.
    /// `f` must not read.
    pub fn staged<T>(&mut self, f: impl FnOnce(&mut Link) -> Result<T>) -> Result<T> {
        if self.staging.is_some() {
            return f(self);
        }

        self.staging = Some(Vec::new());
        let res = f(self);
        let frame = self.staging.take().unwrap_or_default();
        let value = res?;
        self.write_raw(&frame)?;
        Ok(value)
    }

    /// Collect everything `f` writes without sending any of it. `f` must not
    /// read.
    pub fn buffered(&mut self, f: impl FnOnce(&mut Link) -> Result<()>) -> Result<Vec<u8>> {
        let outer = self.staging.replace(Vec::new());
        let res = f(self);
        let frame = std::mem::replace(&mut self.staging, outer).unwrap_or_default();
        res.map(|()| frame)
    }

    /// Send a frame collected by [`Link::buffered`].
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.enter(Mode::Write)?;
        self.write_raw(frame)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.staging {
            Some(frame) => {
                frame.extend_from_slice(bytes);
                Ok(())
            }
            None => self.tpt.write_bytes(bytes),
        }
    }

    /// The length usually comes from the peer, so the buffer grows with the
    /// data actually received.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.enter(Mode::Read)?;
        let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
        while buf.len() < len {
            let start = buf.len();
            buf.resize(start + (len - start).min(READ_CHUNK), 0);
            self.tpt.read_bytes(&mut buf[start..])?;
        }
        Ok(buf)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.enter(Mode::Write)?;
        self.write_raw(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.enter(Mode::Read)?;
        let mut buf = [0u8; 1];
        self.tpt.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn write_u8(&mut self, x: u8) -> Result<()> {
        self.write_bytes(&[x])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.decode(4)
    }

    pub fn write_u32(&mut self, x: u32) -> Result<()> {
        let bytes = self.encode(x)?;
        self.write_bytes(&bytes)
    }

    /// `u32` length followed by the raw bytes.
    pub fn read_string(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    pub fn write_string(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| ErrorNum::Protocol(format!("string of {} bytes", bytes.len())))?;
        self.write_u32(len)?;
        self.write_bytes(bytes)
    }

    pub fn read_number(&mut self) -> Result<WireNumber> {
        let width = self.net.lnum_bytes as usize;
        let number = match (self.net.intnum, width) {
            (true, 1) => WireNumber::Integer(self.decode::<i8>(width)? as i64),
            (true, 2) => WireNumber::Integer(self.decode::<i16>(width)? as i64),
            (true, 4) => WireNumber::Integer(self.decode::<i32>(width)? as i64),
            (true, 8) => WireNumber::Integer(self.decode::<i64>(width)?),
            (false, 4) => WireNumber::Float(self.decode::<f32>(width)? as f64),
            (false, 8) => WireNumber::Float(self.decode::<f64>(width)?),
            _ => return Err(self.bad_width()),
        };
        Ok(number)
    }

    pub fn write_number(&mut self, number: WireNumber) -> Result<()> {
        let bytes = match (self.net.intnum, self.net.lnum_bytes) {
            (true, 1) => self.encode(number.as_integer() as i8)?,
            (true, 2) => self.encode(number.as_integer() as i16)?,
            (true, 4) => self.encode(number.as_integer() as i32)?,
            (true, 8) => self.encode(number.as_integer())?,
            (false, 4) => self.encode(number.as_float() as f32)?,
            (false, 8) => self.encode(number.as_float())?,
            _ => return Err(self.bad_width()),
        };
        self.write_bytes(&bytes)
    }

    fn bad_width(&self) -> crate::error::RpcError {
        ErrorNum::Protocol(format!(
            "unsupported number format: {} bytes, intnum={}",
            self.net.lnum_bytes, self.net.intnum
        ))
        .into()
    }

    fn encode<E: Encode>(&self, value: E) -> Result<Vec<u8>> {
        let config = bincode::config::standard().with_fixed_int_encoding();
        let bytes = if self.net.little {
            encode_to_vec(value, config.with_little_endian())?
        } else {
            encode_to_vec(value, config.with_big_endian())?
        };
        Ok(bytes)
    }

    fn decode<D: Decode<()>>(&mut self, len: usize) -> Result<D> {
        let bytes = self.read_bytes(len)?;
        let config = bincode::config::standard().with_fixed_int_encoding();
        let (value, _) = if self.net.little {
            decode_from_slice(&bytes, config.with_little_endian())?
        } else {
            decode_from_slice(&bytes, config.with_big_endian())?
        };
        Ok(value)
    }
}
