//! Session handshake.
//!
//! The client proposes its number format in an eight byte header:
//!
//! ```text
//! 'L' 'R' 'P' 'C' <version> <little> <lnum_bytes> <intnum>
//! ```
//!
//! The server reconciles it with its own (big-endian unless both sides are
//! little-endian, the narrower width, integers if either side uses them)
//! and echoes the result, which both peers then commit to their link.
use bincode::{Decode, Encode, decode_from_slice, encode_to_vec};
use log::debug;

use crate::{
    config::NumberFormat,
    error::{ErrorNum, Result},
};

use super::{PROTOCOL_VERSION, link::Link};

pub const MAGIC: [u8; 4] = *b"LRPC";
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u8,
    pub little: bool,
    pub lnum_bytes: u8,
    pub intnum: bool,
}

impl Header {
    pub fn new(format: NumberFormat) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            little: format.little,
            lnum_bytes: format.lnum_bytes,
            intnum: format.intnum,
        }
    }

    pub fn format(&self) -> NumberFormat {
        NumberFormat {
            little: self.little,
            lnum_bytes: self.lnum_bytes,
            intnum: self.intnum,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard().with_fixed_int_encoding();
        Ok(encode_to_vec(*self, config)?)
    }

    /// Parse and check magic and version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config = bincode::config::standard().with_fixed_int_encoding();
        let (header, _): (Header, usize) =
            decode_from_slice(bytes, config).map_err(|_| ErrorNum::Header)?;

        if header.magic != MAGIC || header.version != PROTOCOL_VERSION {
            debug!("rejected header {bytes:?}");
            return Err(ErrorNum::Header.into());
        }
        Ok(header)
    }
}

/// The format both peers use after the handshake.
pub fn reconcile(client: NumberFormat, server: NumberFormat) -> NumberFormat {
    NumberFormat {
        little: client.little && server.little,
        lnum_bytes: client.lnum_bytes.min(server.lnum_bytes),
        intnum: client.intnum || server.intnum,
    }
}

/// Send our proposal and commit whatever the server settles on. The caller
/// writes the preceding [`Command::Con`](super::Command::Con).
pub fn client_negotiate(link: &mut Link) -> Result<()> {
    let proposal = Header::new(link.local());
    link.write_bytes(&proposal.to_bytes()?)?;

    let reply = Header::from_bytes(&link.read_bytes(HEADER_SIZE)?)?;
    let net = reply.format();
    if !net.is_valid() {
        return Err(ErrorNum::Header.into());
    }

    link.commit(net);
    Ok(())
}

/// Answer a client proposal; the command byte has already been consumed.
pub fn server_negotiate(link: &mut Link) -> Result<()> {
    let local = link.local();
    link.commit(local);

    let request = Header::from_bytes(&link.read_bytes(HEADER_SIZE)?)?;
    let net = reconcile(request.format(), local);
    if !net.is_valid() {
        return Err(ErrorNum::Header.into());
    }

    link.write_bytes(&Header::new(net).to_bytes()?)?;
    link.commit(net);
    Ok(())
}
