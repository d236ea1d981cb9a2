//! Runtime configuration shared by clients and servers.
use std::time::Duration;

/// Default datagram size for message-oriented transports.
pub const DEFAULT_MAX_PACKET: usize = 64 * 1024;

/// How an endpoint represents numbers, either locally or on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberFormat {
    /// Little-endian byte order.
    pub little: bool,
    /// Width of a number in bytes: 1, 2, 4 or 8.
    pub lnum_bytes: u8,
    /// Numbers are signed integers rather than IEEE floats.
    pub intnum: bool,
}

impl NumberFormat {
    /// The representation used by the embedded Lua 5.4 interpreter.
    pub fn native() -> Self {
        Self {
            little: cfg!(target_endian = "little"),
            lnum_bytes: size_of::<mlua::Number>() as u8,
            intnum: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self.lnum_bytes {
            1 | 2 => self.intnum,
            4 | 8 => true,
            _ => false,
        }
    }
}

impl Default for NumberFormat {
    fn default() -> Self {
        Self::native()
    }
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Number format this endpoint proposes during negotiation.
    pub local: NumberFormat,
    /// Exchange a `READY` status before every CALL, GET and NEWINDEX.
    /// Both peers must agree on this.
    pub helper_wait: bool,
    /// Largest datagram a message-oriented transport will send or receive.
    pub max_packet: usize,
    /// Optional deadline for blocking socket reads.
    pub read_timeout: Option<Duration>,
    /// Load function bytecode received from the peer. Off by default:
    /// malformed bytecode can corrupt the interpreter.
    pub allow_bytecode: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            local: NumberFormat::native(),
            helper_wait: false,
            max_packet: DEFAULT_MAX_PACKET,
            read_timeout: None,
            allow_bytecode: false,
        }
    }
}
