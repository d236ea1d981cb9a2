//! Lua-RPC wire protocol.
//!
//! This module defines how a client manipulates the global namespace of a
//! remote Lua interpreter: the session header, the command frames, and the
//! tagged encoding of dynamically typed Lua values.
//!
//! # Overview
//!
//! A session starts with a [`Command::Con`] followed by an eight byte
//! header in which both peers agree on byte order, number width and whether
//! numbers travel as integers or floats (see [`negotiate`]). After that the
//! client drives strictly synchronous request/response exchanges:
//!
//! ```text
//! CALL    : u8=1, <path>, u32 nargs, nargs x <value>
//! GET     : u8=2, <path>
//! CON     : u8=3, <header>
//! NEWINDEX: u8=4, <path>, <key>, <value>
//! ```
//!
//! where `<path>` is a `u32` length followed by a dotted path such as
//! `string.format`.
//!
//! # Binary Format
//!
//! - `u32` values use the negotiated byte order (little-endian only when
//!   both peers are).
//! - Numbers are `lnum_bytes` wide, signed integers or IEEE floats.
//! - Values are a one byte tag from [`tag`] followed by a payload; tables
//!   and functions are closed by their own end markers.
//!
//! # Key Components
//!
//! - [`link::Link`]: a transport plus the negotiated number format, with
//!   the fixed-width wire primitives.
//! - [`codec`]: reading and writing Lua values.
//! - [`negotiate`]: the session handshake.
//! - [`path`]: dotted path encoding and server-side resolution.
//!
//! # See Also
//!
//! - [`server`](crate::server): executes decoded commands.
//! - [`client`](crate::client): proxies that emit them.
pub mod codec;
pub mod link;
pub mod negotiate;
pub mod path;

pub const PROTOCOL_VERSION: u8 = 3;

/// Size of a path segment buffer; segments hold at most one byte less.
pub const NUM_FUNCNAME_CHARS: usize = 32;

/// Consecutive nonfatal errors a server tolerates on one connection.
pub const MAX_LINK_ERRS: u32 = 2;

pub mod tag {
    pub const NIL: u8 = 0;
    pub const NUMBER: u8 = 1;
    pub const BOOLEAN: u8 = 2;
    pub const STRING: u8 = 3;
    pub const TABLE: u8 = 4;
    pub const TABLE_END: u8 = 5;
    pub const FUNCTION: u8 = 6;
    pub const FUNCTION_END: u8 = 7;
    pub const REMOTE: u8 = 8;
}

pub mod status {
    pub const OK: u8 = 0;
    pub const ERR: u8 = 1;

    pub const READY: u8 = 64;
    pub const UNSUPPORTED_CMD: u8 = 65;
}

/// Lua status codes carried in error responses.
pub mod lua_status {
    pub const ERRRUN: u32 = 2;
    pub const ERRSYNTAX: u32 = 3;
    pub const ERRMEM: u32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Call = 1,
    Get = 2,
    Con = 3,
    NewIndex = 4,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::Call),
            2 => Ok(Command::Get),
            3 => Ok(Command::Con),
            4 => Ok(Command::NewIndex),
            other => Err(other),
        }
    }
}
