//! Structured failures raised by the RPC layer.
//!
//! Every failure carries an [`ErrorNum`] describing what went wrong and an
//! [`ErrorKind`] that decides what happens to the link afterwards: a
//! nonfatal error aborts the current exchange but leaves the transport
//! usable, a fatal error closes it.
use std::io;

use thiserror::Error;

/// Whether the transport survives the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Fatal,
    NonFatal,
}

/// What went wrong.
#[derive(Debug, Error)]
pub enum ErrorNum {
    #[error("connection closed unexpectedly")]
    Eof,

    #[error("operation requested on closed transport")]
    Closed,

    #[error("error in the received protocol: {0}")]
    Protocol(String),

    #[error("undefined command '{0}'")]
    Command(u8),

    #[error("no data received when attempting to read")]
    NoData,

    #[error("header exchanged failed")]
    Header,

    #[error("function name too long")]
    LongFname,

    #[error("invalid path segment '{0}'")]
    InvalidName(String),

    #[error("{0} transmission unsupported")]
    UnsupportedType(&'static str),

    #[error("unknown value tag {0}")]
    UnknownTag(u8),

    #[error("transport io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode wire value: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode wire value: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("{0}")]
    Lua(#[from] mlua::Error),

    #[error("bad transport address '{0}'")]
    Address(String),

    /// Error status sent back by the server.
    #[error("{message}")]
    Remote { code: u32, message: String },
}

#[derive(Debug, Error)]
#[error("{errnum}")]
pub struct RpcError {
    pub errnum: ErrorNum,
    pub kind: ErrorKind,
}

impl RpcError {
    pub fn fatal(errnum: ErrorNum) -> Self {
        Self {
            errnum,
            kind: ErrorKind::Fatal,
        }
    }

    pub fn nonfatal(errnum: ErrorNum) -> Self {
        Self {
            errnum,
            kind: ErrorKind::NonFatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }

    /// Same error, promoted to [`ErrorKind::Fatal`].
    pub fn escalate(self) -> Self {
        Self::fatal(self.errnum)
    }
}

impl From<ErrorNum> for RpcError {
    fn from(errnum: ErrorNum) -> Self {
        // A corrupt value stream cannot be resynchronised.
        match errnum {
            ErrorNum::UnknownTag(_) => Self::fatal(errnum),
            errnum => Self::nonfatal(errnum),
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::UnexpectedEof => ErrorNum::Eof.into(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ErrorNum::NoData.into(),
            _ => ErrorNum::Io(value).into(),
        }
    }
}

impl From<mlua::Error> for RpcError {
    fn from(value: mlua::Error) -> Self {
        ErrorNum::Lua(value).into()
    }
}

impl From<bincode::error::EncodeError> for RpcError {
    fn from(value: bincode::error::EncodeError) -> Self {
        ErrorNum::Encode(value).into()
    }
}

impl From<bincode::error::DecodeError> for RpcError {
    fn from(value: bincode::error::DecodeError) -> Self {
        ErrorNum::Decode(value).into()
    }
}

impl From<RpcError> for mlua::Error {
    fn from(value: RpcError) -> Self {
        match value.errnum {
            ErrorNum::Lua(e) => e,
            errnum => mlua::Error::runtime(errnum.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
