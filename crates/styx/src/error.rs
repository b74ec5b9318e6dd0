//! Error types used across the protocol engine.

use std::{fmt, io};

/// Conventional Plan 9 error strings carried in `RError.ename`.
///
/// 9P2000 reports errors as free-form strings rather than numeric codes;
/// these are the ones the engine itself and typical file servers emit.
pub mod string {
    pub const EPERM: &str = "permission denied";
    pub const ENOENT: &str = "file does not exist";
    pub const EIO: &str = "i/o error";
    pub const EBADF: &str = "fid unknown or out of range";
    pub const EEXIST: &str = "file already exists";
    pub const ENOTDIR: &str = "not a directory";
    pub const EISDIR: &str = "is a directory";
    pub const EINVAL: &str = "invalid argument";
    pub const ENOTEMPTY: &str = "directory not empty";
    pub const EBADMSG: &str = "malformed 9P message";
    pub const EDUPTAG: &str = "duplicate tag";
    pub const ENOAUTH: &str = "authentication not required";
    pub const EBOTCH: &str = "9P protocol botch";
}

/// Failure modes of the message decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer is smaller than the declared frame size (or than the fixed
    /// header); the caller should read more bytes and retry.
    ShortBuffer,
    /// The declared size is present but the body cannot be parsed. The frame
    /// is consumed; the failure is reportable to the peer at tag level.
    Malformed(String),
    /// The type byte names no 9P2000 message.
    UnknownType(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::ShortBuffer => write!(f, "buffer too short for a complete message"),
            DecodeError::Malformed(reason) => write!(f, "malformed message: {}", reason),
            DecodeError::UnknownType(typ) => write!(f, "unknown message type {}", typ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// The error type shared by the codec, the server and the client.
#[derive(Debug)]
pub enum Error {
    /// A 9P-level error string, from a handler or a remote `RError`
    Ename(String),
    /// Transport failure; fatal to the connection
    Io(io::Error),
    /// The peer sent bytes that do not decode
    Decode(DecodeError),
    /// A frame whose declared size exceeds the negotiated msize; fatal
    FrameTooLarge { size: u32, msize: u32 },
    /// The peer violated the protocol state machine
    Protocol(String),
    /// All 65535 usable tags are in flight
    TagsExhausted,
    /// The transaction was cancelled by a flush
    Flushed,
    /// The connection is gone; pending transactions cannot complete
    Disconnected,
}

impl Error {
    /// The string to carry in an `RError` reply for this error.
    pub fn ename(&self) -> String {
        match self {
            Error::Ename(ename) => ename.clone(),
            Error::Decode(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Ename(ename) => write!(f, "{}", ename),
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Decode(e) => write!(f, "{}", e),
            Error::FrameTooLarge { size, msize } => {
                write!(f, "frame of {} bytes exceeds msize {}", size, msize)
            }
            Error::Protocol(reason) => write!(f, "protocol violation: {}", reason),
            Error::TagsExhausted => write!(f, "no free transaction tags"),
            Error::Flushed => write!(f, "transaction flushed"),
            Error::Disconnected => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e)
    }
}

impl From<&str> for Error {
    fn from(ename: &str) -> Self {
        Error::Ename(ename.to_owned())
    }
}

impl From<String> for Error {
    fn from(ename: String) -> Self {
        Error::Ename(ename)
    }
}
