use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8Error(error))
    }
}

impl From<serde_json::Error> for Error {
    #[inline]
    fn from(error: serde_json::Error) -> Self {
        Self::new(ErrorKind::Json(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Io(error) => error.fmt(f),
            ErrorKind::Utf8Error(error) => error.fmt(f),
            ErrorKind::Json(error) => error.fmt(f),
            ErrorKind::BufferUnderflow => write!(f, "Buffer underflow"),
            ErrorKind::InvalidProtocolVersion(version) => {
                write!(f, "Invalid protocol version {version}")
            }
            ErrorKind::InvalidEndianness(byte) => {
                write!(f, "Invalid endianness byte {byte:#x}")
            }
            ErrorKind::ZeroSerial => write!(f, "Zero in header serial"),
            ErrorKind::UnknownHeaderField(code) => {
                write!(f, "Unknown header field code {code}")
            }
            ErrorKind::WrongFieldSignature(code) => {
                write!(f, "Header field {code} has the wrong signature")
            }
            ErrorKind::HeaderArrayOutOfBounds => write!(f, "Header array extends past buffer"),
            ErrorKind::NotNullTerminated => write!(f, "String is not null terminated"),
            ErrorKind::MissingPath => write!(f, "Missing required PATH header"),
            ErrorKind::MissingMember => write!(f, "Missing required MEMBER header"),
            ErrorKind::MissingReplySerial => write!(f, "Missing required REPLY_SERIAL header"),
            ErrorKind::MissingInterface => write!(f, "Missing required INTERFACE header"),
            ErrorKind::MissingErrorName => write!(f, "Missing required ERROR_NAME header"),
            ErrorKind::ReservedLocalAddress => {
                write!(f, "Message addressed to the reserved org.freedesktop.DBus.Local path or interface")
            }
            ErrorKind::InvalidSasl => write!(f, "Invalid SASL message"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Utf8Error(error) => Some(error),
            ErrorKind::Json(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Utf8Error(Utf8Error),
    Json(serde_json::Error),
    BufferUnderflow,
    InvalidProtocolVersion(u8),
    InvalidEndianness(u8),
    ZeroSerial,
    UnknownHeaderField(u8),
    WrongFieldSignature(u8),
    HeaderArrayOutOfBounds,
    NotNullTerminated,
    MissingPath,
    MissingMember,
    MissingReplySerial,
    MissingInterface,
    MissingErrorName,
    ReservedLocalAddress,
    InvalidSasl,
}
