use crate::error::{Error, ErrorKind, Result};
use crate::wire::protocol::{Endianness, Flags, HeaderField, MessageType, LOCAL_INTERFACE, LOCAL_PATH};
use crate::wire::{align4, align8};

/// A decoded view of a D-Bus message header.
///
/// Bodies are never decoded; only the fields needed to make a policy
/// decision are pulled out of the header array.
#[derive(Debug, Clone)]
pub struct Header {
    pub endianness: Endianness,
    pub message_type: MessageType,
    pub flags: Flags,
    pub version: u8,
    pub body_length: u32,
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<String>,
    pub unix_fds: Option<u32>,
    /// Byte offset one past the end of the (8-byte aligned) header array.
    /// `body_length` bytes of body follow starting here.
    pub(crate) header_end: usize,
}

impl Header {
    /// Total length of this message on the wire (header + body).
    pub fn total_len(&self) -> usize {
        self.header_end + self.body_length as usize
    }

    /// `true` if this is a method call that does not expect a reply.
    pub fn is_no_reply_expected(&self) -> bool {
        self.flags & Flags::NO_REPLY_EXPECTED
    }

    /// `true` if the caller expects some kind of reply to this message.
    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::METHOD_CALL && !self.is_no_reply_expected()
    }
}

fn read_u32(bytes: &[u8], at: usize, endianness: Endianness) -> Result<u32> {
    let chunk: [u8; 4] = bytes
        .get(at..at + 4)
        .ok_or(ErrorKind::BufferUnderflow)?
        .try_into()
        .map_err(|_| Error::from(ErrorKind::BufferUnderflow))?;

    Ok(if endianness.0 == Endianness::BIG.0 {
        u32::from_be_bytes(chunk)
    } else {
        u32::from_le_bytes(chunk)
    })
}

fn read_u8(bytes: &[u8], at: usize) -> Result<u8> {
    bytes.get(at).copied().ok_or(ErrorKind::BufferUnderflow.into())
}

/// Read a D-Bus STRING or OBJECT_PATH value: a 4-byte aligned `u32` length,
/// that many bytes, and a terminating NUL.
fn read_string(bytes: &[u8], at: usize, endianness: Endianness) -> Result<(String, usize)> {
    let at = align4(at);
    let len = read_u32(bytes, at, endianness)? as usize;
    let start = at + 4;
    let end = start + len;

    let value = bytes
        .get(start..end)
        .ok_or(ErrorKind::BufferUnderflow)?;

    if read_u8(bytes, end)? != 0 {
        return Err(ErrorKind::NotNullTerminated.into());
    }

    let value = std::str::from_utf8(value)?.to_owned();
    Ok((value, end + 1))
}

/// Read a D-Bus SIGNATURE value: a 1-byte length, that many bytes, and a
/// terminating NUL. No alignment.
fn read_signature(bytes: &[u8], at: usize) -> Result<(String, usize)> {
    let len = read_u8(bytes, at)? as usize;
    let start = at + 1;
    let end = start + len;

    let value = bytes
        .get(start..end)
        .ok_or(ErrorKind::BufferUnderflow)?;

    if read_u8(bytes, end)? != 0 {
        return Err(ErrorKind::NotNullTerminated.into());
    }

    let value = std::str::from_utf8(value)?.to_owned();
    Ok((value, end + 1))
}

/// Decode a message header from the front of `bytes`.
///
/// `bytes` may contain more than one message; only the first is decoded.
/// The body itself is left untouched — callers address it by
/// `header.header_end .. header.total_len()`.
pub fn parse_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < 16 {
        return Err(ErrorKind::BufferUnderflow.into());
    }

    let endianness = Endianness::from_byte(bytes[0]).ok_or(ErrorKind::InvalidEndianness(bytes[0]))?;
    let message_type = MessageType(bytes[1]);
    let flags = Flags(bytes[2]);
    let version = bytes[3];

    if version != 1 {
        return Err(ErrorKind::InvalidProtocolVersion(version).into());
    }

    let body_length = read_u32(bytes, 4, endianness)?;
    let serial = read_u32(bytes, 8, endianness)?;

    if serial == 0 {
        return Err(ErrorKind::ZeroSerial.into());
    }

    let array_len = read_u32(bytes, 12, endianness)? as usize;
    let header_end = align8(16 + array_len);

    if header_end > bytes.len() {
        return Err(ErrorKind::HeaderArrayOutOfBounds.into());
    }

    let mut header = Header {
        endianness,
        message_type,
        flags,
        version,
        body_length,
        serial,
        path: None,
        interface: None,
        member: None,
        error_name: None,
        reply_serial: None,
        destination: None,
        sender: None,
        signature: None,
        unix_fds: None,
        header_end,
    };

    let array_end = 16 + array_len;
    let mut pos = 16;

    while pos < array_end {
        pos = align8(pos);

        if pos >= array_end {
            break;
        }

        let field = HeaderField(read_u8(bytes, pos)?);
        pos += 1;

        // The field's own signature, itself a SIGNATURE value.
        let (sig, next) = read_signature(bytes, pos)?;
        pos = next;

        if let Some(required) = required_signature(field) {
            if sig != required {
                return Err(ErrorKind::WrongFieldSignature(field.0).into());
            }
        }

        match field {
            HeaderField::PATH => {
                let (value, next) = read_string(bytes, pos, endianness)?;
                pos = next;
                header.path = Some(value);
            }
            HeaderField::INTERFACE => {
                let (value, next) = read_string(bytes, pos, endianness)?;
                pos = next;
                header.interface = Some(value);
            }
            HeaderField::MEMBER => {
                let (value, next) = read_string(bytes, pos, endianness)?;
                pos = next;
                header.member = Some(value);
            }
            HeaderField::ERROR_NAME => {
                let (value, next) = read_string(bytes, pos, endianness)?;
                pos = next;
                header.error_name = Some(value);
            }
            HeaderField::DESTINATION => {
                let (value, next) = read_string(bytes, pos, endianness)?;
                pos = next;
                header.destination = Some(value);
            }
            HeaderField::SENDER => {
                let (value, next) = read_string(bytes, pos, endianness)?;
                pos = next;
                header.sender = Some(value);
            }
            HeaderField::SIGNATURE => {
                let (value, next) = read_signature(bytes, pos)?;
                pos = next;
                header.signature = Some(value);
            }
            HeaderField::REPLY_SERIAL => {
                pos = align4(pos);
                let value = read_u32(bytes, pos, endianness)?;
                pos += 4;
                header.reply_serial = Some(value);
            }
            HeaderField::UNIX_FDS => {
                pos = align4(pos);
                let value = read_u32(bytes, pos, endianness)?;
                pos += 4;
                header.unix_fds = Some(value);
            }
            other => return Err(ErrorKind::UnknownHeaderField(other.0).into()),
        }
    }

    validate_invariants(&header)?;
    Ok(header)
}

/// The signature a given header field is required to carry, per the
/// dispatch table in §4.A.2. Fields with no fixed-signature requirement
/// (`REPLY_SERIAL`, `UNIX_FDS`) return `None`.
fn required_signature(field: HeaderField) -> Option<&'static str> {
    match field {
        HeaderField::PATH => Some("o"),
        HeaderField::INTERFACE | HeaderField::MEMBER | HeaderField::ERROR_NAME => Some("s"),
        HeaderField::DESTINATION | HeaderField::SENDER => Some("s"),
        HeaderField::SIGNATURE => Some("g"),
        _ => None,
    }
}

fn validate_invariants(header: &Header) -> Result<()> {
    match header.message_type {
        MessageType::METHOD_CALL => {
            if header.path.is_none() {
                return Err(ErrorKind::MissingPath.into());
            }
            if header.member.is_none() {
                return Err(ErrorKind::MissingMember.into());
            }
        }
        MessageType::METHOD_RETURN => {
            if header.reply_serial.is_none() {
                return Err(ErrorKind::MissingReplySerial.into());
            }
        }
        MessageType::ERROR => {
            if header.error_name.is_none() {
                return Err(ErrorKind::MissingErrorName.into());
            }
            if header.reply_serial.is_none() {
                return Err(ErrorKind::MissingReplySerial.into());
            }
        }
        MessageType::SIGNAL => {
            if header.path.is_none() {
                return Err(ErrorKind::MissingPath.into());
            }
            if header.interface.is_none() {
                return Err(ErrorKind::MissingInterface.into());
            }
            if header.member.is_none() {
                return Err(ErrorKind::MissingMember.into());
            }
            if header.path.as_deref() == Some(LOCAL_PATH) || header.interface.as_deref() == Some(LOCAL_INTERFACE) {
                return Err(ErrorKind::ReservedLocalAddress.into());
            }
        }
        _ => {}
    }

    Ok(())
}
