//! Hand-rolled encoding for the handful of messages this proxy ever has to
//! originate itself: a synthesized `AccessDenied` error reply, and the
//! consent client's outgoing method calls. Forwarded traffic is never
//! re-encoded — only these two cases need a writer at all.

use crate::wire::header::Header;
use crate::wire::protocol::{Endianness, MessageType};

fn align_push(buf: &mut Vec<u8>, to: usize) {
    while buf.len() % to != 0 {
        buf.push(0);
    }
}

/// Write a `u32` in the given frame's endianness — every multi-byte integer
/// in a D-Bus message, header-array lengths and `REPLY_SERIAL`/`UNIX_FDS`
/// values included, shares the single endianness declared by the frame's
/// leading sigil (§4.A.1).
fn put_u32(buf: &mut Vec<u8>, value: u32, endianness: Endianness) {
    if endianness.0 == Endianness::LITTLE.0 {
        buf.extend_from_slice(&value.to_le_bytes());
    } else {
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

fn write_string_field(buf: &mut Vec<u8>, code: u8, type_sig: u8, value: &str, endianness: Endianness) {
    align_push(buf, 8);
    buf.push(code);
    buf.push(1);
    buf.push(type_sig);
    buf.push(0);
    align_push(buf, 4);
    put_u32(buf, value.len() as u32, endianness);
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

fn write_u32_field(buf: &mut Vec<u8>, code: u8, value: u32, endianness: Endianness) {
    align_push(buf, 8);
    buf.push(code);
    buf.push(1);
    buf.push(b'u');
    buf.push(0);
    align_push(buf, 4);
    put_u32(buf, value, endianness);
}

fn write_body_string(buf: &mut Vec<u8>, value: &str, endianness: Endianness) {
    align_push(buf, 4);
    put_u32(buf, value.len() as u32, endianness);
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

/// Assemble a complete frame given a pre-built header-field array and body.
fn assemble(
    endianness: Endianness,
    message_type: MessageType,
    serial: u32,
    header_fields: Vec<u8>,
    body: Vec<u8>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + header_fields.len() + body.len() + 16);
    out.push(endianness.0);
    out.push(message_type.0);
    out.push(0); // flags
    out.push(1); // protocol version

    put_u32(&mut out, body.len() as u32, endianness);
    put_u32(&mut out, serial, endianness);
    put_u32(&mut out, header_fields.len() as u32, endianness);
    out.extend_from_slice(&header_fields);

    while out.len() % 8 != 0 {
        out.push(0);
    }

    out.extend_from_slice(&body);
    out
}

/// Synthesize a D-Bus `ERROR` reply to `original`, to be written straight
/// back to the downstream socket in place of forwarding the denied call.
///
/// This frame's own serial is `original.serial + 1`; its `REPLY_SERIAL`
/// header field carries `original.serial` itself, the conventional value a
/// real reply would use. See the design ledger for why these two numbers
/// differ.
pub fn synth_error_reply(original: &Header, destination: Option<&str>, error_name: &str, error_message: &str) -> Vec<u8> {
    let endianness = original.endianness;
    let reply_serial = original.serial.wrapping_add(1);

    let mut fields = Vec::new();
    write_string_field(&mut fields, 4, b's', error_name, endianness); // ERROR_NAME
    write_u32_field(&mut fields, 5, original.serial, endianness); // REPLY_SERIAL (conventional value)
    if let Some(destination) = destination {
        write_string_field(&mut fields, 6, b's', destination, endianness); // DESTINATION
    }
    write_string_field(&mut fields, 8, b'g', "s", endianness); // SIGNATURE of body: single string

    let mut body = Vec::new();
    write_body_string(&mut body, error_message, endianness);

    assemble(endianness, MessageType::ERROR, reply_serial, fields, body)
}

/// Encode an outbound `METHOD_CALL` with an all-string argument list, as
/// used by the consent client to call `Request` and
/// `ShowDisablePermissionDialog` on the permission service.
pub fn encode_method_call(
    serial: u32,
    path: &str,
    interface: &str,
    member: &str,
    destination: &str,
    args: &[&str],
) -> Vec<u8> {
    let endianness = Endianness::NATIVE;

    let mut fields = Vec::new();
    write_string_field(&mut fields, 1, b'o', path, endianness); // PATH
    write_string_field(&mut fields, 2, b's', interface, endianness); // INTERFACE
    write_string_field(&mut fields, 3, b's', member, endianness); // MEMBER
    write_string_field(&mut fields, 6, b's', destination, endianness); // DESTINATION

    let mut body = Vec::new();

    if !args.is_empty() {
        let signature: String = std::iter::repeat('s').take(args.len()).collect();
        write_string_field(&mut fields, 8, b'g', &signature, endianness); // SIGNATURE

        for arg in args {
            write_body_string(&mut body, arg, endianness);
        }
    }

    assemble(endianness, MessageType::METHOD_CALL, serial, fields, body)
}

/// Read the first `STRING` argument out of a message body, decoded in the
/// same endianness as the frame it came from.
pub fn read_first_body_string(body: &[u8], endianness: Endianness) -> Option<String> {
    if body.len() < 4 {
        return None;
    }

    let chunk: [u8; 4] = body[0..4].try_into().ok()?;
    let len = if endianness.0 == Endianness::LITTLE.0 {
        u32::from_le_bytes(chunk)
    } else {
        u32::from_be_bytes(chunk)
    } as usize;
    let start = 4;
    let end = start.checked_add(len)?;
    let value = body.get(start..end)?;
    std::str::from_utf8(value).ok().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::header::parse_header;

    fn sample_call_header() -> Header {
        let mut buf = Vec::new();
        buf.push(b'l');
        buf.push(1);
        buf.push(0);
        buf.push(1);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&42u32.to_le_bytes());

        let mut fields = Vec::new();
        write_string_field(&mut fields, 1, b'o', "/com/deepin/linglong/PackageManager", Endianness::LITTLE);
        write_string_field(&mut fields, 3, b's', "Install", Endianness::LITTLE);

        buf.extend_from_slice(&(fields.len() as u32).to_le_bytes());
        buf.extend_from_slice(&fields);
        while buf.len() % 8 != 0 {
            buf.push(0);
        }

        parse_header(&buf).unwrap()
    }

    #[test]
    fn synthesizes_well_formed_error() {
        let original = sample_call_header();
        let reply = synth_error_reply(&original, Some(":1.42"), "org.freedesktop.DBus.Error.AccessDenied", "denied");
        let decoded = parse_header(&reply).unwrap();

        assert_eq!(decoded.message_type, super::MessageType::ERROR);
        assert_eq!(decoded.reply_serial, Some(42));
        assert_eq!(decoded.error_name.as_deref(), Some("org.freedesktop.DBus.Error.AccessDenied"));
        assert_eq!(decoded.destination.as_deref(), Some(":1.42"));
        assert_eq!(decoded.total_len(), reply.len());
    }

    #[test]
    fn encodes_and_reads_back_method_call() {
        let frame = encode_method_call(
            7,
            "/org/desktopspec/permission",
            "org.desktopspec.permission",
            "Request",
            "org.desktopspec.permission",
            &["com.example.app", "linglong", "dbus.xxx"],
        );

        let decoded = parse_header(&frame).unwrap();
        assert_eq!(decoded.member.as_deref(), Some("Request"));
        assert_eq!(decoded.signature.as_deref(), Some("sss"));

        let body = &frame[decoded.header_end..decoded.total_len()];
        let first = read_first_body_string(body, decoded.endianness).unwrap();
        assert_eq!(first, "com.example.app");
    }

    #[test]
    fn synthesizes_well_formed_error_big_endian() {
        let mut buf = Vec::new();
        buf.push(b'B');
        buf.push(1);
        buf.push(0);
        buf.push(1);
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());

        let mut fields = Vec::new();
        write_string_field(&mut fields, 1, b'o', "/com/deepin/linglong/PackageManager", Endianness::BIG);
        write_string_field(&mut fields, 3, b's', "Install", Endianness::BIG);

        buf.extend_from_slice(&(fields.len() as u32).to_be_bytes());
        buf.extend_from_slice(&fields);
        while buf.len() % 8 != 0 {
            buf.push(0);
        }

        let original = parse_header(&buf).unwrap();
        let reply = synth_error_reply(&original, Some(":1.7"), "org.freedesktop.DBus.Error.AccessDenied", "denied");

        // The whole frame, sigil included, must decode consistently in one
        // endianness — a mismatched writer would corrupt the header-array
        // length or the string lengths inside it.
        let decoded = parse_header(&reply).unwrap();
        assert_eq!(decoded.message_type, super::MessageType::ERROR);
        assert_eq!(decoded.reply_serial, Some(7));
        assert_eq!(decoded.error_name.as_deref(), Some("org.freedesktop.DBus.Error.AccessDenied"));
        assert_eq!(decoded.destination.as_deref(), Some(":1.7"));
        assert_eq!(decoded.total_len(), reply.len());
    }
}
