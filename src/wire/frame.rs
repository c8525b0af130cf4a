use crate::wire::protocol::Endianness;
use crate::wire::align8;

/// Result of splitting an accumulator buffer into framed messages.
pub struct SplitFrames<'a> {
    /// Complete frames found at the front of the buffer, in order.
    pub frames: Vec<&'a [u8]>,
    /// Number of bytes at the front of the buffer covered by `frames`.
    /// Callers should retain `buf[consumed..]` and prepend it to the next read.
    pub consumed: usize,
}

const BEGIN_LINE: &[u8] = b"BEGIN\r\n";

/// Split a byte accumulator into complete D-Bus frames.
///
/// Handles the SASL `BEGIN\r\n` handshake terminator and pre-auth text lines
/// specially, since they are not length-prefixed D-Bus messages. Within the
/// framed portion of the stream, only whole frames are ever returned — a
/// trailing partial frame is left in the buffer for the next call.
pub fn split_frames(buf: &[u8]) -> SplitFrames<'_> {
    if buf.starts_with(BEGIN_LINE) {
        let mut frames = vec![&buf[..BEGIN_LINE.len()]];
        let rest = &buf[BEGIN_LINE.len()..];
        if !rest.is_empty() {
            frames.push(rest);
        }
        return SplitFrames {
            frames,
            consumed: buf.len(),
        };
    }

    if buf.is_empty() {
        return SplitFrames {
            frames: Vec::new(),
            consumed: 0,
        };
    }

    if Endianness::from_byte(buf[0]).is_none() {
        return SplitFrames {
            frames: vec![buf],
            consumed: buf.len(),
        };
    }

    if buf.len() < 16 {
        return SplitFrames {
            frames: Vec::new(),
            consumed: 0,
        };
    }

    let mut frames = Vec::new();
    let mut pos = 0;

    loop {
        let remaining = &buf[pos..];

        if remaining.len() < 16 {
            break;
        }

        let endianness = match Endianness::from_byte(remaining[0]) {
            Some(endianness) => endianness,
            None => break,
        };

        let body_length = read_u32(remaining, 4, endianness);
        let array_len = read_u32(remaining, 12, endianness);
        let header_end = align8(16 + array_len as usize);
        let total = header_end + body_length as usize;

        if remaining.len() < total {
            break;
        }

        frames.push(&remaining[..total]);
        pos += total;
    }

    SplitFrames {
        frames,
        consumed: pos,
    }
}

fn read_u32(bytes: &[u8], at: usize, endianness: Endianness) -> u32 {
    let chunk: [u8; 4] = match bytes.get(at..at + 4) {
        Some(chunk) => chunk.try_into().expect("slice of len 4"),
        None => return 0,
    };

    if endianness.0 == Endianness::BIG.0 {
        u32::from_be_bytes(chunk)
    } else {
        u32::from_le_bytes(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::header::parse_header;

    fn hello_frame(serial: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(b'l');
        buf.push(1);
        buf.push(0);
        buf.push(1);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&serial.to_le_bytes());

        let mut header_array = Vec::new();
        push_string_field(&mut header_array, 1, b'o', "/org/freedesktop/DBus");
        push_string_field(&mut header_array, 3, b's', "AddMatch");

        buf.extend_from_slice(&(header_array.len() as u32).to_le_bytes());
        buf.extend_from_slice(&header_array);
        while buf.len() % 8 != 0 {
            buf.push(0);
        }

        buf
    }

    fn push_string_field(out: &mut Vec<u8>, code: u8, sig: u8, value: &str) {
        while out.len() % 8 != 0 {
            out.push(0);
        }
        out.push(code);
        out.push(1);
        out.push(sig);
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }

    #[test]
    fn splits_two_concatenated_frames() {
        let mut buf = hello_frame(1);
        buf.extend_from_slice(&hello_frame(2));

        let split = split_frames(&buf);
        assert_eq!(split.frames.len(), 2);
        assert_eq!(split.consumed, buf.len());

        let first = parse_header(split.frames[0]).unwrap();
        let second = parse_header(split.frames[1]).unwrap();
        assert_eq!(first.serial, 1);
        assert_eq!(second.serial, 2);
    }

    #[test]
    fn buffers_partial_tail() {
        let full = hello_frame(1);
        let partial = &full[..full.len() - 4];

        let split = split_frames(partial);
        assert!(split.frames.is_empty());
        assert_eq!(split.consumed, 0);
    }

    #[test]
    fn splits_begin_handshake() {
        let mut buf = b"BEGIN\r\n".to_vec();
        buf.extend_from_slice(&hello_frame(1));

        let split = split_frames(&buf);
        assert_eq!(split.frames[0], b"BEGIN\r\n");
        assert_eq!(split.frames.len(), 2);
    }

    #[test]
    fn auth_text_is_opaque() {
        let buf = b"AUTH EXTERNAL 30\r\n".to_vec();
        let split = split_frames(&buf);
        assert_eq!(split.frames.len(), 1);
        assert_eq!(split.frames[0], &buf[..]);
    }
}
