//! The small SASL handshake the consent client performs against the session
//! bus before it can send the `Request` method call: a single round of
//! `AUTH EXTERNAL <hex-uid>` followed by `BEGIN`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::{ErrorKind, Result};

/// Hex-encode the ASCII decimal representation of a uid, as EXTERNAL
/// authentication expects.
fn external_auth_hex(uid: u32) -> String {
    uid.to_string().bytes().map(|b| format!("{b:02x}")).collect()
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let mut bytes = bytes;
    while let [prefix @ .., c] = bytes {
        if !c.is_ascii_whitespace() {
            break;
        }
        bytes = prefix;
    }
    bytes
}

fn split_once(bytes: &[u8], byte: u8) -> Option<(&[u8], &[u8])> {
    let n = bytes.iter().position(|&c| c == byte)?;
    let (head, tail) = bytes.split_at(n);
    Some((head, &tail[1..]))
}

/// Perform the `AUTH EXTERNAL` / `BEGIN` handshake on a freshly connected
/// bus socket, leaving it ready to exchange D-Bus messages.
pub async fn authenticate_external(stream: &mut UnixStream) -> Result<()> {
    let uid = unsafe { libc::getuid() };
    let hex = external_auth_hex(uid);

    let mut line = Vec::with_capacity(hex.len() + 16);
    line.push(0);
    line.extend_from_slice(b"AUTH EXTERNAL ");
    line.extend_from_slice(hex.as_bytes());
    line.extend_from_slice(b"\r\n");
    stream.write_all(&line).await?;

    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf).await?;
    let response = trim_end(&buf[..n]);

    let (command, _guid) = split_once(response, b' ').ok_or(ErrorKind::InvalidSasl)?;
    if command != b"OK" {
        return Err(ErrorKind::InvalidSasl.into());
    }

    stream.write_all(b"BEGIN\r\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encodes_decimal_uid() {
        // uid 1000 -> ascii "1000" -> hex encoding of each digit byte.
        assert_eq!(external_auth_hex(1000), "31303030");
        assert_eq!(external_auth_hex(0), "30");
    }
}
