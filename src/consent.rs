//! The consent client: a minimal, purpose-built D-Bus client that asks
//! `org.desktopspec.permission` whether a sandboxed app may use a given
//! D-Bus triple. It does not reuse a general D-Bus crate — like the wire
//! codec used for the proxy's own traffic, it hand-encodes exactly the two
//! method calls it ever needs to make.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::config::ProxyConfig;
use crate::error::{ErrorKind, Result};
use crate::sasl;
use crate::wire::header::parse_header;
use crate::wire::protocol::MessageType;
use crate::wire::reply::{encode_method_call, read_first_body_string};

const SERVICE: &str = "org.desktopspec.permission";
const OBJECT_PATH: &str = "/org/desktopspec/permission";
const INTERFACE: &str = "org.desktopspec.permission";
const SYSTEM_LEVEL_RESTRICTIONS: &str = "org.desktopspec.permission.SystemLevelRestrictions";

/// How long a single consent round trip, including a possible disable-dialog
/// follow-up, is allowed to take before the proxy gives up and treats the
/// request as denied.
const CONSENT_TIMEOUT: Duration = Duration::from_secs(25 * 60);

/// The user's (or policy's) answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deny,
    DenyOnce,
    Allow,
    AllowOnce,
}

impl Verdict {
    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Deny),
            1 => Some(Self::DenyOnce),
            2 => Some(Self::Allow),
            3 => Some(Self::AllowOnce),
            _ => None,
        }
    }

    /// Whether this verdict forwards the gated message.
    pub fn allows(self) -> bool {
        matches!(self, Self::Allow | Self::AllowOnce)
    }
}

/// Ask the permission service whether `app_id` may use the D-Bus resource
/// identified by `permission_id`. Any failure to reach the service, a
/// malformed reply, or a timeout is treated as [`Verdict::Deny`] (§7:
/// "Consent error ... treat as Deny").
pub async fn request(config: &ProxyConfig, permission_id: &str) -> Verdict {
    if permission_id.is_empty() {
        tracing::warn!("cannot request consent for an empty permission id");
        return Verdict::Deny;
    }

    match timeout(CONSENT_TIMEOUT, request_inner(config, permission_id)).await {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(error)) => {
            tracing::warn!(%error, "consent request failed, treating as deny");
            Verdict::Deny
        }
        Err(_) => {
            tracing::warn!("consent request timed out, treating as deny");
            Verdict::Deny
        }
    }
}

async fn request_inner(config: &ProxyConfig, permission_id: &str) -> Result<Verdict> {
    let bus_path = session_bus_path();
    let mut stream = UnixStream::connect(&bus_path).await?;
    sasl::authenticate_external(&mut stream).await?;

    let call = encode_method_call(
        1,
        OBJECT_PATH,
        INTERFACE,
        "Request",
        SERVICE,
        &[&config.app_id, "linglong", permission_id],
    );
    stream.write_all(&call).await?;

    let reply = read_one_frame(&mut stream).await?;
    let header = parse_header(&reply)?;
    let body = &reply[header.header_end..header.total_len()];

    let verdict = match header.message_type {
        MessageType::METHOD_RETURN => {
            let value = read_first_body_string(body, header.endianness).ok_or(ErrorKind::InvalidSasl)?;
            let code: i64 = value.trim().parse().map_err(|_| ErrorKind::InvalidSasl)?;
            Verdict::from_code(code).ok_or(ErrorKind::InvalidSasl)?
        }
        MessageType::ERROR => {
            let error_name = header.error_name.clone().unwrap_or_default();
            tracing::error!(app_id = %config.app_id, %error_name, "consent service returned an error");

            if error_name == SYSTEM_LEVEL_RESTRICTIONS {
                show_disable_dialog(&mut stream, &config.app_id, permission_id).await?;
            }

            Verdict::Deny
        }
        _ => return Err(ErrorKind::InvalidSasl.into()),
    };

    if verdict == Verdict::DenyOnce {
        show_disable_dialog(&mut stream, &config.app_id, permission_id).await?;
    }

    Ok(verdict)
}

async fn show_disable_dialog(stream: &mut UnixStream, app_id: &str, permission_id: &str) -> Result<()> {
    let call = encode_method_call(
        2,
        OBJECT_PATH,
        INTERFACE,
        "ShowDisablePermissionDialog",
        SERVICE,
        &[app_id, "linglong", permission_id],
    );
    stream.write_all(&call).await?;
    // Best-effort: wait for any reply but do not act on its contents.
    let _ = read_one_frame(stream).await;
    Ok(())
}

/// Read bytes off `stream` until a single complete frame has arrived.
async fn read_one_frame(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();

    loop {
        if let Ok(header) = parse_header(&buf) {
            if buf.len() >= header.total_len() {
                buf.truncate(header.total_len());
                return Ok(buf);
            }
        }

        stream.readable().await?;
        let mut chunk = [0u8; 4096];
        match stream.try_read(&mut chunk) {
            Ok(0) => return Err(ErrorKind::BufferUnderflow.into()),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn session_bus_path() -> PathBuf {
    if let Some(address) = std::env::var_os("DBUS_SESSION_BUS_ADDRESS") {
        if let Some(path) = parse_unix_path(&address.to_string_lossy()) {
            return path;
        }
    }

    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/run/user/{uid}/bus"))
}

/// Parse the `path=` key out of a `unix:path=...,guid=...` bus address.
fn parse_unix_path(address: &str) -> Option<PathBuf> {
    let rest = address.strip_prefix("unix:")?;

    for entry in rest.split(',') {
        if let Some(path) = entry.strip_prefix("path=") {
            return Some(PathBuf::from(path));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_codes_match_the_permission_service_enum() {
        assert_eq!(Verdict::from_code(0), Some(Verdict::Deny));
        assert_eq!(Verdict::from_code(1), Some(Verdict::DenyOnce));
        assert_eq!(Verdict::from_code(2), Some(Verdict::Allow));
        assert_eq!(Verdict::from_code(3), Some(Verdict::AllowOnce));
        assert_eq!(Verdict::from_code(4), None);
    }

    #[test]
    fn allows_only_for_allow_variants() {
        assert!(Verdict::Allow.allows());
        assert!(Verdict::AllowOnce.allows());
        assert!(!Verdict::Deny.allows());
        assert!(!Verdict::DenyOnce.allows());
    }

    #[test]
    fn parses_unix_path_from_bus_address() {
        let address = "unix:path=/run/user/1000/bus,guid=abcd1234";
        assert_eq!(parse_unix_path(address), Some(PathBuf::from("/run/user/1000/bus")));
    }

    #[test]
    fn rejects_non_unix_address() {
        assert_eq!(parse_unix_path("tcp:host=localhost,port=1234"), None);
    }
}
