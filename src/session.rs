//! The proxy session state machine: one downstream (sandboxed app)
//! connection, one upstream (broker) connection, forwarded byte-for-byte
//! except where policy intervenes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::config::ProxyConfig;
use crate::consent;
use crate::telemetry;
use crate::wire::header::Header;
use crate::wire::protocol::Endianness;
use crate::wire::reply::synth_error_reply;
use crate::wire::split_frames;

/// How long to wait for the upstream broker to accept a connection before
/// giving up on this attempt.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const ACCESS_DENIED_ERROR: &str = "org.freedesktop.DBus.Error.AccessDenied";
const ACCESS_DENIED_MESSAGE: &str =
    "org.freedesktop.DBus.Error.AccessDenied, please config permission first!";

/// Drives one accepted downstream connection until either side closes.
pub struct Session {
    config: Arc<ProxyConfig>,
    downstream: UnixStream,
    upstream: Option<UnixStream>,
    down_buf: Vec<u8>,
    up_buf: Vec<u8>,
    client_bus_name: Option<String>,
}

impl Session {
    pub fn new(config: Arc<ProxyConfig>, downstream: UnixStream) -> Self {
        Self {
            config,
            downstream,
            upstream: None,
            down_buf: Vec::new(),
            up_buf: Vec::new(),
            client_bus_name: None,
        }
    }

    /// Run the session to completion: connect upstream, then relay frames
    /// bidirectionally until a socket closes.
    pub async fn run(mut self) {
        self.upstream = self.connect_upstream().await;

        loop {
            if self.upstream.is_none() {
                // No broker connection yet; only downstream progress can
                // trigger a reconnect attempt.
                match self.downstream.readable().await {
                    Ok(()) => {}
                    Err(error) => {
                        tracing::debug!(%error, "downstream socket error while waiting for upstream");
                        return;
                    }
                }

                if !self.drain_downstream().await {
                    return;
                }

                continue;
            }

            let upstream = self.upstream.as_mut().expect("checked above");

            tokio::select! {
                result = self.downstream.readable() => {
                    if result.is_err() || !self.drain_downstream().await {
                        return;
                    }
                }
                result = upstream.readable() => {
                    if result.is_err() || !self.drain_upstream().await {
                        return;
                    }
                }
            }
        }
    }

    async fn connect_upstream(&mut self) -> Option<UnixStream> {
        match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, UnixStream::connect(&self.config.broker_path)).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(error)) => {
                tracing::warn!(path = %self.config.broker_path.display(), %error, "failed to connect to broker");
                None
            }
            Err(_) => {
                tracing::warn!(path = %self.config.broker_path.display(), "timed out connecting to broker");
                None
            }
        }
    }

    /// Read whatever is currently available from the downstream socket,
    /// apply policy to each complete frame, and forward or deny it.
    /// Returns `false` if the downstream socket closed.
    async fn drain_downstream(&mut self) -> bool {
        let mut chunk = [0u8; 8192];

        loop {
            match self.downstream.try_read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.down_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    tracing::debug!(%error, "downstream read error");
                    return false;
                }
            }
        }

        let split = split_frames(&self.down_buf);
        let frames: Vec<Vec<u8>> = split.frames.iter().map(|frame| frame.to_vec()).collect();
        let consumed = split.consumed;
        self.down_buf.drain(..consumed);

        if self.reconnect_upstream_if_needed().await {
            // Upstream came back; nothing else to do before processing frames.
        }

        for frame in frames {
            if !self.handle_downstream_frame(frame).await {
                return false;
            }
        }

        true
    }

    async fn reconnect_upstream_if_needed(&mut self) -> bool {
        if self.upstream.is_some() {
            return false;
        }

        if let Some(stream) = self.connect_upstream().await {
            self.upstream = Some(stream);
            true
        } else {
            false
        }
    }

    /// Apply policy to one downstream frame. Returns `false` if the
    /// downstream socket has been found to be closed (write failure).
    async fn handle_downstream_frame(&mut self, frame: Vec<u8>) -> bool {
        if frame.is_empty() || Endianness::from_byte(frame[0]).is_none() {
            // Pre-auth text line: forward unmodified.
            return self.forward_to_upstream(&frame).await;
        }

        let header = match crate::wire::parse_header(&frame) {
            Ok(header) => header,
            Err(error) => {
                tracing::warn!(%error, "dropped an unparseable dbus frame, forwarding as non-matching");
                return self.forward_to_upstream(&frame).await;
            }
        };

        let destination = header.destination.clone().unwrap_or_default();
        let path = header.path.clone().unwrap_or_default();
        let interface = header.interface.clone().unwrap_or_default();

        telemetry::report(self.config.clone(), destination.clone(), path.clone(), interface.clone());

        let matched = self.config.filter.is_message_match(&destination, &path, &interface);

        tracing::debug!(
            serial = header.serial,
            %destination, %path, %interface,
            matched,
            "dbus message policy check"
        );

        if !matched || !self.config.intercept_enabled {
            return self.forward_to_upstream(&frame).await;
        }

        let allowed = self.request_consent(&header, &destination, &path, &interface).await;

        if allowed {
            self.forward_to_upstream(&frame).await
        } else {
            self.deny(&header).await
        }
    }

    async fn request_consent(&self, header: &Header, destination: &str, path: &str, interface: &str) -> bool {
        let permission_id = self.config.lookup_permission_id(destination, path, interface).await;

        let Some(permission_id) = permission_id else {
            tracing::warn!(%destination, %path, %interface, "no permission id configured for this triple, denying");
            return false;
        };

        let verdict = consent::request(&self.config, &permission_id).await;
        tracing::debug!(serial = header.serial, ?verdict, "consent verdict");
        verdict.allows()
    }

    async fn forward_to_upstream(&mut self, frame: &[u8]) -> bool {
        let Some(upstream) = self.upstream.as_mut() else {
            tracing::warn!("dropping frame, no upstream connection available");
            return true;
        };

        if let Err(error) = upstream.write_all(frame).await {
            tracing::debug!(%error, "upstream write failed");
            return false;
        }

        true
    }

    /// Synthesize and send an `AccessDenied` reply in place of forwarding,
    /// if one was expected; otherwise drop the frame silently.
    async fn deny(&mut self, header: &Header) -> bool {
        if !header.expects_reply() {
            return true;
        }

        let reply = synth_error_reply(
            header,
            self.client_bus_name.as_deref(),
            ACCESS_DENIED_ERROR,
            ACCESS_DENIED_MESSAGE,
        );

        if let Err(error) = self.downstream.write_all(&reply).await {
            tracing::debug!(%error, "failed to write synthesized deny reply downstream");
            return false;
        }

        true
    }

    /// Read whatever is currently available from the upstream socket and
    /// forward every complete frame downstream unmodified, watching for the
    /// `NameAcquired` signal that reveals our client's own bus name.
    async fn drain_upstream(&mut self) -> bool {
        let mut chunk = [0u8; 8192];

        loop {
            let Some(upstream) = self.upstream.as_mut() else {
                return true;
            };

            match upstream.try_read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.up_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    tracing::debug!(%error, "upstream read error");
                    return false;
                }
            }
        }

        let split = split_frames(&self.up_buf);
        let frames: Vec<Vec<u8>> = split.frames.iter().map(|frame| frame.to_vec()).collect();
        let consumed = split.consumed;
        self.up_buf.drain(..consumed);

        for frame in frames {
            self.capture_client_bus_name(&frame);

            if let Err(error) = self.downstream.write_all(&frame).await {
                tracing::debug!(%error, "downstream write failed");
                return false;
            }
        }

        true
    }

    fn capture_client_bus_name(&mut self, frame: &[u8]) {
        if self.client_bus_name.is_some() {
            return;
        }

        if !contains(frame, b"NameAcquired") {
            return;
        }

        if let Ok(header) = crate::wire::parse_header(frame) {
            if header.member.as_deref() == Some("NameAcquired") {
                self.client_bus_name = header.destination.clone();
            }
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::wire::reply::encode_method_call;
    use std::path::PathBuf;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn test_config(broker_path: PathBuf) -> Arc<ProxyConfig> {
        let mut filter = Filter::new();
        filter.add_name("com.deepin.linglong.*");

        ProxyConfig::new(
            "com.example.app".into(),
            broker_path,
            PathBuf::from("/tmp/unused.sock"),
            filter,
            Some(PathBuf::from("/nonexistent/dbus_map_config")),
            Some(PathBuf::from("/nonexistent/dbus_proxy_config")),
        )
    }

    #[tokio::test]
    async fn forwards_non_matching_call_to_broker() {
        let dir = tempdir();
        let broker_path = dir.join("broker.sock");
        let listener = UnixListener::bind(&broker_path).unwrap();

        let accept = tokio::spawn(async move {
            let (mut broker_side, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = broker_side.read(&mut buf).await.unwrap();
            buf.truncate(n);
            buf
        });

        let config = test_config(broker_path);
        let (downstream_here, downstream_there) = UnixStream::pair().unwrap();

        let session = Session::new(config, downstream_there);
        let handle = tokio::spawn(session.run());

        let call = encode_method_call(1, "/org/freedesktop/DBus", "org.freedesktop.DBus", "Hello", "org.freedesktop.DBus", &[]);
        let mut downstream_here = downstream_here;
        downstream_here.write_all(&call).await.unwrap();

        let received = accept.await.unwrap();
        assert_eq!(received, call);

        drop(downstream_here);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn denies_matched_call_without_permission_entry() {
        let dir = tempdir();
        let broker_path = dir.join("broker.sock");
        let listener = UnixListener::bind(&broker_path).unwrap();

        let accept = tokio::spawn(async move {
            let _ = listener.accept().await.unwrap();
            // Hold the connection open but never read; the call under test
            // must not reach here.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut filter = Filter::new();
        filter.add_name("com.deepin.linglong.*");

        std::env::set_var("DBUS_PROXY_INTERCEPT", "1");
        let config = ProxyConfig::new(
            "com.example.app".into(),
            broker_path,
            PathBuf::from("/tmp/unused.sock"),
            filter,
            Some(PathBuf::from("/nonexistent/dbus_map_config")),
            Some(PathBuf::from("/nonexistent/dbus_proxy_config")),
        );
        std::env::remove_var("DBUS_PROXY_INTERCEPT");

        let (mut downstream_here, downstream_there) = UnixStream::pair().unwrap();
        let session = Session::new(config, downstream_there);
        let handle = tokio::spawn(session.run());

        let call = encode_method_call(
            5,
            "/com/deepin/linglong/PackageManager",
            "com.deepin.linglong.AppManager",
            "Install",
            "com.deepin.linglong.AppManager",
            &[],
        );
        downstream_here.write_all(&call).await.unwrap();

        let mut reply_buf = vec![0u8; 512];
        let n = downstream_here.read(&mut reply_buf).await.unwrap();
        let reply = &reply_buf[..n];
        let header = crate::wire::parse_header(reply).unwrap();

        assert_eq!(header.message_type, crate::wire::protocol::MessageType::ERROR);
        assert_eq!(header.reply_serial, Some(5));
        assert_eq!(header.error_name.as_deref(), Some(ACCESS_DENIED_ERROR));

        drop(downstream_here);
        let _ = accept.await;
        let _ = handle.await;
    }

    fn tempdir() -> PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut dir = std::env::temp_dir();
        dir.push(format!("dbus-sandbox-proxy-test-{}-{unique}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
