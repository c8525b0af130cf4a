//! Accepts downstream connections on the sandbox-facing Unix socket and
//! spawns one [`Session`] per accepted client.

use std::sync::Arc;

use tokio::net::UnixListener;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::session::Session;

/// Bind the sandbox-facing socket and accept connections until the process
/// is asked to shut down.
pub async fn serve(config: Arc<ProxyConfig>) -> Result<()> {
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    tracing::info!(path = %config.socket_path.display(), "listening for sandboxed clients");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                tracing::debug!("accepted a new sandbox client connection");

                let config = config.clone();
                tokio::spawn(async move {
                    Session::new(config, stream).run().await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal, stopping listener");
                return Ok(());
            }
        }
    }
}
