//! Fire-and-forget reporting of observed D-Bus usage to an operator-side
//! collection endpoint, so the policy team can see what triples a sandboxed
//! app actually exercises. Never allowed to block or fail a session.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::ProxyConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct UsageReport<'a> {
    #[serde(rename = "appId")]
    app_id: &'a str,
    name: &'a str,
    path: &'a str,
    interface: &'a str,
}

/// Report one observed `(destination, path, interface)` triple. Spawns its
/// own detached task so the caller's session loop is never blocked by the
/// network round trip.
pub fn report(config: Arc<ProxyConfig>, name: String, path: String, interface: String) {
    if name.is_empty() && path.is_empty() && interface.is_empty() {
        return;
    }

    tokio::spawn(async move {
        let Some(base_url) = config.telemetry_base_url().await else {
            return;
        };

        let url = format!("{base_url}/apps/adddbusproxy");
        let report = UsageReport {
            app_id: &config.app_id,
            name: &name,
            path: &path,
            interface: &interface,
        };

        let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
            Ok(client) => client,
            Err(error) => {
                tracing::warn!(%error, "failed to build telemetry client");
                return;
            }
        };

        tracing::debug!(%url, "reporting observed dbus usage");

        if let Err(error) = client.post(&url).json(&report).send().await {
            tracing::warn!(%url, %error, "failed to report dbus usage");
        }
    });
}
