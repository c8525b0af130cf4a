//! Process-wide configuration: the CLI-derived [`ProxyConfig`], and the two
//! JSON files it lazily loads on first use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::filter::Filter;

pub const DEFAULT_PERMISSION_MAP_PATH: &str = "/usr/share/permission/policy/linglong/dbus_map_config";
pub const DEFAULT_TELEMETRY_CONFIG_PATH: &str = "/deepin/linglong/config/dbus_proxy_config";

/// Which bus this proxy sits in front of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

impl BusKind {
    /// The broker's well-known socket path for this bus kind.
    pub fn default_broker_path(self) -> PathBuf {
        match self {
            BusKind::Session => {
                let uid = unsafe { libc::getuid() };
                PathBuf::from(format!("/run/user/{uid}/bus"))
            }
            BusKind::System => PathBuf::from("/run/dbus/system_bus_socket"),
        }
    }
}

/// One entry in the permission map: a D-Bus triple covered by a permission id.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionEntry {
    pub name: String,
    pub path: String,
    pub ifce: String,
}

#[derive(Debug, Deserialize)]
struct TelemetryFileConfig {
    #[serde(rename = "dbusDbUrl")]
    dbus_db_url: String,
}

/// Immutable, `Arc`-shared configuration assembled once at startup.
#[derive(Debug)]
pub struct ProxyConfig {
    pub app_id: String,
    pub broker_path: PathBuf,
    pub socket_path: PathBuf,
    pub filter: Filter,
    pub intercept_enabled: bool,
    pub permission_map_path: PathBuf,
    pub telemetry_config_path: PathBuf,

    permission_map: OnceCell<Option<HashMap<String, Vec<PermissionEntry>>>>,
    telemetry_base_url: OnceCell<Option<String>>,
}

impl ProxyConfig {
    pub fn new(
        app_id: String,
        broker_path: PathBuf,
        socket_path: PathBuf,
        filter: Filter,
        permission_map_path: Option<PathBuf>,
        telemetry_config_path: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            app_id,
            broker_path,
            socket_path,
            filter,
            intercept_enabled: std::env::var_os("DBUS_PROXY_INTERCEPT").is_some(),
            permission_map_path: permission_map_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PERMISSION_MAP_PATH)),
            telemetry_config_path: telemetry_config_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TELEMETRY_CONFIG_PATH)),
            permission_map: OnceCell::new(),
            telemetry_base_url: OnceCell::new(),
        })
    }

    /// Find the permission id covering this triple, loading and caching the
    /// permission map from disk on first call. A missing or corrupt file is
    /// logged once and treated as an empty map thereafter.
    pub async fn lookup_permission_id(&self, name: &str, path: &str, ifce: &str) -> Option<String> {
        let map = self
            .permission_map
            .get_or_init(|| async { load_permission_map(&self.permission_map_path).await })
            .await;

        let map = map.as_ref()?;

        map.iter()
            .find(|(_, entries)| {
                entries
                    .iter()
                    .any(|entry| entry.name == name && entry.path == path && entry.ifce == ifce)
            })
            .map(|(id, _)| id.clone())
    }

    /// The telemetry base URL, loaded and cached from the telemetry config
    /// file on first call.
    pub async fn telemetry_base_url(&self) -> Option<&str> {
        let url = self
            .telemetry_base_url
            .get_or_init(|| async { load_telemetry_base_url(&self.telemetry_config_path).await })
            .await;

        url.as_deref()
    }
}

async fn load_permission_map(path: &Path) -> Option<HashMap<String, Vec<PermissionEntry>>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to open permission map, treating as empty");
            return None;
        }
    };

    match serde_json::from_str(&contents) {
        Ok(map) => Some(map),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to parse permission map, treating as empty");
            None
        }
    }
}

async fn load_telemetry_base_url(path: &Path) -> Option<String> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(error) => {
            tracing::debug!(path = %path.display(), %error, "telemetry config not found, disabling telemetry");
            return None;
        }
    };

    match serde_json::from_str::<TelemetryFileConfig>(&contents) {
        Ok(config) => Some(config.dbus_db_url),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to parse telemetry config");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_permission_map_yields_none() {
        let config = ProxyConfig::new(
            "com.example.app".into(),
            PathBuf::from("/run/user/1000/bus"),
            PathBuf::from("/tmp/does-not-matter.sock"),
            Filter::new(),
            Some(PathBuf::from("/nonexistent/dbus_map_config")),
            Some(PathBuf::from("/nonexistent/dbus_proxy_config")),
        );

        assert_eq!(config.lookup_permission_id("a", "b", "c").await, None);
        assert_eq!(config.telemetry_base_url().await, None);
    }
}
