use std::path::PathBuf;

use clap::Parser;

use dbus_sandbox_proxy::config::{BusKind, ProxyConfig};
use dbus_sandbox_proxy::filter::Filter;
use dbus_sandbox_proxy::listener;

/// Per-application D-Bus filtering proxy.
///
/// Accepts a sandboxed application's connection on `socket_path`, relays it
/// to the session or system broker, and gates any message matching the
/// configured rule lists behind consent when `DBUS_PROXY_INTERCEPT` is set.
#[derive(Debug, Parser)]
#[command(name = "dbus-sandbox-proxy")]
struct Cli {
    /// Sandbox application id, used as the subject of consent requests.
    app_id: String,

    /// Which broker to relay to.
    #[arg(value_enum)]
    bus: CliBusKind,

    /// Unix socket path the sandboxed application connects to.
    socket_path: PathBuf,

    /// Comma-separated destination-name rules.
    #[arg(default_value = "")]
    name_filters: String,

    /// Comma-separated object-path rules.
    #[arg(default_value = "")]
    path_filters: String,

    /// Comma-separated interface rules.
    #[arg(default_value = "")]
    interface_filters: String,

    /// Override the permission map path (mainly for testing).
    #[arg(long, hide = true)]
    permission_map_path: Option<PathBuf>,

    /// Override the telemetry config path (mainly for testing).
    #[arg(long, hide = true)]
    telemetry_config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliBusKind {
    Session,
    System,
}

impl From<CliBusKind> for BusKind {
    fn from(value: CliBusKind) -> Self {
        match value {
            CliBusKind::Session => BusKind::Session,
            CliBusKind::System => BusKind::System,
        }
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.socket_path.as_os_str().is_empty() {
        tracing::error!("dbus proxy socketPath err");
        return std::process::ExitCode::FAILURE;
    }

    let bus: BusKind = cli.bus.into();
    let broker_path = bus.default_broker_path();
    tracing::info!(path = %broker_path.display(), "dbus proxy daemonPath");

    let mut filter = Filter::with_default_rules();
    filter.extend_names_csv(&cli.name_filters);
    filter.extend_paths_csv(&cli.path_filters);
    filter.extend_interfaces_csv(&cli.interface_filters);
    tracing::info!(config = %filter.dump_config(), "dbus proxy filter config");

    // Ask to be killed if our parent dies before we do; this process is
    // meaningless without the sandbox runtime that spawned it.
    #[cfg(target_os = "linux")]
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
    }

    let config = ProxyConfig::new(
        cli.app_id,
        broker_path,
        cli.socket_path,
        filter,
        cli.permission_map_path,
        cli.telemetry_config_path,
    );

    if let Err(error) = listener::serve(config).await {
        tracing::error!(%error, "dbus proxy listener failed");
        return std::process::ExitCode::FAILURE;
    }

    std::process::ExitCode::SUCCESS
}
