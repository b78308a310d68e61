use bridgegate::app;
use bridgegate::config::{config_path, Config};
use bridgegate::shutdown::{install_signal_handlers, ShutdownHandle};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bridgegate=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Gateway failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<u8> {
    let lookup = |name: &str| std::env::var(name).ok();
    let path = config_path(std::env::args().nth(1), &lookup);

    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Handlers go in first so a signal during startup still stops every backend
    let handle = ShutdownHandle::new();
    let signals = install_signal_handlers(handle.clone())?;
    let gateway = match app::start(config, handle).await {
        Ok(gateway) => gateway,
        Err(e) => {
            signals.abort();
            return Err(e);
        }
    };

    let code = gateway.wait().await;
    signals.abort();
    Ok(code)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        gateway = %config.gateway.name,
        bind = %config.gateway.bind,
        port = config.gateway.port,
        backend_host = %config.gateway.backend_host,
        startup_policy = ?config.gateway.startup_policy,
        "Gateway configuration"
    );
    info!(
        attempt_timeout_ms = config.readiness.attempt_timeout_ms,
        interval_ms = config.readiness.interval_ms,
        max_attempts = config.readiness.max_attempts,
        "Readiness settings"
    );
    info!(
        pool_max_idle = config.upstream.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.upstream.pool_idle_timeout_secs,
        connect_timeout_ms = config.upstream.connect_timeout_ms,
        "Upstream connection settings"
    );
    info!(
        server_count = config.servers.len(),
        servers = ?config.servers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "Configured servers"
    );
}
