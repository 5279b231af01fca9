use clap::{Parser, ValueEnum};
use hostmux::config::{CompiledConfig, Config, ListenerMode};
use hostmux::supervisor::Supervisor;
use hostmux::tls::{CertCache, CertificateProvider};
use hostmux::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hostmux")]
#[command(about = "Host-based reverse-proxy router")]
#[command(version)]
struct Cli {
    /// Configuration file (.json, otherwise TOML)
    config: PathBuf,

    /// Validate the configuration and exit without binding any port
    #[arg(long)]
    check: bool,

    /// Log level for this crate; RUST_LOG applies when unset
    #[arg(short = 'l', long)]
    log_level: Option<LogLevel>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}=info", PKG_NAME)));
    if let Some(level) = cli.log_level {
        filter = filter.add_directive(format!("{}={}", PKG_NAME, level.as_str()).parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli.config).map_err(|e| {
        error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
        e
    })?;
    let config = config.compile().map_err(|e| {
        error!(path = %cli.config.display(), error = %e, "Invalid configuration");
        e
    })?;

    info!(path = %cli.config.display(), "Configuration loaded");
    print_startup_banner(&config);

    if cli.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let provider: Option<Arc<dyn CertificateProvider>> = match &config.certs {
        Some(path) => {
            let cache = CertCache::initialize(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load certificates");
                e
            })?;
            if !config.needs_tls() {
                warn!(path = %path.display(), "Certificate path configured but no server enables TLS");
            }
            Some(Arc::new(cache) as Arc<dyn CertificateProvider>)
        }
        None => None,
    };

    let supervisor = Supervisor::new(config, provider)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx));

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        result = &mut supervisor_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "Supervisor stopped");
                    Err(e.into())
                }
                Err(e) => Err(e.into()),
            };
        }
    }

    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(5), supervisor_handle).await {
        Ok(_) => info!("Shutdown complete"),
        Err(_) => warn!("Listeners did not stop within 5 seconds"),
    }

    Ok(())
}

fn print_startup_banner(config: &CompiledConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting router");
    info!(
        bind = %config.bind,
        servers = config.servers.len(),
        certs = ?config.certs,
        request_timeout_secs = config.forward.request_timeout.as_secs(),
        "Router configuration"
    );
    info!(
        pool_max_idle = config.forward.max_idle_per_host,
        pool_idle_timeout_secs = config.forward.idle_timeout.as_secs(),
        "Connection pool settings"
    );

    for server in &config.servers {
        match server.mode() {
            ListenerMode::Static => {
                let root = server.static_root.as_ref().map(|r| r.path.display().to_string());
                info!(port = server.port, tls = server.tls, root = ?root, "Static server");
            }
            ListenerMode::Proxy => {
                info!(port = server.port, tls = server.tls, rules = server.rules.len(), "Proxy server");
            }
        }
    }
}
