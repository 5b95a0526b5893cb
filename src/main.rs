use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, RateLimitingConfig, TollgateConfig};
use tollgate::gate::{default_app, GateServer, RequestGate};
use tollgate::net::AddressResolver;
use tollgate::ratelimit::{RateLimiter, Sweeper};

/// Per-client token bucket rate limiting gate.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Rules file, overrides the configuration file
    #[arg(short, long)]
    rules: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TollgateConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(rules) = cli.rules {
        config.rate_limiting.rules_path = Some(rules);
    }

    init_tracing(&config.logging);

    info!("Starting Tollgate Rate Limiting Gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Invalid rules abort startup
    let rules = config.rate_limiting.load_rules()?;
    let key_builder = config.rate_limiting.key_builder()?;
    let retention = config.rate_limiting.retention(&rules);
    info!(
        rules = rules.len(),
        retention_secs = retention.as_secs(),
        listen_addr = %config.server.listen_addr,
        "Configuration loaded"
    );

    let rate_limiter = Arc::new(RateLimiter::new());
    let mut gate = RequestGate::new(rules, rate_limiter.clone())
        .with_key_builder(key_builder)
        .with_resolver(AddressResolver::new(config.server.trust_proxy));
    if let Some(retention) = config.rate_limiting.fixed_retention() {
        gate = gate.with_retention(retention);
    }
    let gate = Arc::new(gate);

    // Retention follows reloaded rules unless pinned
    let sweep_gate = gate.clone();
    let sweeper = Sweeper::spawn(
        rate_limiter,
        config.rate_limiting.sweep_interval(),
        move || sweep_gate.retention(),
    );

    if let (Some(path), Some(interval)) = (
        config.rate_limiting.rules_path.clone(),
        config.rate_limiting.reload_interval(),
    ) {
        let inline = config.rate_limiting.clone();
        tokio::spawn(reload_rules(gate.clone(), inline, path, interval));
    }

    let server = GateServer::bind(config.server.listen_addr, gate, default_app()).await?;
    server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.shutdown();
    info!("Tollgate Rate Limiting Gate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Periodically re-read the rules file. A reload that fails validation
/// keeps the rules already in force.
async fn reload_rules(
    gate: Arc<RequestGate>,
    config: RateLimitingConfig,
    path: PathBuf,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; the rules were just loaded.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match config.load_rules() {
            Ok(rules) if *gate.rules() == rules => {}
            Ok(rules) => {
                let count = rules.len();
                gate.set_rules(rules);
                info!(
                    path = %path.display(),
                    rules = count,
                    retention_secs = gate.retention().as_secs(),
                    "Rules reloaded"
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Rules reload failed, keeping previous rules");
            }
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
