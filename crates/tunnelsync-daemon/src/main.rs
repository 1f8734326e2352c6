//! tunnelsync
//!
//! Brings up the local development stack behind ngrok, keeps the public URLs
//! validated and publishes them to DuckDNS.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use tunnelsync_core::{Config, RetryPolicy};
use tunnelsync_daemon::{EventBus, StartupCoordinator, TunnelDiscoverer, UrlMonitor};

#[derive(Parser, Debug)]
#[command(name = "tunnelsync")]
#[command(version, about = "tunnelsync - ngrok tunnel discovery and DuckDNS publishing")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start backend, frontend and tunnel, then keep the URLs in sync until
    /// interrupted.
    Start,
    /// Only run the URL monitoring loop against already running services.
    Monitor,
    /// Discover the current tunnels once and print them as JSON.
    Discover,
}

/// Overrides applied on top of the optional config file.
#[derive(clap::Args, Debug)]
struct Settings {
    /// JSON config file. Flags and environment variables take precedence.
    #[arg(long, global = true, env = "TUNNELSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Local frontend port [default: 3000]
    #[arg(long, global = true, env = "FRONTEND_PORT")]
    frontend_port: Option<u16>,

    /// Local backend port [default: 5000]
    #[arg(long, global = true, env = "BACKEND_PORT")]
    backend_port: Option<u16>,

    /// Port of the ngrok introspection API [default: 4040]
    #[arg(long, global = true, env = "NGROK_PORT")]
    ngrok_port: Option<u16>,

    /// Discovery attempts per monitoring tick [default: 10]
    #[arg(long, global = true, env = "RETRIES")]
    retries: Option<u32>,

    /// Delay between discovery attempts, in milliseconds [default: 3000]
    #[arg(long, global = true, env = "DELAY")]
    delay: Option<u64>,

    /// Seconds between monitoring ticks [default: 300]
    #[arg(long, global = true, env = "MONITOR_INTERVAL_SECS")]
    monitor_interval_secs: Option<u64>,

    /// Statically assigned public URL; skips tunnel discovery.
    #[arg(long, global = true, env = "NGROK_STATIC_URL")]
    static_url: Option<String>,

    /// Require DuckDNS credentials at startup.
    #[arg(long, global = true, env = "USE_DUCKDNS")]
    use_duckdns: bool,

    /// DuckDNS subdomain to publish the TXT record on.
    #[arg(long, global = true, env = "DUCKDNS_DOMAIN")]
    duckdns_domain: Option<String>,

    /// DuckDNS account token.
    #[arg(long, global = true, env = "DUCKDNS_TOKEN", hide_env_values = true)]
    duckdns_token: Option<String>,

    /// Backend project directory [default: ./backend]
    #[arg(long, global = true, env = "BACKEND_DIR")]
    backend_dir: Option<PathBuf>,

    /// Frontend project directory [default: ./frontend]
    #[arg(long, global = true, env = "FRONTEND_DIR")]
    frontend_dir: Option<PathBuf>,

    /// ngrok configuration file [default: ./ngrok.yml]
    #[arg(long, global = true, env = "NGROK_CONFIG")]
    ngrok_config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "TUNNELSYNC_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "TUNNELSYNC_LOG_JSON")]
    log_json: bool,
}

impl Settings {
    /// Resolve the final configuration: defaults, then file, then overrides.
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_file(path)?,
            None => Config::default(),
        };

        if let Some(port) = self.frontend_port {
            config.ports.frontend = port;
        }
        if let Some(port) = self.backend_port {
            config.ports.backend = port;
        }
        if let Some(port) = self.ngrok_port {
            config.ports.broker = port;
        }

        let retry = config.monitor_retry;
        config.monitor_retry = RetryPolicy::new(
            self.retries.unwrap_or(retry.max_attempts),
            self.delay.unwrap_or(retry.delay_ms),
        );
        if let Some(secs) = self.monitor_interval_secs {
            config.timeouts.monitor_interval_secs = secs;
        }

        if self.static_url.is_some() {
            config.static_url = self.static_url;
        }

        config.duckdns.enabled |= self.use_duckdns;
        if self.duckdns_domain.is_some() {
            config.duckdns.domain = self.duckdns_domain;
        }
        if self.duckdns_token.is_some() {
            config.duckdns.token = self.duckdns_token;
        }

        if let Some(dir) = self.backend_dir {
            config.services.backend_dir = dir;
        }
        if let Some(dir) = self.frontend_dir {
            config.services.frontend_dir = dir;
        }
        if let Some(path) = self.ngrok_config {
            config.services.ngrok_config = path;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
#[allow(clippy::print_stdout)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tunnelsync_core::tracing_init::init_tracing(
        &tunnelsync_core::tracing_init::default_filter(&cli.settings.log_level),
        cli.settings.log_json,
    );

    let config = cli.settings.into_config()?;
    let http = tunnelsync_daemon::http::build_client().context("failed to build HTTP client")?;
    let events = EventBus::new();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        frontend_port = config.ports.frontend,
        backend_port = config.ports.backend,
        broker_port = config.ports.broker,
        duckdns = config.duckdns.enabled,
        static_url = config.static_url.is_some(),
        "Starting tunnelsync"
    );

    match cli.command {
        Command::Start => {
            let mut coordinator = StartupCoordinator::new(config, http, events);
            coordinator.start().await?;
            shutdown_signal().await?;
            coordinator.stop_services().await;
        }
        Command::Monitor => {
            let monitor = UrlMonitor::from_config(&http, &config, events);
            monitor.start().await;
            shutdown_signal().await?;
            monitor.stop();
        }
        Command::Discover => {
            let discoverer = TunnelDiscoverer::from_config(http, &config);
            let endpoints = discoverer.discover().await?;
            println!("{}", serde_json::to_string_pretty(&endpoints)?);
        }
    }

    info!("tunnelsync stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }
    Ok(())
}
