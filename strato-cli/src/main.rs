//! strato CLI
//!
//! One-command SOCKS5 proxy over a Warp MASQUE tunnel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use strato_engine::{Config, ProxyService};

#[derive(Parser)]
#[command(name = "strato")]
#[command(author, version, about = "SOCKS5 proxy over Cloudflare Warp's MASQUE tunnel", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SOCKS5 proxy over the MASQUE tunnel
    Proxy(ProxyArgs),
}

#[derive(Args)]
struct ProxyArgs {
    /// Bind address for the SOCKS5 proxy (overrides config file)
    #[arg(short, long)]
    bind_address: Option<String>,

    /// Port for the SOCKS5 proxy (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Username for SOCKS5 authentication (overrides config file)
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 authentication (overrides config file)
    #[arg(short = 'w', long)]
    password: Option<String>,

    /// Locale for registration
    #[arg(long, default_value = "en_US")]
    locale: String,

    /// Model reported at registration
    #[arg(long, default_value = "PC")]
    model: String,

    /// Device name for registration
    #[arg(long)]
    name: Option<String>,

    /// Team token for registration
    #[arg(long)]
    jwt: Option<String>,

    /// Automatically accept the terms of service
    #[arg(long, default_value_t = true)]
    accept_tos: bool,

    /// Reset the SOCKS and tunnel configuration to default values
    #[arg(long)]
    reset_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Proxy(args) => run_proxy(cli.config, args).await,
    }
}

async fn run_proxy(config_path: PathBuf, args: ProxyArgs) -> Result<()> {
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => bail!(
            "failed to load {}: {e}\nenroll this device first and point --config at the enrolled file",
            config_path.display()
        ),
    };

    init_logging(&config);

    if args.name.is_some() || args.jwt.is_some() {
        debug!(
            locale = %args.locale,
            model = %args.model,
            accept_tos = args.accept_tos,
            "registration flags are only used during enrollment"
        );
    }

    if args.reset_config {
        info!("Resetting SOCKS and tunnel configuration to default values");
        config.reset_proxy_sections();
        config
            .save(&config_path)
            .context("failed to save reset configuration")?;
        info!("Configuration reset saved to {}", config_path.display());
    }

    let mut config_changed = false;
    if let Some(bind_address) = args.bind_address {
        info!("Overriding bind address from command line: {bind_address}");
        config.socks.bind_address = bind_address;
        config_changed = true;
    }
    if let Some(port) = args.port {
        info!("Overriding port from command line: {port}");
        config.socks.port = port;
        config_changed = true;
    }
    if let Some(username) = args.username {
        info!("Overriding username from command line");
        config.socks.username = username;
        config_changed = true;
    }
    if let Some(password) = args.password {
        info!("Overriding password from command line");
        config.socks.password = password;
        config_changed = true;
    }
    if config_changed {
        if let Err(e) = config.save(&config_path) {
            warn!("Failed to save updated config: {e}");
        }
    }

    info!("Starting SOCKS5 proxy...");
    let service = ProxyService::new(config);
    let cancel = CancellationToken::new();
    let service_cancel = cancel.clone();
    let mut service_task = tokio::spawn(async move { service.run(service_cancel).await });

    tokio::select! {
        result = &mut service_task => {
            // The service only returns on its own for startup failures.
            let result = result.context("proxy service panicked")?;
            result.context("proxy startup failed")?;
            return Ok(());
        }
        _ = wait_for_shutdown() => {}
    }

    info!("Shutting down...");
    cancel.cancel();
    match tokio::time::timeout(Duration::from_secs(5), service_task).await {
        Ok(result) => {
            result.context("proxy service panicked")??;
        }
        Err(_) => warn!("Proxy did not shut down within 5s, exiting anyway"),
    }
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.output_path.is_empty() {
        registry.with(tracing_subscriber::fmt::layer()).init();
        return;
    }

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.logging.output_path)
    {
        Ok(file) => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        Err(e) => {
            registry.with(tracing_subscriber::fmt::layer()).init();
            warn!(
                "Failed to open log file {}: {e}; logging to stderr",
                config.logging.output_path
            );
        }
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C");
    }
}
