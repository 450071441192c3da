//! Resilient session client - Main Entry Point
//!
//! Connects to a messaging server, keeps the configured subscriptions alive
//! across outages, and logs every lifecycle transition.

use clap::{Parser, Subcommand};
use resilient_session::config::ClientConfig;
use resilient_session::observability::{init_default_logging, init_logging, LogFormat};
use resilient_session::{ConnectionManager, MqttTransport, SessionState, SubscriptionRegistry};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};

/// Resilient publish/subscribe session client
#[derive(Parser)]
#[command(name = "resilient-session")]
#[command(about = "Keeps a pub/sub session and its subscriptions alive across outages")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe the configured selectors, log received values,
    /// and stay connected
    Run {
        /// Server URL, overriding the configuration file
        #[arg(long)]
        url: Option<String>,
    },
    /// Connect, run one diagnostic round-trip, and disconnect
    Check {
        /// Server URL, overriding the configuration file
        #[arg(long)]
        url: Option<String>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: &[&str] = &["session.toml", "config/session.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_cli_logging(cli.verbose) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting resilient-session v{}", env!("CARGO_PKG_VERSION"));

    let result = match load_configuration(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Run { url } => run_session(config, url).await,
            Commands::Check { url } => check_connection(config, url).await,
            Commands::Config { show } => handle_config_command(&config, show),
        },
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_cli_logging(verbose: u8) -> Result<(), Box<dyn std::error::Error>> {
    let level = match verbose {
        0 => return Ok(init_default_logging()?),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    init_logging(level, LogFormat::parse(&format), false)?;
    Ok(())
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    // Try default locations
    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create {}",
        DEFAULT_CONFIG_PATHS.join(" or ")
    )
    .into())
}

fn build_manager(config: &ClientConfig) -> Result<ConnectionManager, Box<dyn std::error::Error>> {
    let registry = SubscriptionRegistry::with_selectors(config.subscriptions.selectors.clone())?;
    Ok(ConnectionManager::with_registry(
        Arc::new(MqttTransport::new()),
        registry,
    ))
}

async fn run_session(
    config: ClientConfig,
    url: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = url.unwrap_or_else(|| config.session.url.clone());
    let manager = build_manager(&config)?;

    manager.connect(&url, &config).await?;
    info!(
        url = %url,
        selectors = manager.registry().len().await,
        "Session running"
    );

    // Set up signal handling for graceful shutdown
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut state = manager.watch_state();
    let mut messages = manager.messages();

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            closed = state.wait_for(|s| s.as_ref().is_some_and(SessionState::is_closed)) => {
                match closed {
                    Ok(state) => error!("Session closed permanently: {:?}", *state),
                    Err(_) => warn!("Session state channel closed"),
                }
                break;
            }
            received = messages.recv() => match received {
                Ok(message) => info!(
                    topic = %message.topic,
                    bytes = message.payload.len(),
                    retain = message.retain,
                    "Message received"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Message log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.close().await;
    Ok(())
}

async fn check_connection(
    config: ClientConfig,
    url: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = url.unwrap_or_else(|| config.session.url.clone());
    let manager = ConnectionManager::new(Arc::new(MqttTransport::new()));

    manager.connect(&url, &config).await?;
    let result = manager.test_connection().await;
    manager.close().await;

    let latency = result?;
    println!("{url}: round-trip {}ms", latency.as_millis());
    Ok(())
}

fn handle_config_command(
    config: &ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
