//! MQTT connection pool service - Main Entry Point
//!
//! Loads configuration, connects the configured brokers and serves the control
//! API until SIGINT or SIGTERM.

use clap::{Parser, Subcommand};
use mqtt_pool::api::ControlApi;
use mqtt_pool::broker::BrokerRegistry;
use mqtt_pool::config::AppConfig;
use mqtt_pool::dispatcher::LoggingDispatcher;
use mqtt_pool::observability::init_default_logging;
use mqtt_pool::pool::ConnectionPool;
use mqtt_pool::transport::mqtt::MqttTransportFactory;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Multi-broker MQTT connection pool
#[derive(Parser)]
#[command(name = "mqtt-pool")]
#[command(about = "Multi-broker MQTT connection pool with supervised reconnection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect configured brokers and serve the control API
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-pool v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_pool(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            AppConfig::load_from_file(path)?
        }
        None => {
            let default_paths = ["mqtt-pool.toml", "config/mqtt-pool.toml"];

            match default_paths
                .iter()
                .map(PathBuf::from)
                .find(|path| path.exists())
            {
                Some(path) => {
                    info!("Loading configuration from: {}", path.display());
                    AppConfig::load_from_file(&path)?
                }
                None => {
                    warn!("No configuration file found, using defaults");
                    AppConfig::default()
                }
            }
        }
    };

    config.apply_env_overrides()?;
    Ok(config)
}

fn handle_config_command(
    config: &AppConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

async fn run_pool(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let bind: IpAddr = config.server.bind.parse()?;
    let addr = SocketAddr::new(bind, config.server.port);

    let registry = Arc::new(BrokerRegistry::new());
    let pool = Arc::new(ConnectionPool::new(
        Arc::new(MqttTransportFactory),
        Arc::new(LoggingDispatcher::new()),
        config.reconnect.policy(),
        config.transport.settings(),
    ));

    connect_configured_brokers(&config, &registry, &pool).await?;

    let api = Arc::new(ControlApi::new(registry, pool.clone()));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(api.serve(addr, async move {
        let _ = shutdown_rx.await;
    }));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Connection pool is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    let _ = shutdown_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Control API error: {}", e),
        Err(e) => error!("Control API task failed: {}", e),
    }

    pool.shutdown().await;
    Ok(())
}

/// Register and connect every `[[brokers]]` entry, then subscribe its topics
async fn connect_configured_brokers(
    config: &AppConfig,
    registry: &BrokerRegistry,
    pool: &ConnectionPool,
) -> Result<(), Box<dyn std::error::Error>> {
    for section in &config.brokers {
        let broker = section.to_broker()?;
        registry.add(broker.clone()).await;
        pool.connect(&broker).await?;

        if section.topics.is_empty() {
            continue;
        }
        if let Err(e) = pool.add_listeners(&broker.id, &section.topics).await {
            error!(
                broker_id = %broker.id,
                address = %broker.address(),
                "Failed to subscribe configured topics: {}",
                e
            );
        }
    }

    info!(brokers = config.brokers.len(), "Configured brokers connected");
    Ok(())
}
