//! relaymq - Bidirectional MQTT message relay
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: relaymq.toml)
//!   -a, --address <ADDR>   Broker address override (host:port)
//!   --client-id <ID>       Client identifier override
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use relaymq::config::Config;
use relaymq::connection::{Command, ConnectionManager};
use relaymq::metrics::{Metrics, MetricsServer};
use relaymq::protocol::QoS;
use relaymq::relay::{PublishDispatcher, RelayEngine};
use relaymq::routing::RoutingTable;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// relaymq - Bidirectional MQTT message relay
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(version = "0.1.0")]
#[command(about = "Bidirectional MQTT message relay between two peers")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "relaymq.toml")]
    config: PathBuf,

    /// Broker address override (host:port)
    #[arg(short, long)]
    address: Option<String>,

    /// Client identifier override
    #[arg(long)]
    client_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // CLI args override file config
    if let Some(address) = args.address {
        config.broker.address = address;
    }
    if let Some(client_id) = args.client_id {
        config.broker.client_id = client_id;
    }

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let routes = match RoutingTable::build(&config.routes(), config.topics.case_insensitive) {
        Ok(routes) => routes,
        Err(e) => {
            eprintln!("Invalid route configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting relaymq");
    info!("  Broker: {}", config.broker.address);
    info!("  Client id: {}", config.broker.client_id);
    info!("  Inbound QoS: {}", config.topics.qos);
    info!("  Routes:");
    for route in config.routes() {
        info!("    {} -> {}", route.origin, route.destination);
    }

    let metrics = Arc::new(Metrics::new());

    if config.metrics.enabled {
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
        let metrics_server = MetricsServer::new(metrics.clone(), config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    // qos is validated to 0 or 1 at config load
    let publish_qos = QoS::from_u8(config.topics.qos).unwrap_or(QoS::AtLeastOnce);

    let (command_tx, command_rx) = mpsc::channel(config.relay.command_queue_capacity);
    let dispatcher = Arc::new(PublishDispatcher::new(
        command_tx.clone(),
        config.relay.max_inflight_publishes,
        config.relay.publish_timeout,
        publish_qos,
        metrics.clone(),
    ));
    let engine = Arc::new(RelayEngine::new(routes, dispatcher, metrics.clone()));
    let manager = ConnectionManager::new(&config, engine, metrics);

    let mut connection = tokio::spawn(manager.run(command_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = command_tx.send(Command::Shutdown).await;
            let _ = (&mut connection).await;
        }
        result = &mut connection => {
            // The connection task only exits on its own when the broker
            // keeps refusing the credentials
            if let Err(e) = result {
                error!("Connection task failed: {}", e);
            }
            std::process::exit(1);
        }
    }

    info!("relaymq stopped");
    Ok(())
}
