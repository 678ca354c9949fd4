//! Device Service (devsrv)
//!
//! Loads the device list, supervises every peripheral and logs barcode
//! events and status changes until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use common::logging::{init_logging, LogConfig};
use devsrv::core::config::DevsrvConfig;
use devsrv::core::transport::TransportFactory;
use devsrv::device::{DeviceEvent, DeviceRegistry};
use devsrv::runtime::DeviceService;
use devsrv::status::{
    FanoutPersistence, JsonlFileSink, LogNotificationSink, LogPersistenceSink, PersistenceSink,
    StatusPipeline,
};

const EVENT_QUEUE: usize = 256;
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Command-line arguments for devsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "devsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Kiosk Device Service",
    long_about = None
)]
struct Args {
    /// Configuration file (yaml, toml or json)
    #[arg(short = 'c', long, env = "DEVSRV_CONFIG", default_value = "config/devsrv.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Directory for rolling log files; overrides the config file
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Validation mode - print the effective configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let registry = DeviceRegistry::with_builtin();
    let config = DevsrvConfig::load(&args.config, &registry.keys())
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.validate {
        println!("{}", serde_yaml::to_string(&config)?);
        println!("Configuration is valid: {} device(s)", config.devices.len());
        return Ok(());
    }

    init_logging(&LogConfig {
        service_name: config.service.name.clone(),
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.service.log_level.clone()),
        log_dir: args.log_dir.clone().or_else(|| config.service.log_dir.clone()),
        ansi: !args.no_color,
    })?;
    info!(
        "Starting {} v{} with drivers: {}",
        config.service.name,
        env!("CARGO_PKG_VERSION"),
        registry.keys().join(", ")
    );

    let shutdown = common::shutdown::shutdown_token();

    let persistence: Arc<dyn PersistenceSink> = match &config.status.persistence_file {
        Some(path) => {
            info!("Persisting status changes to {}", path.display());
            Arc::new(FanoutPersistence::new(vec![
                Arc::new(LogPersistenceSink),
                Arc::new(JsonlFileSink::new(path.clone())),
            ]))
        },
        None => Arc::new(LogPersistenceSink),
    };
    let mut status = StatusPipeline::spawn(
        &config.status,
        Arc::new(LogNotificationSink),
        persistence,
        shutdown.clone(),
    )?;

    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel::<DeviceEvent>(EVENT_QUEUE);
    let service = DeviceService::start(
        config.devices.clone(),
        TransportFactory::new(),
        registry,
        Arc::clone(&status.pipeline),
        events_tx,
        &shutdown,
    )?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(event) = events_rx.recv() => match &event {
                DeviceEvent::Barcode { device, symbology, data } => {
                    info!("[{}] Barcode ({}): {}", device, symbology, data);
                },
            },
            Some(snapshot) = status.changes.recv() => {
                debug!(
                    "[{}] {:?}, {} alert(s)",
                    snapshot.name,
                    snapshot.health,
                    snapshot.alerts.len()
                );
            },
        }
    }

    service.stop(STOP_TIMEOUT).await;
    for worker in status.workers.drain(..) {
        let _ = tokio::time::timeout(STOP_TIMEOUT, worker).await;
    }
    info!("{} stopped", config.service.name);
    Ok(())
}
