//! # BlueLink Bridge
//!
//! Drive Arduino pins, PWM outputs and stepper motors from a game controller.
//!
//! # Usage
//!
//! ```text
//! bluelink-bridge [CONFIG]                      run the bridge
//! bluelink-bridge --list-ports                  list serial ports
//! bluelink-bridge --upload BOARD FILE [CONFIG]  flash a .ino or .hex onto a board
//! ```
//!
//! `CONFIG` defaults to `config/default.toml`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use bluelink_bridge::config::{Config, ControllerConfig, LoggingConfig};
use bluelink_bridge::controller::dualsense::EvdevSource;
use bluelink_bridge::firmware::ArduinoCli;
use bluelink_bridge::mapping::MappingStore;
use bluelink_bridge::router::{DispatchReport, EventRouter, RouterSettings};
use bluelink_bridge::serial::port_trait::TokioSerialOpener;
use bluelink_bridge::serial::{list_ports, LinkRegistry, LinkSettings};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Delay between attempts to find a controller
const CONTROLLER_RETRY: Duration = Duration::from_secs(2);

#[derive(Debug, PartialEq)]
enum Mode {
    Run { config: PathBuf },
    ListPorts,
    Upload { board: String, artifact: PathBuf, config: PathBuf },
}

fn parse_args(args: &[String]) -> Result<Mode> {
    let config_or_default = |arg: Option<&String>| {
        arg.map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    };

    match args.first().map(String::as_str) {
        Some("--list-ports") => Ok(Mode::ListPorts),
        Some("--upload") => {
            let (Some(board), Some(artifact)) = (args.get(1), args.get(2)) else {
                bail!("usage: bluelink-bridge --upload BOARD FILE [CONFIG]");
            };
            Ok(Mode::Upload {
                board: board.clone(),
                artifact: PathBuf::from(artifact),
                config: config_or_default(args.get(3)),
            })
        }
        Some(flag) if flag.starts_with("--") => bail!("unknown option {}", flag),
        _ => Ok(Mode::Run {
            config: config_or_default(args.first()),
        }),
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. The returned guard must be
/// kept alive for file logging to flush.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_ascii_lowercase()));

    let (file_layer, guard) = if config.dir.is_empty() {
        (None, None)
    } else {
        let appender = tracing_appender::rolling::daily(&config.dir, "bluelink-bridge.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

/// Keep one router path attached to a controller until shutdown.
///
/// Reopens the controller after it disconnects and keeps polling while
/// none is plugged in.
async fn supervise_controller(
    router: EventRouter,
    config: ControllerConfig,
    shutdown: watch::Receiver<bool>,
) {
    let mut waiting_logged = false;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match EvdevSource::open(&config) {
            Ok(source) => {
                waiting_logged = false;
                info!("Controller connected at {}", source.device_path().display());
                match router.run(source, shutdown.clone()).await {
                    Ok(stats) => info!("Controller path finished: {:?}", stats),
                    Err(e) => warn!("Controller path ended: {}", e),
                }
            }
            Err(e) if !waiting_logged => {
                info!("Waiting for controller ({})", e);
                waiting_logged = true;
            }
            Err(e) => debug!("Controller not available: {}", e),
        }

        // Ok means shutdown was requested or its sender is gone
        let mut shutdown = shutdown.clone();
        if tokio::time::timeout(CONTROLLER_RETRY, shutdown.wait_for(|stop| *stop))
            .await
            .is_ok()
        {
            return;
        }
    }
}

async fn log_reports(mut reports: mpsc::UnboundedReceiver<DispatchReport>) {
    while let Some(report) = reports.recv().await {
        match serde_json::to_string(&report) {
            Ok(json) => debug!("dispatch {}", json),
            Err(e) => warn!("Failed to serialize dispatch report: {}", e),
        }
    }
}

async fn build_registry(config: &Config) -> Arc<LinkRegistry> {
    let registry = Arc::new(LinkRegistry::new(
        Arc::new(TokioSerialOpener),
        LinkSettings::from(&config.serial),
    ));

    let summary = registry.sync(&config.boards).await;
    for error in &summary.rejected {
        warn!("Board not registered: {}", error);
    }
    info!("{} board(s) registered", summary.added.len());

    registry
}

async fn run(config: Config) -> Result<()> {
    let registry = build_registry(&config).await;
    if config.serial.connect_on_start {
        for error in registry.connect_all().await {
            warn!("{}", error);
        }
    }

    let store = MappingStore::new(config.mapping_table()?);
    info!("{} mapping(s) loaded", store.snapshot().len());

    let (report_tx, report_rx) = mpsc::unbounded_channel();
    tokio::spawn(log_reports(report_rx));

    let router = EventRouter::new(
        registry.clone(),
        store.subscribe(),
        RouterSettings::from(&config.router),
    )
    .with_reports(report_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(supervise_controller(
        router,
        config.controller.clone(),
        shutdown_rx,
    ));

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Received Ctrl+C, shutting down...");
    shutdown_tx.send_replace(true);
    registry.shutdown().await;
    if let Err(e) = supervisor.await {
        warn!("Controller supervisor failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn upload(config: Config, board: &str, artifact: &Path) -> Result<()> {
    let registry = build_registry(&config).await;
    let uploader = ArduinoCli::from_config(&config.firmware);

    let outcome = registry
        .upload_firmware(board, artifact, &uploader)
        .await
        .with_context(|| format!("Upload of {} to {} failed", artifact.display(), board))?;

    info!(
        "Uploaded {} to {}{}",
        artifact.display(),
        board,
        if outcome.compiled { " (compiled)" } else { "" }
    );
    if !outcome.output.is_empty() {
        println!("{}", outcome.output);
    }

    registry.shutdown().await;
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match parse_args(&args)? {
        Mode::ListPorts => {
            for port in list_ports().context("Failed to enumerate serial ports")? {
                println!("{}", port);
            }
            Ok(())
        }
        Mode::Upload { board, artifact, config } => {
            let config = load_config(&config)?;
            let _guard = init_logging(&config.logging);
            upload(config, &board, &artifact).await
        }
        Mode::Run { config } => {
            let config = load_config(&config)?;
            let _guard = init_logging(&config.logging);
            info!("BlueLink Bridge v{} starting...", env!("CARGO_PKG_VERSION"));
            run(config).await
        }
    }
}
