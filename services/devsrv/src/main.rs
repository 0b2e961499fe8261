//! Device Service (devsrv)
//!
//! - `run`: collect rack temperatures until SIGINT/SIGTERM
//! - `detect`: probe a temperature sensor
//! - `shutdown`: run one ordered rack shutdown and wait for it

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use common::logging::{self, LogConfig};
use common::shutdown::shutdown_token;
use errors::FacilityError;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use devsrv::collaborators::{BroadcastPublisher, EventPublisher, SshCommandShell};
use devsrv::devices::{BreakerService, SensorProtocol, TemperatureCollector};
use devsrv::protocols::modbus::{SessionFactory, TcpSessionFactory};
use devsrv::shutdown::{DeviceStepExecutor, ShutdownOrchestrator};
use devsrv::{DevSrvError, DevsrvConfig, ErrorExt, Result};

#[derive(Parser)]
#[command(name = "devsrv")]
#[command(about = "Rack device service: breakers, temperature sensors and ordered shutdown")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Console log level, overrides the configured one
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect temperatures from configured sensors until stopped
    Run,

    /// Probe a temperature sensor and print what was found
    Detect {
        /// Sensor IP address
        address: String,

        /// Modbus TCP port
        port: u16,

        /// Modbus station (unit id)
        #[arg(short, long, default_value_t = 1)]
        station: u8,
    },

    /// Shut servers down, wait, then cut the breaker feeding them
    Shutdown {
        /// Sequence name
        #[arg(short, long)]
        name: String,

        /// Breaker id from the configuration
        #[arg(short, long)]
        breaker: u64,

        /// Server id from the configuration; repeat for several servers
        #[arg(short, long = "server")]
        servers: Vec<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let err = FacilityError::from(e);
            error!("{}", err);
            eprintln!("Error: {err}");
            ExitCode::from(err.exit_code() as u8)
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = DevsrvConfig::load(cli.config.as_deref())?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let mut log_config = LogConfig::console("devsrv", logging::parse_level(level));
    log_config.log_dir = config.log_dir();
    log_config.enable_json = config.logging.json;
    // Keep the guard alive so buffered file output is flushed on exit
    let _log_guard = logging::init_with_config(log_config)
        .config_error("failed to initialize logging")?;

    info!(
        "devsrv {} starting: {} servers, {} breakers, {} sensors",
        env!("CARGO_PKG_VERSION"),
        config.servers.len(),
        config.breakers.len(),
        config.sensors.len()
    );

    let factory: Arc<dyn SessionFactory> = Arc::new(TcpSessionFactory::new(
        config.modbus.connect_timeout(),
        config.modbus.request_timeout(),
    ));
    let publisher = Arc::new(BroadcastPublisher::new(1024));
    spawn_event_logger(&publisher);

    match cli.command {
        Commands::Run => run_collector(&config, factory, publisher).await,
        Commands::Detect {
            address,
            port,
            station,
        } => {
            let result = SensorProtocol::new(factory)
                .detect(&address, port, station)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        },
        Commands::Shutdown {
            name,
            breaker,
            servers,
        } => run_shutdown(&config, factory, publisher, &name, breaker, servers).await,
    }
}

/// Log published events until the publisher is dropped
fn spawn_event_logger(publisher: &BroadcastPublisher) {
    let mut events = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!("Event {}: {}", event.event_type, event.payload),
                Err(RecvError::Lagged(skipped)) => warn!("Event logger skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn run_collector(
    config: &DevsrvConfig,
    factory: Arc<dyn SessionFactory>,
    publisher: Arc<BroadcastPublisher>,
) -> Result<()> {
    let token = shutdown_token();

    let collector = if config.collector.enabled && !config.sensors.is_empty() {
        let collector = TemperatureCollector::new(
            factory,
            config.sensors.clone(),
            publisher,
            config.collector.interval(),
            config.collector.connect_policy(),
        );
        Some(tokio::spawn(collector.run(token.clone())))
    } else {
        info!("Temperature collection disabled or no sensors configured");
        None
    };

    info!("devsrv running, press Ctrl+C to stop");
    token.cancelled().await;

    if let Some(handle) = collector {
        if let Err(e) = handle.await {
            warn!("Collector task ended abnormally: {}", e);
        }
    }
    info!("devsrv stopped");
    Ok(())
}

async fn run_shutdown(
    config: &DevsrvConfig,
    factory: Arc<dyn SessionFactory>,
    publisher: Arc<BroadcastPublisher>,
    name: &str,
    breaker_id: u64,
    server_ids: Vec<u64>,
) -> Result<()> {
    let publisher: Arc<dyn EventPublisher> = publisher;
    let breakers = BreakerService::new(factory, config.breaker.timing(), publisher.clone());
    let shell = SshCommandShell::new(
        config.ssh.binary.clone(),
        Duration::from_secs(config.ssh.connect_timeout_secs),
        Duration::from_secs(config.ssh.command_timeout_secs),
    );
    let executor = DeviceStepExecutor::new(
        Arc::new(config.inventory()),
        Arc::new(shell),
        Arc::new(breakers),
        config.shutdown.command.clone(),
    );
    let orchestrator =
        ShutdownOrchestrator::new(Arc::new(executor), publisher, config.shutdown.settings());

    let sequence = orchestrator.create_sequence(name, breaker_id, server_ids)?;
    let mut handle = orchestrator.execute(sequence.id)?;
    let token = shutdown_token();

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = token.cancelled() => {
            warn!("Interrupted, cancelling sequence {}", sequence.id);
            if let Err(e) = orchestrator.cancel(sequence.id) {
                debug!("Cancel after completion ignored: {}", e);
            }
            handle.await
        },
    };
    let status =
        joined.map_err(|e| DevSrvError::state(format!("sequence task did not finish: {e}")))?;
    info!("Sequence {} finished: {:?}", sequence.id, status);

    let finished = orchestrator.get_sequence(sequence.id)?;
    println!("{}", serde_json::to_string_pretty(&finished)?);
    finished.outcome()
}
