//! vrd - voltage regulation daemon.
//!
//! Owns chassis power sequencing and regulator configuration/monitoring on
//! the BMC. One control task drives everything: a periodic tick monitors the
//! sequencer devices, publishes rail sensors, and reacts to power requests
//! queued by the D-Bus interface.

mod dbus;

use anyhow::{Context, Result};
use clap::Parser;
use dbus::{Command, PowerInterface, Status};
use serde::Deserialize;
use services::{AdditionalData, MonitorOptions, Services};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use types::{PowerGood, PowerState, Severity};

/// Error logged when a power-on attempt exceeds the pgood timeout and no
/// faulted rail could be identified.
const POWER_ON_TIMEOUT_ERROR: &str = "xyz.openbmc_project.Power.Error.PowerOnTimeout";

/// Error logged when pgood drops while powered on and no faulted rail could
/// be identified.
const SHUTDOWN_ERROR: &str = "xyz.openbmc_project.Power.Error.Shutdown";

/// Configuration file structure (vrd.toml).
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    sequencer: SequencerFileConfig,
    regulators: RegulatorsFileConfig,
    monitor: MonitorFileConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SequencerFileConfig {
    /// Explicit config file path; overrides discovery.
    config_file: Option<PathBuf>,
    /// Directory searched during config file discovery.
    config_dir: PathBuf,
    /// Compatible system types, most specific first.
    compatible_system_types: Vec<String>,
}

impl Default for SequencerFileConfig {
    fn default() -> Self {
        Self {
            config_file: None,
            config_dir: PathBuf::from(sequencer::config::STANDARD_CONFIG_FILE_DIR),
            compatible_system_types: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RegulatorsFileConfig {
    config_file: PathBuf,
}

impl Default for RegulatorsFileConfig {
    fn default() -> Self {
        Self {
            config_file: Path::new(regulators::config::STANDARD_CONFIG_FILE_DIR)
                .join("regulators.json"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MonitorFileConfig {
    interval_ms: u64,
    pgood_timeout_secs: u64,
}

impl Default for MonitorFileConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            pgood_timeout_secs: 10,
        }
    }
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }
}

#[derive(Parser)]
#[command(name = "vrd", about = "Voltage regulation daemon")]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long, default_value = "/etc/vrd/vrd.toml")]
    config: PathBuf,

    /// Power sequencer config file. Overrides the daemon configuration.
    #[arg(long)]
    sequencer_config: Option<PathBuf>,

    /// Regulators config file. Overrides the daemon configuration.
    #[arg(long)]
    regulators_config: Option<PathBuf>,

    /// Run against simulated hardware (no real I2C/GPIO/D-Bus services)
    #[arg(long)]
    sim: bool,

    /// Log directory for text logs
    #[arg(long, default_value = "/var/log/vrd")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The guard must live for the whole program so logs are flushed
    let _log_guard = init_logging(&args.log_dir, &args.log_level)?;

    let file_config = FileConfig::load(&args.config)?;
    info!(path = %args.config.display(), "Loaded config");

    let mut services: Box<dyn Services> = if args.sim {
        info!("Starting vrd in SIMULATION mode");
        Box::new(sim::SimServices::new())
    } else {
        Box::new(services::HostServices::new().context("Unable to connect to system services")?)
    };

    // Locate and parse the power sequencer configuration
    let sequencer_path = args
        .sequencer_config
        .or(file_config.sequencer.config_file)
        .or_else(|| {
            jsonutil::find_config_file(
                &file_config.sequencer.compatible_system_types,
                &file_config.sequencer.config_dir,
            )
        })
        .context("No power sequencer config file found")?;
    info!(path = %sequencer_path.display(), "Parsing power sequencer config");
    let chassis =
        sequencer::config::parse(&sequencer_path, MonitorOptions::all(), &mut *services)?;
    let mut seq_system = sequencer::System::new(chassis);
    seq_system.initialize_monitoring(&mut *services);
    seq_system.set_pgood_timeout(Duration::from_secs(file_config.monitor.pgood_timeout_secs));

    // Parse the regulators configuration, if present
    let regulators_path = args
        .regulators_config
        .unwrap_or(file_config.regulators.config_file);
    let mut reg_system = if regulators_path.is_file() {
        info!(path = %regulators_path.display(), "Parsing regulators config");
        let mut factory = i2c_factory(args.sim);
        Some(regulators::config::parse(
            &regulators_path,
            &mut *factory,
            &mut *services,
        )?)
    } else {
        info!(path = %regulators_path.display(), "No regulators config file; regulator configuration disabled");
        None
    };

    // Command channel from the D-Bus interface to the control loop
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(32);
    let status = Arc::new(Mutex::new(Status {
        pgood_timeout: file_config.monitor.pgood_timeout_secs as i32,
        ..Default::default()
    }));

    // Serve the control interface. In sim mode, or if the bus is not
    // reachable, run without it.
    let connection = if args.sim {
        None
    } else {
        match zbus::connection::Builder::system()
            .and_then(|builder| builder.name(dbus::BUS_NAME))
            .and_then(|builder| {
                builder.serve_at(
                    dbus::OBJECT_PATH,
                    PowerInterface::new(cmd_tx.clone(), Arc::clone(&status)),
                )
            }) {
            Ok(builder) => match builder.build().await {
                Ok(connection) => {
                    info!(name = dbus::BUS_NAME, "Serving power control interface");
                    Some(connection)
                }
                Err(e) => {
                    warn!(?e, "Unable to serve D-Bus interface - continuing without it");
                    None
                }
            },
            Err(e) => {
                warn!(?e, "Unable to configure D-Bus interface - continuing without it");
                None
            }
        }
    };
    let iface_ref = match &connection {
        Some(connection) => connection
            .object_server()
            .interface::<_, PowerInterface>(dbus::OBJECT_PATH)
            .await
            .ok(),
        None => None,
    };

    // Configure regulators once at startup
    if let Some(reg_system) = &mut reg_system {
        reg_system.configure(&mut *services);
    }

    let mut interval =
        tokio::time::interval(Duration::from_millis(file_config.monitor.interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut power_supply_error = String::new();
    let mut previous_pgood: Option<PowerGood> = None;
    let mut transition_start: Option<Instant> = None;
    let mut pgood_fault_logged = false;

    info!("Entering control loop");
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }

        // Process queued control requests
        while let Ok(command) = cmd_rx.try_recv() {
            match command {
                Command::SetPowerState { state, reply } => {
                    let new_state = PowerState::from_int(state).expect("validated by interface");
                    let result = seq_system.set_power_state(new_state, &mut *services);
                    match result {
                        Ok(()) => {
                            info!(state = %new_state, "Power state change requested");
                            transition_start = Some(Instant::now());
                            pgood_fault_logged = false;
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            error!(%e, "Power state change rejected");
                            let _ = reply.send(Err(e.to_string()));
                        }
                    }
                }
                Command::SetPowerSupplyError { error } => {
                    info!(error, "Power supply error received");
                    power_supply_error = error;
                }
                Command::SetPgoodTimeout { seconds } => {
                    info!(seconds, "Power good timeout changed");
                    seq_system.set_pgood_timeout(Duration::from_secs(seconds.max(0) as u64));
                    status.lock().unwrap().pgood_timeout = seconds;
                }
            }
        }

        // Monitor the sequencer devices
        if let Err(e) = seq_system.monitor(&mut *services) {
            error!(%e, "Unable to monitor system");
            continue;
        }
        let pgood = seq_system.power_good().ok();
        let state = seq_system.power_state().ok();

        {
            let mut status = status.lock().unwrap();
            if let Some(pgood) = pgood {
                status.pgood = pgood.as_int();
            }
            if let Some(state) = state {
                status.state = state.as_int();
            }
        }

        // React to pgood transitions
        if pgood != previous_pgood {
            if let Some(pgood) = pgood {
                handle_pgood_transition(
                    pgood,
                    &mut reg_system,
                    &mut *services,
                    iface_ref.as_ref(),
                )
                .await;
            }
            previous_pgood = pgood;
        }

        // A completed transition ends the timeout window
        if state.map(PowerState::as_int) == pgood.map(PowerGood::as_int) {
            transition_start = None;
        }

        // Look for a pgood fault when power is requested on but not good
        if state == Some(PowerState::On) && pgood == Some(PowerGood::Off) && !pgood_fault_logged {
            let timed_out = transition_start
                .map(|start| start.elapsed() >= max_pgood_timeout(&seq_system))
                .unwrap_or(true);
            if timed_out {
                handle_pgood_failure(
                    &mut seq_system,
                    &mut *services,
                    &power_supply_error,
                    transition_start.is_some(),
                );
                pgood_fault_logged = true;
                transition_start = None;
            }
        }

        // Publish rail sensors while power is good
        if pgood == Some(PowerGood::On) {
            if let Some(reg_system) = &mut reg_system {
                reg_system.monitor_sensors(&mut *services);
            }
        }
    }

    if let Some(reg_system) = &mut reg_system {
        reg_system.close_devices(&mut *services);
    }
    for chassis in seq_system.chassis_mut() {
        chassis.close_devices();
    }
    Ok(())
}

/// Largest configured chassis pgood timeout; bounds a system transition.
fn max_pgood_timeout(seq_system: &sequencer::System) -> Duration {
    seq_system
        .chassis()
        .iter()
        .map(|chassis| chassis.pgood_timeout())
        .max()
        .unwrap_or(sequencer::DEFAULT_PGOOD_TIMEOUT)
}

/// Reconfigures regulators and toggles sensor publication when the system
/// power good changes, and emits the D-Bus signals.
async fn handle_pgood_transition(
    pgood: PowerGood,
    reg_system: &mut Option<regulators::System>,
    services: &mut dyn Services,
    iface_ref: Option<&zbus::object_server::InterfaceRef<PowerInterface>>,
) {
    match pgood {
        PowerGood::On => {
            info!("System power good");
            if let Some(reg_system) = reg_system {
                reg_system.clear_caches();
                reg_system.configure(services);
                services.sensors().enable();
            }
            if let Some(iface_ref) = iface_ref {
                if let Err(e) = PowerInterface::power_good(iface_ref.signal_emitter()).await {
                    warn!(?e, "Unable to emit PowerGood signal");
                }
            }
        }
        PowerGood::Off => {
            info!("System power lost");
            if let Some(reg_system) = reg_system {
                services.sensors().disable();
                reg_system.close_devices(services);
            }
            if let Some(iface_ref) = iface_ref {
                if let Err(e) = PowerInterface::power_lost(iface_ref.signal_emitter()).await {
                    warn!(?e, "Unable to emit PowerLost signal");
                }
            }
        }
    }
}

/// Identifies and logs the root cause after a failed power-on or a pgood
/// loss.
fn handle_pgood_failure(
    seq_system: &mut sequencer::System,
    services: &mut dyn Services,
    power_supply_error: &str,
    timed_out: bool,
) {
    let mut additional_data = AdditionalData::new();
    let error = seq_system
        .find_pgood_fault(services, power_supply_error, &mut additional_data)
        .unwrap_or_else(|e| {
            error!(%e, "Pgood fault detection failed");
            String::new()
        });

    let message = if !error.is_empty() {
        error
    } else if !power_supply_error.is_empty() {
        power_supply_error.to_string()
    } else if timed_out {
        POWER_ON_TIMEOUT_ERROR.to_string()
    } else {
        SHUTDOWN_ERROR.to_string()
    };

    error!(message, "Power good failure");
    services.log_event(&message, Severity::Critical, additional_data);
}

/// Produces I2C handles for configured regulator devices.
fn i2c_factory(simulated: bool) -> Box<dyn FnMut(u8, u16) -> Box<dyn i2c::I2c>> {
    if simulated {
        Box::new(|bus, address| Box::new(sim::SimI2c::new(bus, address)) as Box<dyn i2c::I2c>)
    } else {
        Box::new(|bus, address| Box::new(i2c::LinuxI2c::new(bus, address)) as Box<dyn i2c::I2c>)
    }
}

/// Initializes logging with stdout and rolling file output.
fn init_logging(
    log_dir: &Path,
    level: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Cannot create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "vrd.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vrd={level},sequencer={level},regulators={level}")));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
