//! vrctl - command-line interface for the voltage regulation daemon.
//!
//! Usage:
//!   vrctl status
//!   vrctl on
//!   vrctl off
//!   vrctl set-timeout 30
//!   vrctl set-power-supply-error xyz.openbmc_project.Power.PowerSupply.Error.PSKillFault

use anyhow::Result;
use clap::{Parser, Subcommand};
use zbus::proxy;

/// Power control interface served by vrd.
#[proxy(
    interface = "org.openbmc.control.Power",
    default_service = "org.openbmc.control.Power",
    default_path = "/org/openbmc/control/power0"
)]
trait Power {
    #[zbus(name = "setPowerState")]
    fn set_power_state(&self, state: i32) -> zbus::Result<()>;

    #[zbus(name = "getPowerState")]
    fn get_power_state(&self) -> zbus::Result<i32>;

    #[zbus(name = "setPowerSupplyError")]
    fn set_power_supply_error(&self, error: &str) -> zbus::Result<()>;

    #[zbus(property, name = "pgood")]
    fn pgood(&self) -> zbus::Result<i32>;

    #[zbus(property, name = "state")]
    fn state(&self) -> zbus::Result<i32>;

    #[zbus(property, name = "pgood_timeout")]
    fn pgood_timeout(&self) -> zbus::Result<i32>;

    #[zbus(property, name = "pgood_timeout")]
    fn set_pgood_timeout(&self, seconds: i32) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "vrctl")]
#[command(about = "Control and query the voltage regulation daemon")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the power state and power good values
    Status,
    /// Power the system on
    On,
    /// Power the system off
    Off,
    /// Set the power good timeout in seconds
    SetTimeout { seconds: i32 },
    /// Set the power supply error used for fault root-cause analysis
    SetPowerSupplyError { error: String },
}

fn describe(value: i32) -> &'static str {
    if value == 1 {
        "on"
    } else {
        "off"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let connection = zbus::Connection::system().await?;
    let proxy = PowerProxy::new(&connection).await?;

    match args.command {
        Commands::Status => {
            let pgood = proxy.pgood().await?;
            let state = proxy.state().await?;
            let timeout = proxy.pgood_timeout().await?;
            println!("state:         {} ({state})", describe(state));
            println!("pgood:         {} ({pgood})", describe(pgood));
            println!("pgood_timeout: {timeout}s");
        }
        Commands::On => {
            proxy.set_power_state(1).await?;
            println!("Power on requested");
        }
        Commands::Off => {
            proxy.set_power_state(0).await?;
            println!("Power off requested");
        }
        Commands::SetTimeout { seconds } => {
            proxy.set_pgood_timeout(seconds).await?;
            println!("Power good timeout set to {seconds}s");
        }
        Commands::SetPowerSupplyError { error } => {
            proxy.set_power_supply_error(&error).await?;
            println!("Power supply error recorded");
        }
    }
    Ok(())
}
