//! The org.openbmc.control.Power D-Bus interface.
//!
//! Method and property handlers do not touch the power systems directly;
//! requests are queued to the control loop and answered through a oneshot
//! channel so every state change runs on the single control task.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use zbus::object_server::SignalEmitter;

pub const OBJECT_PATH: &str = "/org/openbmc/control/power0";
pub const BUS_NAME: &str = "org.openbmc.control.Power";

/// Request queued to the control loop.
pub enum Command {
    SetPowerState {
        state: i32,
        reply: oneshot::Sender<Result<(), String>>,
    },
    SetPowerSupplyError {
        error: String,
    },
    SetPgoodTimeout {
        seconds: i32,
    },
}

/// Control-surface values mirrored from the control loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    /// Current hardware pgood reading (1 = on).
    pub pgood: i32,
    /// Last requested power state (1 = on).
    pub state: i32,
    /// Power good timeout in seconds.
    pub pgood_timeout: i32,
}

pub struct PowerInterface {
    commands: mpsc::Sender<Command>,
    status: Arc<Mutex<Status>>,
}

impl PowerInterface {
    pub fn new(commands: mpsc::Sender<Command>, status: Arc<Mutex<Status>>) -> Self {
        Self { commands, status }
    }

    fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }
}

#[zbus::interface(name = "org.openbmc.control.Power")]
impl PowerInterface {
    #[zbus(name = "setPowerState")]
    async fn set_power_state(&self, state: i32) -> zbus::fdo::Result<()> {
        if state != 0 && state != 1 {
            return Err(zbus::fdo::Error::Failed("Invalid power state".to_string()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::SetPowerState {
                state,
                reply: reply_tx,
            })
            .await
            .map_err(|_| zbus::fdo::Error::Failed("Daemon is shutting down".to_string()))?;
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(zbus::fdo::Error::Failed(reason)),
            Err(_) => Err(zbus::fdo::Error::Failed(
                "Daemon is shutting down".to_string(),
            )),
        }
    }

    /// Returns the current hardware pgood reading, not the last requested
    /// state.
    #[zbus(name = "getPowerState")]
    async fn get_power_state(&self) -> i32 {
        self.status().pgood
    }

    #[zbus(name = "setPowerSupplyError")]
    async fn set_power_supply_error(&self, error: String) -> zbus::fdo::Result<()> {
        self.commands
            .send(Command::SetPowerSupplyError { error })
            .await
            .map_err(|_| zbus::fdo::Error::Failed("Daemon is shutting down".to_string()))
    }

    #[zbus(property, name = "pgood")]
    fn pgood(&self) -> i32 {
        self.status().pgood
    }

    #[zbus(property, name = "state")]
    fn state(&self) -> i32 {
        self.status().state
    }

    #[zbus(property, name = "pgood_timeout")]
    fn pgood_timeout(&self) -> i32 {
        self.status().pgood_timeout
    }

    #[zbus(property, name = "pgood_timeout")]
    async fn set_pgood_timeout(&mut self, seconds: i32) {
        let _ = self
            .commands
            .send(Command::SetPgoodTimeout { seconds })
            .await;
    }

    #[zbus(signal, name = "PowerGood")]
    pub async fn power_good(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal, name = "PowerLost")]
    pub async fn power_lost(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;
}
