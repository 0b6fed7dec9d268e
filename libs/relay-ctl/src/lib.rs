//! Power control for the board's relay ports.
//!
//! Three interchangeable backends hide behind [`backend::RelayBackend`]; the
//! [`Relay`] front end adds the things every backend needs done the same
//! way: the port-range guard, the are-you-sure prompt for foreign ports,
//! idempotent skips where state can be read back, and the process-global
//! named lock that keeps CI workers from power-cycling each other's boards.

use std::thread;
use std::time::Duration;

use board_config::DeviceConfig;
use thiserror::Error;

pub mod backend;
pub mod netlock;

use backend::{PortState, RelayBackend};
use netlock::NetLock;

pub const MAX_PORT: u8 = 16;
pub const REBOOT_INTERVAL: Duration = Duration::from_millis(500);

/// Extra slack on top of the reboot interval for lock TTL and acquire wait.
const LOCK_SLACK: Duration = Duration::from_millis(3500);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("port {0} is over the relay's max port {max}", max = MAX_PORT)]
    InvalidPort(u8),
    #[error("unsupported relay type {0:?} in device config")]
    UnknownBackend(String),
    #[error("relay transport failure: {0}")]
    Transport(String),
    #[error("unparseable relay status {0:?}")]
    BadStatus(String),
    #[error("port {port} did not reach {want:?}")]
    Verify { port: u8, want: PortState },
    #[error("relay lock {key:?} still contended after {waited:?}; another worker is probably power-cycling")]
    LockContended { key: String, waited: Duration },
    #[error("lock store i/o: {0}")]
    LockIo(#[source] std::io::Error),
    #[error("operator declined power action on foreign port {0}")]
    Declined(u8),
    #[error("interrupted at confirmation prompt")]
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    On,
    Off,
    Reboot,
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(Action::On),
            "off" => Ok(Action::Off),
            "reboot" => Ok(Action::Reboot),
            other => Err(format!("unknown relay action {:?}", other)),
        }
    }
}

/// Yes/no gate for actions that touch hardware outside this station's own
/// power port. `None` means the operator bailed (Ctrl-C / EOF).
pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> Option<bool>;
}

/// Refuses everything; the default for non-interactive runs.
pub struct DenyAll;

impl Confirm for DenyAll {
    fn confirm(&mut self, _prompt: &str) -> Option<bool> { Some(false) }
}

/// Accepts everything (`--yes`).
pub struct AllowAll;

impl Confirm for AllowAll {
    fn confirm(&mut self, _prompt: &str) -> Option<bool> { Some(true) }
}

pub struct Relay {
    backend: Box<dyn RelayBackend>,
    lock: NetLock,
    home_port: u8,
}

impl Relay {
    pub fn new(backend: Box<dyn RelayBackend>, lock: NetLock, home_port: u8) -> Self {
        Relay { backend, lock, home_port }
    }

    /// Build the backend named by the device manifest's `relay_intf.type`.
    pub fn from_config(device: &DeviceConfig) -> Result<Self, RelayError> {
        let intf = &device.relay_intf;
        let backend: Box<dyn RelayBackend> = match intf.r#type.as_str() {
            "default" => Box::new(backend::HttpRelay::new(&intf.server_addr)),
            "zqwl" => Box::new(backend::ModbusRelay::new(&intf.server_addr)),
            "corx" => Box::new(backend::RawModbusRelay::new(&intf.server_addr)),
            other => return Err(RelayError::UnknownBackend(other.to_string())),
        };
        Ok(Relay::new(backend, NetLock::new(&intf.client_addr), device.power_port))
    }

    /// Run one power action. Everything that hits the wire happens inside a
    /// single hold of the shared relay lock.
    pub fn execute(
        &mut self,
        action: Action,
        port: Option<u8>,
        confirm: &mut dyn Confirm,
    ) -> Result<(), RelayError> {
        let port = port.unwrap_or(self.home_port);
        if port == 0 || port > MAX_PORT {
            return Err(RelayError::InvalidPort(port));
        }

        if port != self.home_port {
            let prompt = format!(
                "port {} is not this station's power port ({}); really run {:?} on it? [y/n] ",
                port, self.home_port, action
            );
            match confirm.confirm(&prompt) {
                Some(true) => {}
                Some(false) => return Err(RelayError::Declined(port)),
                None => return Err(RelayError::Aborted),
            }
        }

        log::debug!("relay {:?} port {} via {}", action, port, self.backend.name());

        let budget = REBOOT_INTERVAL + LOCK_SLACK;
        let _guard = self.lock.acquire(budget, budget)?;

        match action {
            Action::On => self.set_checked(port, PortState::On),
            Action::Off => self.set_checked(port, PortState::Off),
            Action::Reboot => {
                self.set_checked(port, PortState::Off)?;
                thread::sleep(REBOOT_INTERVAL);
                self.set_checked(port, PortState::On)?;
                log::info!("rebooted port {}", port);
                Ok(())
            }
        }
    }

    fn set_checked(&mut self, port: u8, want: PortState) -> Result<(), RelayError> {
        if self.backend.port_state(port)? == Some(want) {
            log::info!("port {} already {:?}, nothing to do", port, want);
            return Ok(());
        }
        self.backend.set_port(port, want)?;
        log::info!("set port {} {:?}", port, want);
        Ok(())
    }
}
