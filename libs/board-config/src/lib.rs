//! Typed views of the JSON manifests that describe one test station: which
//! board hangs off which serial ports, where its power relay lives, and how
//! the boot flow should walk it through UART download mode.
//!
//! All manifests are loaded once at startup into a [`Config`] value that is
//! threaded through the tool; nothing here re-reads files after
//! construction.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("malformed manifest {path:?}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("board {0} is not listed in board.json")]
    UnknownBoard(String),
    #[error("no mcu sdk recorded for device {0} in uart_boot.json")]
    UnknownMcuSdk(String),
}

/// One entry of `board.json`, keyed by hostname.
#[derive(Debug, Clone, Deserialize)]
pub struct BoardEntry {
    /// Device family name, e.g. "j6e".
    pub device: String,
    /// SDK track used when resolving "latest" packages.
    pub sdk: u32,
    /// Path fragment below the artifact repository root.
    pub artifact_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayIntf {
    /// Backend selector: "default" (http), "zqwl" (modbus), "corx" (raw modbus).
    #[serde(default = "default_relay_type")]
    pub r#type: String,
    /// Address of the relay hardware itself.
    pub server_addr: String,
    /// Address of the key-value store backing the relay lock.
    pub client_addr: String,
}

fn default_relay_type() -> String { "default".to_string() }

/// `device.json`: identity of the board this station drives.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub hostname: String,
    pub power_port: u8,
    pub relay_intf: RelayIntf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialParam {
    pub port: String,
    pub baudrate: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialParams {
    pub soc: SerialParam,
    pub mcu: SerialParam,
    pub hsm: SerialParam,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshParam {
    pub name: String,
    pub user: String,
    pub addr: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub pswd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshParams {
    pub soc: SshParam,
}

/// `connect_param.json`: how the host reaches the board.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParam {
    pub serial: SerialParams,
    pub ssh: SshParams,
}

/// One scripted image transfer of the UART boot flow.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadingStep {
    /// Which console takes the transfer: "soc", "mcu" or "hsm".
    pub uart_port: String,
    /// Image file names, sent in order.
    pub img_data: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McuPackage {
    pub device: String,
    /// URL of the MCU SDK zip carrying SBL and the debug stub.
    pub sdk: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UartBootMethod {
    pub loading_step: Vec<LoadingStep>,
    pub mcu_package: Vec<McuPackage>,
}

/// `uart_boot.json`: the scripted transfer sequences.
#[derive(Debug, Clone, Deserialize)]
pub struct UartBootConfig {
    pub uart_boot_methods: Vec<UartBootMethod>,
}

/// `state.json`: console prompt patterns, all regexes.
#[derive(Debug, Clone, Deserialize)]
pub struct Prompts {
    pub uboot: Vec<String>,
    pub mcu: Vec<String>,
    pub kernel: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    pub prompts: Prompts,
}

/// Everything the tool knows about the station, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    pub boards: BTreeMap<String, BoardEntry>,
    pub device: DeviceConfig,
    pub connect: ConnectParam,
    pub uart_boot: UartBootConfig,
    pub state: StateConfig,
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
    serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse { path: path.to_owned(), source })
}

impl Config {
    /// Load all five manifests below `<root>/device/`. Any missing or
    /// malformed file is fatal; there are no defaults for station identity.
    pub fn load(root: &Path) -> Result<Config, ConfigError> {
        let device_dir = root.join("device");
        Ok(Config {
            root: root.to_owned(),
            boards: load_json(&device_dir.join("board.json"))?,
            device: load_json(&device_dir.join("device.json"))?,
            connect: load_json(&device_dir.join("connect_param.json"))?,
            uart_boot: load_json(&device_dir.join("uart_boot.json"))?,
            state: load_json(&device_dir.join("state.json"))?,
        })
    }

    /// Directory holding the MCU unlock material (certificate, key) and any
    /// loose firmware blobs that ride along with SDK downloads.
    pub fn mcu_firmware_dir(&self) -> PathBuf { self.root.join("mcu_firmware") }

    pub fn board(&self, hostname: &str) -> Result<&BoardEntry, ConfigError> {
        self.boards.get(hostname).ok_or_else(|| ConfigError::UnknownBoard(hostname.to_string()))
    }

    /// MCU SDK zip URL for a device family, from the boot method table.
    pub fn mcu_sdk_url<'a>(&self, method: &'a UartBootMethod, device: &str) -> Result<&'a str, ConfigError> {
        method
            .mcu_package
            .iter()
            .find(|pkg| pkg.device == device)
            .map(|pkg| pkg.sdk.as_str())
            .ok_or_else(|| ConfigError::UnknownMcuSdk(device.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_manifests(dir: &Path) {
        let device_dir = dir.join("device");
        fs::create_dir_all(&device_dir).unwrap();
        fs::write(
            device_dir.join("board.json"),
            r#"{"cvm-a55": {"device": "j6e", "sdk": 930, "artifact_path": "Dev/Common/j6/bsp/daily/Release"}}"#,
        )
        .unwrap();
        fs::write(
            device_dir.join("device.json"),
            r#"{"hostname": "cvm-a55", "power_port": 3,
                "relay_intf": {"type": "corx", "server_addr": "192.168.3.133", "client_addr": "192.168.3.10"}}"#,
        )
        .unwrap();
        fs::write(
            device_dir.join("connect_param.json"),
            r#"{"serial": {"soc": {"port": "/dev/ttyUSB2", "baudrate": 921600},
                           "mcu": {"port": "/dev/ttyUSB3", "baudrate": 921600},
                           "hsm": {"port": "/dev/ttyUSB1", "baudrate": 921600}},
                "ssh": {"soc": {"name": "soc", "user": "root", "addr": "192.168.2.62"}}}"#,
        )
        .unwrap();
        fs::write(
            device_dir.join("uart_boot.json"),
            r#"{"uart_boot_methods": [{
                "loading_step": [
                    {"uart_port": "mcu", "img_data": ["SBL.img"]},
                    {"uart_port": "soc", "img_data": ["spl_uart.img"]}],
                "mcu_package": [{"device": "j6e", "sdk": "https://repo.example/mcu_sdk.zip"}]}]}"#,
        )
        .unwrap();
        fs::write(
            device_dir.join("state.json"),
            r#"{"prompts": {"uboot": ["=>\\s*$"], "mcu": ["CCC"], "kernel": ["login:"]}}"#,
        )
        .unwrap();
    }

    #[test]
    fn loads_station_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_manifests(dir.path());

        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.device.hostname, "cvm-a55");
        assert_eq!(cfg.device.power_port, 3);
        assert_eq!(cfg.device.relay_intf.r#type, "corx");
        assert_eq!(cfg.board("cvm-a55").unwrap().sdk, 930);
        assert_eq!(cfg.connect.serial.mcu.baudrate, 921_600);
        let method = &cfg.uart_boot.uart_boot_methods[0];
        assert_eq!(method.loading_step.len(), 2);
        assert_eq!(cfg.mcu_sdk_url(method, "j6e").unwrap(), "https://repo.example/mcu_sdk.zip");
    }

    #[test]
    fn unknown_board_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_manifests(dir.path());
        let cfg = Config::load(dir.path()).unwrap();
        assert!(matches!(cfg.board("nonesuch"), Err(ConfigError::UnknownBoard(_))));
    }

    #[test]
    fn missing_manifest_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_manifests(dir.path());
        fs::remove_file(dir.path().join("device").join("state.json")).unwrap();
        assert!(matches!(Config::load(dir.path()), Err(ConfigError::Read { .. })));
    }
}
