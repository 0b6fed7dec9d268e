//! Fastboot flashing: stage the bundle, pick its data manifest, drive the
//! device into fastboot, then run the generated command sequence with
//! bounded retries.

pub mod plan;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use board_config::Config;
use ota_fetch::{DownloadObserver, Downloader};
use regex::Regex;
use serial_link::console;
use serial_link::{Link, LinkError};
use thiserror::Error;

use crate::package::{self, PackageLink, StageError};
use crate::runner::CommandRunner;
use plan::{DataManifest, FlashCommand, Module, PlanError, Transport};

/// fastboot prints this on success, on stderr of all places.
const FINISHED_MARKER: &str = "Finished.";

const COMMAND_RETRIES: u32 = 3;
const CONNECT_RETRIES: u32 = 20;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("no data manifest matching {host} in {dir:?}")]
    NoManifest { host: String, dir: PathBuf },
    #[error("malformed data manifest {path:?}: {source}")]
    BadManifest { path: PathBuf, source: serde_json::Error },
    #[error("fastboot command {cmd:?} failed {attempts} times")]
    CommandFailed { cmd: String, attempts: u32 },
    #[error("board unreachable over {transport:?} after {attempts} attempts")]
    ConnectFailed { transport: Transport, attempts: u32 },
    #[error("device did not enter fastboot; console output:\n{0}")]
    DeviceEntry(String),
    #[error("no IMG directory in {0:?} for an mcu bundle")]
    NoImgDir(PathBuf),
    #[error("i/o on {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("spawning {program}: {source}")]
    Spawn { program: String, source: std::io::Error },
}

/// Read the directory, pick the manifest for `host`, parse it.
pub fn load_data_manifest(image_dir: &Path, host: &str) -> Result<DataManifest, FlashError> {
    let mut names: Vec<String> = fs::read_dir(image_dir)
        .map_err(|source| FlashError::Io { path: image_dir.to_owned(), source })?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort(); // listing order is filesystem-dependent; make it stable

    let chosen = plan::select_data_manifest(&names, host)
        .ok_or_else(|| FlashError::NoManifest { host: host.to_string(), dir: image_dir.to_owned() })?;
    log::info!("using data manifest {} for {}", chosen, host);

    let path = image_dir.join(&chosen);
    let raw = fs::read(&path).map_err(|source| FlashError::Io { path: path.clone(), source })?;
    let manifest: DataManifest =
        serde_json::from_slice(&raw).map_err(|source| FlashError::BadManifest { path, source })?;
    if let Some(version) = &manifest.version {
        log::info!("{} version: {}", chosen, version);
    }
    Ok(manifest)
}

/// Run every command of the plan, each with up to three attempts. Success
/// needs a zero exit *and* the `Finished.` marker in the output.
pub fn run_plan(runner: &mut dyn CommandRunner, commands: &[FlashCommand]) -> Result<(), FlashError> {
    for command in commands {
        let mut done = false;
        for attempt in 1..=COMMAND_RETRIES {
            let result = runner
                .run("fastboot", &command.args, command.timeout)
                .map_err(|source| FlashError::Spawn { program: "fastboot".to_string(), source })?;
            if result.success && result.output.contains(FINISHED_MARKER) {
                log::debug!("ok: fastboot {}", command.rendered());
                done = true;
                break;
            }
            log::warn!(
                "fastboot {} failed (attempt {}/{}):\n{}",
                command.rendered(),
                attempt,
                COMMAND_RETRIES,
                result.output
            );
        }
        if !done {
            return Err(FlashError::CommandFailed {
                cmd: command.rendered(),
                attempts: COMMAND_RETRIES,
            });
        }
    }
    log::info!("all {} fastboot commands finished", commands.len());
    Ok(())
}

/// Kick the SoC's uboot console into fastboot mode.
pub fn enter_fastboot_on_device(
    soc: &mut dyn Link,
    transport: Transport,
    board_addr: &str,
    window: Duration,
) -> Result<(), FlashError> {
    let (command, expect) = match transport {
        Transport::Usb => ("fastboot 0".to_string(), regex::escape("fastboot 0")),
        Transport::Eth => (
            format!("setenv ipaddr {}; setenv ethact eth1; ping 192.168.2.130; fastboot udp", board_addr),
            format!("Listening for fastboot command on {}", regex::escape(board_addr)),
        ),
    };
    let patterns = [Regex::new(&expect).expect("escaped pattern compiles")];
    let (hit, output) = console::send_expect(
        soc,
        &format!("{}\n", command),
        window,
        &patterns,
        Duration::from_millis(200),
    )?;
    if hit {
        log::info!("device is in fastboot mode ({:?})", transport);
        Ok(())
    } else {
        Err(FlashError::DeviceEntry(output))
    }
}

/// Make sure the host can actually reach the board before flashing.
pub fn connect_target(
    runner: &mut dyn CommandRunner,
    transport: Transport,
    board_addr: &str,
) -> Result<(), FlashError> {
    for _ in 0..CONNECT_RETRIES {
        let reachable = match transport {
            Transport::Eth => {
                let args: Vec<String> =
                    vec![board_addr.to_string(), "-c".into(), "1".into(), "-W".into(), "1".into()];
                runner
                    .run("ping", &args, Duration::from_secs(2))
                    .map(|r| r.success)
                    .unwrap_or(false)
            }
            Transport::Usb => runner
                .run("fastboot", &["devices".to_string()], Duration::from_secs(2))
                .map(|r| r.success && (r.output.contains("uboot") || r.output.contains("fastboot")))
                .unwrap_or(false),
        };
        if reachable {
            log::debug!("target reachable over {:?}", transport);
            return Ok(());
        }
    }
    Err(FlashError::ConnectFailed { transport, attempts: CONNECT_RETRIES })
}

/// MCU bundles nest their images below IMG/; flatten them into the scratch
/// root where the manifest paths point.
pub fn flatten_mcu_images(image_dir: &Path) -> Result<(), FlashError> {
    let img = image_dir.join("IMG");
    if !img.is_dir() {
        return Err(FlashError::NoImgDir(image_dir.to_owned()));
    }
    for entry in fs::read_dir(&img).map_err(|source| FlashError::Io { path: img.clone(), source })? {
        let entry = entry.map_err(|source| FlashError::Io { path: img.clone(), source })?;
        if entry.path().is_file() {
            fs::copy(entry.path(), image_dir.join(entry.file_name()))
                .map_err(|source| FlashError::Io { path: entry.path(), source })?;
        }
    }
    Ok(())
}

pub struct UpgradeRequest {
    pub transport: Transport,
    pub module: Module,
    pub link: Option<PackageLink>,
    pub host: Option<String>,
}

/// The whole flasher flow, consoles and runner injected.
pub fn upgrade(
    cfg: &Config,
    soc: &mut dyn Link,
    runner: &mut dyn CommandRunner,
    req: &UpgradeRequest,
    scratch: &Path,
    downloader: &Downloader,
    observer: &mut dyn DownloadObserver,
) -> Result<(), FlashError> {
    let host = req.host.clone().unwrap_or_else(|| cfg.device.hostname.clone());
    let board_addr = cfg.connect.ssh.soc.addr.clone();
    log::info!("fastboot {:?} upgrade of {} on {}", req.transport, host, board_addr);

    let image_dir = package::stage(req.link.as_ref(), cfg, &host, scratch, downloader, observer)?;
    if req.module == Module::Mcu {
        flatten_mcu_images(&image_dir)?;
    }

    let manifest = load_data_manifest(&image_dir, &host)?;
    let sizes = |path: &Path| fs::metadata(path).map(|m| m.len());
    let addr_opt = match req.transport {
        Transport::Eth => Some(board_addr.as_str()),
        Transport::Usb => None,
    };
    let commands =
        plan::build_plan(&manifest, &host, req.transport, addr_opt, &image_dir, &sizes)?;

    enter_fastboot_on_device(soc, req.transport, &board_addr, Duration::from_secs(30))?;
    connect_target(runner, req.transport, &board_addr)?;
    run_plan(runner, &commands)?;
    log::info!("fastboot upgrade of {} complete", host);
    Ok(())
}
