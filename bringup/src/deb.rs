//! Install a runtime .deb onto the booted SoC: resolve it in the package
//! pool, download it, make sure the board is in a normal kernel, then scp +
//! dpkg over the configured ssh account. The ssh layer itself stays plain
//! external commands.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use board_config::Config;
use ota_fetch::{Downloader, FetchError, NullObserver};
use regex::Regex;
use thiserror::Error;

use crate::runner::CommandRunner;
use crate::state::{StateError, StateMachine};

/// Per-platform pool listings of runtime packages.
const PLATFORM_POOLS: &[(&str, &str)] = &[
    ("j6h", "https://jfrog.carizon.work/artifactory/api/storage/aarch64-bsp-j6h/pool/runtime-pkg"),
    ("j6m", "https://jfrog.carizon.work/artifactory/api/storage/aarch64-bsp/pool/runtime-pkg"),
];

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DebError {
    #[error("platform {0:?} has no package pool configured")]
    UnknownPlatform(String),
    #[error("package {name}:{arch} not found in the pool listing")]
    NotFound { name: String, arch: String },
    #[error("no .deb file landed in {0:?}")]
    NoDebFile(PathBuf),
    #[error("{step} failed: {detail}")]
    Remote { step: &'static str, detail: String },
    #[error("i/o on {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    State(#[from] StateError),
}

fn pool_for(platform: &str) -> Result<&'static str, DebError> {
    let platform = platform.to_lowercase();
    PLATFORM_POOLS
        .iter()
        .find(|(key, _)| platform.contains(key))
        .map(|&(_, url)| url)
        .ok_or(DebError::UnknownPlatform(platform))
}

/// Find the pool child whose uri matches `<name>.*<arch>`.
pub fn pick_package_uri(
    children: &serde_json::Value,
    name: &str,
    arch: &str,
) -> Option<String> {
    let pattern = Regex::new(&format!("{}.*{}", regex::escape(name), regex::escape(arch))).ok()?;
    children.as_array()?.iter().find_map(|child| {
        let uri = child["uri"].as_str()?;
        if pattern.is_match(uri) { Some(uri.to_string()) } else { None }
    })
}

fn download_deb(
    name: &str,
    platform: &str,
    arch: &str,
    downloader: &Downloader,
) -> Result<PathBuf, DebError> {
    let pool = pool_for(platform)?;
    let listing = ota_fetch::get_json_url(pool)?;
    let child_uri = pick_package_uri(&listing["children"], name, arch)
        .ok_or_else(|| DebError::NotFound { name: name.to_string(), arch: arch.to_string() })?;

    let info = ota_fetch::get_json_url(&format!("{}{}", pool, child_uri))?;
    let download_uri = info["downloadUri"]
        .as_str()
        .ok_or_else(|| DebError::NotFound { name: name.to_string(), arch: arch.to_string() })?;

    let dest = std::env::temp_dir().join(name);
    if dest.exists() {
        fs::remove_dir_all(&dest).map_err(|source| DebError::Io { path: dest.clone(), source })?;
    }
    fs::create_dir_all(&dest).map_err(|source| DebError::Io { path: dest.clone(), source })?;
    Ok(downloader.download(download_uri, &dest, &mut NullObserver)?)
}

fn remote(
    runner: &mut dyn CommandRunner,
    step: &'static str,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<(), DebError> {
    let result = runner
        .run(program, args, timeout)
        .map_err(|e| DebError::Remote { step, detail: e.to_string() })?;
    if result.success {
        Ok(())
    } else {
        Err(DebError::Remote { step, detail: result.output })
    }
}

/// Download, boot-to-kernel, push, install.
pub fn install(
    cfg: &Config,
    state: &mut StateMachine,
    runner: &mut dyn CommandRunner,
    name: &str,
    platform: &str,
    arch: &str,
    downloader: &Downloader,
) -> Result<(), DebError> {
    log::info!("installing {}:{} for {}", name, arch, platform);
    let deb_path = download_deb(name, platform, arch, downloader)?;
    let deb_file = deb_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DebError::NoDebFile(deb_path.clone()))?;

    log::info!("soc state before install: {:?}", state.probe()?);
    state.enter_kernel_normal()?;

    let ssh = &cfg.connect.ssh.soc;
    let target = format!("{}@{}", ssh.user, ssh.addr);

    remote(
        runner,
        "scp",
        "scp",
        &[deb_path.display().to_string(), format!("{}:/tmp", target)],
        SEND_TIMEOUT,
    )?;
    remote(
        runner,
        "dpkg",
        "ssh",
        &[target, "dpkg".to_string(), "-i".to_string(), format!("/tmp/{}", deb_file)],
        INSTALL_TIMEOUT,
    )?;
    log::info!("installed {} on {}", deb_file, ssh.addr);
    Ok(())
}
