//! Flash-plan generation: turn one OTA data manifest into the exact
//! fastboot command sequence, with per-partition timeouts.
//!
//! Pure: the only world access is through the injected size probe, so the
//! same manifest and transport always produce the same plan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

pub const FASTBOOT_UDP_PORT: u16 = 5554;

/// Images above this go out with the sparse flag.
const SPARSE_THRESHOLD: u64 = 32 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Usb,
    Eth,
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "usb" => Ok(Transport::Usb),
            "eth" => Ok(Transport::Eth),
            other => Err(format!("unknown fastboot transport {:?}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Module {
    Soc,
    Mcu,
}

impl std::str::FromStr for Module {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "soc" => Ok(Module::Soc),
            "mcu" => Ok(Module::Mcu),
            other => Err(format!("unknown flash module {:?}", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("partition {0:?} has no entry in the flash attribute table")]
    UnknownPartition(String),
    #[error("cannot size image {path:?}: {source}")]
    Size { path: PathBuf, source: std::io::Error },
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageEntry {
    #[serde(default)]
    pub part_info: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: u64,
    pub storages: BTreeMap<String, StorageEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataManifest {
    #[serde(default)]
    pub version: Option<serde_json::Value>,
    pub images: BTreeMap<String, ImageEntry>,
}

/// One fastboot invocation (argv after the program name) plus its wait
/// budget.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashCommand {
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl FlashCommand {
    pub fn rendered(&self) -> String { self.args.join(" ") }
}

/// Seconds to wait per partition, measured on the bench; the generous
/// entries cover links where the transfer itself dominates.
const FLASH_TIMEOUTS: &[(&str, u64, u64)] = &[
    // (partition, eth, usb)
    ("gpt", 6, 6), // reserve time for the gpt backup write
    ("spl_ddr_a", 1000, 10),
    ("spl_ddr_b", 1000, 10),
    ("ubootenv", 1000, 10),
    ("acore_cfg", 1, 1),
    ("acore_cfg_a", 1, 1),
    ("acore_cfg_b", 1, 1),
    ("bl31", 1, 1),
    ("bl31_a", 1, 1),
    ("bl31_b", 1, 1),
    ("optee", 1, 1),
    ("optee_a", 1, 1),
    ("optee_b", 1, 1),
    ("uboot", 10, 10),
    ("uboot_a", 10, 10),
    ("uboot_b", 10, 10),
    ("vbmeta_a", 1, 1),
    ("vbmeta_b", 1, 1),
    ("boot_a", 10, 10),
    ("boot_b", 10, 10),
    ("system_a", 300, 500),
    ("system_b", 300, 500),
    ("system_verity_a", 5, 5),
    ("system_verity_b", 5, 5),
    ("basesystem_a", 50, 100),
    ("basesystem_b", 50, 100),
    ("app_param", 1000, 50),
    ("app_param_bak", 1000, 50),
    ("emmc_boot1", 1000, 10),
];

pub fn partition_timeout(part: &str, transport: Transport) -> Option<Duration> {
    FLASH_TIMEOUTS.iter().find(|(name, _, _)| *name == part).map(|&(_, eth, usb)| {
        Duration::from_secs(match transport {
            Transport::Eth => eth,
            Transport::Usb => usb,
        })
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Medium {
    Emmc,
    EmmcBoot0,
    EmmcBoot1,
    Nor,
}

impl Medium {
    fn parse(name: &str) -> Option<Medium> {
        match name {
            "emmc" => Some(Medium::Emmc),
            "emmc_boot0" => Some(Medium::EmmcBoot0),
            "emmc_boot1" => Some(Medium::EmmcBoot1),
            "nor" => Some(Medium::Nor),
            _ => None,
        }
    }

    /// The init commands that select this medium, and whether its targets
    /// are named GPT partitions.
    fn init(self) -> (Vec<Vec<String>>, bool) {
        fn oem(parts: &[&str]) -> Vec<String> { parts.iter().map(|s| s.to_string()).collect() }
        match self {
            Medium::Emmc => (
                vec![
                    oem(&["oem", "interface:blk"]),
                    oem(&["oem", "bootdevice:mmc"]),
                    oem(&["oem", "runcommand:mmc partconf 0 1 1 0"]),
                ],
                true,
            ),
            Medium::EmmcBoot0 => (
                vec![
                    oem(&["oem", "interface:blk"]),
                    oem(&["oem", "bootdevice:mmc"]),
                    oem(&["oem", "runcommand:mmc partconf 0 1 1 1"]),
                ],
                true,
            ),
            Medium::EmmcBoot1 => (
                vec![
                    oem(&["oem", "interface:blk"]),
                    oem(&["oem", "bootdevice:mmc"]),
                    oem(&["oem", "runcommand:mmc partconf 0 1 1 2"]),
                ],
                false,
            ),
            Medium::Nor => (vec![oem(&["oem", "interface:mtd"])], true),
        }
    }
}

fn transport_options(transport: Transport, board_addr: Option<&str>) -> Vec<String> {
    match transport {
        Transport::Usb => Vec::new(),
        Transport::Eth => {
            let addr = board_addr.unwrap_or("0.0.0.0");
            vec!["-s".to_string(), format!("udp:{}:{}", addr, FASTBOOT_UDP_PORT)]
        }
    }
}

/// Pick the manifest file for `host` out of a directory listing. LTS-style
/// names (`..._V<major>.<minor>...`) win, highest version first; otherwise
/// the first plain `data*<host>*json` in listing order is taken.
pub fn select_data_manifest(candidates: &[String], host: &str) -> Option<String> {
    let host_pat = regex::escape(host);
    let any = Regex::new(&format!("^data.*{}.*json", host_pat)).unwrap();
    let lts = Regex::new(&format!("^data.*{}_[Vv][0-9]+\\.[0-9]+.*json", host_pat)).unwrap();
    let version = Regex::new(r"_[Vv](\d+)\.(\d+)").unwrap();

    let matching: Vec<&String> = candidates.iter().filter(|name| any.is_match(name)).collect();
    if matching.is_empty() {
        return None;
    }

    let mut lts_matches: Vec<(&String, (u64, u64))> = matching
        .iter()
        .filter(|name| lts.is_match(name))
        .filter_map(|name| {
            version.captures(name).map(|c| {
                (*name, (c[1].parse::<u64>().unwrap_or(0), c[2].parse::<u64>().unwrap_or(0)))
            })
        })
        .collect();

    if lts_matches.is_empty() {
        log::info!("no lts data manifest for {}, using {}", host, matching[0]);
        return Some(matching[0].clone());
    }
    lts_matches.sort_by_key(|&(_, version)| version);
    Some(lts_matches.last().unwrap().0.clone())
}

/// The two partition-table images that must land before any partitioned
/// write, sized from disk.
fn synthetic_gpt_entries(
    host: &str,
    image_dir: &Path,
    image_size: &dyn Fn(&Path) -> std::io::Result<u64>,
) -> Result<Vec<(String, ImageEntry)>, PlanError> {
    let mut entries = Vec::new();
    for (suffix, medium) in &[("emmc", "emmc"), ("emmc_boot0", "emmc_boot0")] {
        let name = format!("gpt_main_{}_{}.img", host, suffix);
        let path = image_dir.join(&name);
        let size = image_size(&path).map_err(|source| PlanError::Size { path, source })?;
        let mut storages = BTreeMap::new();
        storages
            .insert(medium.to_string(), StorageEntry { part_info: vec!["gpt".to_string()] });
        entries.push((name.clone(), ImageEntry { name: Some(name), size, storages }));
    }
    Ok(entries)
}

/// Generate the full command sequence: per-medium init (emitted whenever the
/// target medium changes), the flash writes, and the final reboot.
pub fn build_plan(
    manifest: &DataManifest,
    host: &str,
    transport: Transport,
    board_addr: Option<&str>,
    image_dir: &Path,
    image_size: &dyn Fn(&Path) -> std::io::Result<u64>,
) -> Result<Vec<FlashCommand>, PlanError> {
    let opts = transport_options(transport, board_addr);
    let init_timeout = Duration::from_secs(1);

    let mut ordered = synthetic_gpt_entries(host, image_dir, image_size)?;
    for (key, entry) in &manifest.images {
        ordered.push((key.clone(), entry.clone()));
    }

    let mut commands = Vec::new();
    let mut selected: Option<Medium> = None;

    for (key, entry) in &ordered {
        let name = entry.name.clone().unwrap_or_else(|| key.clone());
        for (medium_name, storage) in &entry.storages {
            let medium = match Medium::parse(medium_name) {
                Some(m) => m,
                None => {
                    log::warn!("unknown storage medium {:?} for {}, skipping", medium_name, name);
                    continue;
                }
            };
            let (init, has_gpt) = medium.init();
            if selected != Some(medium) {
                for cmd in init {
                    let mut args = opts.clone();
                    args.extend(cmd);
                    commands.push(FlashCommand { args, timeout: init_timeout });
                }
                selected = Some(medium);
            }

            let path = image_dir.join(&name);
            let size =
                image_size(&path).map_err(|source| PlanError::Size { path: path.clone(), source })?;
            let sparse = size > SPARSE_THRESHOLD;

            for part in &storage.part_info {
                let timeout = partition_timeout(part, transport)
                    .ok_or_else(|| PlanError::UnknownPartition(part.clone()))?;
                let mut args = opts.clone();
                args.push("flash".to_string());
                args.push(if has_gpt { part.clone() } else { "0".to_string() });
                if sparse {
                    args.push("-S".to_string());
                    args.push("32M".to_string());
                }
                args.push(path.display().to_string());
                commands.push(FlashCommand { args, timeout });
            }
        }
    }

    let mut reboot = opts;
    reboot.push("reboot".to_string());
    commands.push(FlashCommand { args: reboot, timeout: Duration::from_secs(1) });
    Ok(commands)
}
