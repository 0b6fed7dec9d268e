//! `bringup` walks an automotive SoC/MCU/HSM board from cold power-on to
//! a known firmware state: relay power control, secure-debug unlock, the
//! scripted UART/XMODEM bootstrap, fastboot flashing, and .deb installs on
//! the booted system.

mod deb;
mod fastboot;
mod package;
mod progress;
mod runner;
mod secure_debug;
mod state;
#[cfg(test)]
mod testcfg;
mod uartboot;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use board_config::Config;
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use ota_fetch::Downloader;
use relay_ctl::{Action, Confirm, Relay};
use serial_link::{Link, SerialEndpoint};

use crate::secure_debug::{SecureDebugSession, UnlockError};
use crate::uartboot::{UartStartMethod, UartTimings};

/// Serial reads give up after this long; the slowest legitimate wait is the
/// SoC working through a freshly loaded SPL.
const SERIAL_READ_TIMEOUT: Duration = Duration::from_secs(30);

fn cli() -> App<'static, 'static> {
    App::new("bringup")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Brings a board from cold power-on to a known firmware state")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("level")
                .short("l")
                .long("log-level")
                .takes_value(true)
                .possible_values(&["error", "warn", "info", "debug", "trace"])
                .default_value("debug")
                .global(true)
                .help("log level"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .default_value("./config")
                .global(true)
                .help("station config directory"),
        )
        .arg(
            Arg::with_name("yes")
                .short("y")
                .long("yes")
                .global(true)
                .help("answer every confirmation with yes (non-interactive)"),
        )
        .subcommand(
            SubCommand::with_name("reboot")
                .about("power control through the station relay")
                .arg(
                    Arg::with_name("action")
                        .short("a")
                        .takes_value(true)
                        .possible_values(&["on", "off", "reboot"])
                        .default_value("reboot")
                        .help("relay action"),
                )
                .arg(Arg::with_name("port").short("p").takes_value(true).help("relay port, defaults to the board's own")),
        )
        .subcommand(
            SubCommand::with_name("uartboot")
                .about("bootstrap the board over serial until the soc listens for fastboot")
                .arg(Arg::with_name("link").short("u").takes_value(true).help("package: path, url or 'latest'"))
                .arg(Arg::with_name("board").short("b").takes_value(true).help("board name, defaults to device.json"))
                .arg(
                    Arg::with_name("method")
                        .short("t")
                        .takes_value(true)
                        .possible_values(&["mcu goto uart", "mcu reboot", "manual operation"])
                        .default_value("mcu goto uart")
                        .help("how to put the mcu into uart download mode"),
                ),
        )
        .subcommand(
            SubCommand::with_name("fastboot")
                .about("flash an update bundle over fastboot")
                .arg(
                    Arg::with_name("type")
                        .short("t")
                        .takes_value(true)
                        .possible_values(&["usb", "eth"])
                        .default_value("usb")
                        .help("fastboot transport"),
                )
                .arg(Arg::with_name("link").short("u").takes_value(true).help("package: path, url or 'latest'"))
                .arg(Arg::with_name("host").short("d").takes_value(true).help("target host, defaults to device.json"))
                .arg(
                    Arg::with_name("module")
                        .short("m")
                        .takes_value(true)
                        .possible_values(&["soc", "mcu"])
                        .default_value("soc")
                        .help("flash module"),
                ),
        )
        .subcommand(
            SubCommand::with_name("mcu-util")
                .about("mcu maintenance commands")
                .arg(Arg::with_name("unlock").short("u").help("run the secure debug unlock")),
        )
        .subcommand(
            SubCommand::with_name("deb")
                .about("install a runtime .deb on the booted soc")
                .arg(Arg::with_name("package").short("p").takes_value(true).help("debian package name"))
                .arg(Arg::with_name("platform").short("f").takes_value(true).default_value("j6m").help("platform: j6m/j6h"))
                .arg(
                    Arg::with_name("arch")
                        .short("a")
                        .takes_value(true)
                        .possible_values(&["arm64", "amd64"])
                        .default_value("arm64")
                        .help("package architecture"),
                ),
        )
}

fn main() {
    let matches = cli().get_matches();
    // global flags propagate down into the subcommand matches
    let (name, sub) = matches.subcommand();
    let sub = sub.expect("clap enforces a subcommand");

    let level = sub.value_of("level").unwrap_or("debug");
    env_logger::Builder::new().parse_filters(level).init();

    match run(name, sub) {
        Ok(summary) => println!("succeed to {}", summary),
        Err(e) => {
            log::error!("{:#}", e);
            println!("failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(name: &str, sub: &ArgMatches) -> Result<String> {
    let config_dir = sub.value_of("config").unwrap_or("./config");
    let cfg = Config::load(Path::new(config_dir))
        .with_context(|| format!("loading station config from {}", config_dir))?;
    let yes = sub.is_present("yes");

    match name {
        "reboot" => cmd_reboot(&cfg, sub, yes),
        "uartboot" => cmd_uartboot(&cfg, sub, yes),
        "fastboot" => cmd_fastboot(&cfg, sub),
        "mcu-util" => cmd_mcu_util(&cfg, sub, yes),
        "deb" => cmd_deb(&cfg, sub),
        other => unreachable!("unknown subcommand {}", other),
    }
}

fn open_serial(name: &str, param: &board_config::SerialParam) -> Result<SerialEndpoint> {
    Ok(SerialEndpoint::open(name, Path::new(&param.port), param.baudrate, SERIAL_READ_TIMEOUT)?)
}

fn cmd_reboot(cfg: &Config, sub: &ArgMatches, yes: bool) -> Result<String> {
    let action: Action = sub.value_of("action").unwrap().parse().map_err(|e: String| anyhow!(e))?;
    let port = sub
        .value_of("port")
        .map(|p| p.parse::<u8>())
        .transpose()
        .context("port must be a small integer")?;

    let mut relay = Relay::from_config(&cfg.device)?;
    let mut confirm: Box<dyn Confirm> =
        if yes { Box::new(relay_ctl::AllowAll) } else { Box::new(StdinConfirm) };
    relay.execute(action, port, confirm.as_mut())?;
    Ok(format!("set port {} {:?}", port.unwrap_or(cfg.device.power_port), action))
}

fn cmd_uartboot(cfg: &Config, sub: &ArgMatches, yes: bool) -> Result<String> {
    let board =
        sub.value_of("board").map(str::to_string).unwrap_or_else(|| cfg.device.hostname.clone());
    let method: UartStartMethod =
        sub.value_of("method").unwrap().parse().map_err(|e| anyhow!("{}", e))?;
    let link = sub.value_of("link").map(package::PackageLink::parse);

    let mut soc = open_serial("soc", &cfg.connect.serial.soc)?;
    let mut mcu = open_serial("mcu", &cfg.connect.serial.mcu)?;
    let mut hsm = open_serial("hsm", &cfg.connect.serial.hsm)?;

    let mut relay = Relay::from_config(&cfg.device)?;
    let mut power = uartboot::RelayPower { relay: &mut relay };
    let mut unlocker = CliUnlocker { firmware_dir: cfg.mcu_firmware_dir(), interactive: !yes };
    let mut progress = progress::TransferBar::new();
    let mut observer = progress::DownloadBar::new();

    let mut ctx = uartboot::BootContext {
        soc: &mut soc,
        mcu: &mut mcu,
        hsm: &mut hsm,
        power: &mut power,
        unlocker: &mut unlocker,
        progress: &mut progress,
        observer: &mut observer,
        timings: UartTimings::default(),
    };
    let downloader = Downloader::default();
    let ip = uartboot::boot(
        &mut ctx,
        cfg,
        &board,
        link.as_ref(),
        method,
        Path::new(package::SCRATCH_DIR),
        &downloader,
    )?;

    Ok(match ip {
        Some(ip) => format!("boot {} by uart, fastboot listening on {}", board, ip),
        None => format!("boot {} by uart", board),
    })
}

fn cmd_fastboot(cfg: &Config, sub: &ArgMatches) -> Result<String> {
    let transport: fastboot::plan::Transport =
        sub.value_of("type").unwrap().parse().map_err(|e: String| anyhow!(e))?;
    let module: fastboot::plan::Module =
        sub.value_of("module").unwrap().parse().map_err(|e: String| anyhow!(e))?;
    let link = sub.value_of("link").map(package::PackageLink::parse);
    let host = sub.value_of("host").map(str::to_string);

    let mut soc = open_serial("soc", &cfg.connect.serial.soc)?;
    let mut sys_runner = runner::SystemRunner;
    let req = fastboot::UpgradeRequest { transport, module, link, host };
    fastboot::upgrade(
        cfg,
        &mut soc,
        &mut sys_runner,
        &req,
        Path::new(package::SCRATCH_DIR),
        &Downloader::default(),
        &mut progress::DownloadBar::new(),
    )?;
    Ok(format!("fastboot {:?} upgrade by {:?}", module, transport))
}

fn cmd_mcu_util(cfg: &Config, sub: &ArgMatches, yes: bool) -> Result<String> {
    if !sub.is_present("unlock") {
        bail!("nothing to do; pass -u to run the secure debug unlock");
    }
    let mut mcu = open_serial("mcu", &cfg.connect.serial.mcu)?;
    let firmware_dir = cfg.mcu_firmware_dir();
    if yes {
        let mut operator = secure_debug::NoOperatorPresent;
        SecureDebugSession::new(&mut mcu, &mut operator, &firmware_dir).unlock()?;
    } else {
        let mut operator = StdinOperator;
        SecureDebugSession::new(&mut mcu, &mut operator, &firmware_dir).unlock()?;
    }
    Ok("unlock mcu".to_string())
}

fn cmd_deb(cfg: &Config, sub: &ArgMatches) -> Result<String> {
    let package = sub.value_of("package").context("-p <package> is required")?;
    let platform = sub.value_of("platform").unwrap();
    let arch = sub.value_of("arch").unwrap();

    let mut soc = open_serial("soc", &cfg.connect.serial.soc)?;
    let mut relay = Relay::from_config(&cfg.device)?;
    let mut power = uartboot::RelayPower { relay: &mut relay };
    let mut machine = state::StateMachine::new(&mut soc, &mut power, &cfg.state)?;
    let mut sys_runner = runner::SystemRunner;
    deb::install(cfg, &mut machine, &mut sys_runner, package, platform, arch, &Downloader::default())?;
    Ok(format!("install {}:{}", package, arch))
}

// ------------------------------------------------------------- interaction

/// y/n questions on the controlling terminal. Anything but an explicit yes
/// counts as a refusal; EOF means the operator is gone.
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, prompt: &str) -> Option<bool> {
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => match line.trim().to_lowercase().as_str() {
                "y" | "yes" => Some(true),
                "n" | "no" => Some(false),
                other => {
                    log::warn!("expected y or n, got {:?}", other);
                    Some(false)
                }
            },
        }
    }
}

/// Relays the blind-mode handshake through the operator's eyes.
struct StdinOperator;

impl secure_debug::Operator for StdinOperator {
    fn read_challenge(&mut self, attempt: u32, max: u32) -> Option<String> {
        println!(
            "Read the 64-hex challenge off the MCU terminal (the line after {:?}).",
            secure_debug::CHALLENGE_MARKER
        );
        print!("challenge ({}/{}): ", attempt, max);
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }

    fn confirm_verified(&mut self) -> Option<bool> {
        println!("Check the MCU terminal for 'Signature Verify Ok' or 'Debug mode ON!'.");
        StdinConfirm.confirm("did verification succeed? [y/n] ")
    }
}

/// Production unlocker: runs the secure-debug session on the MCU console,
/// with or without a human available for the blind path.
struct CliUnlocker {
    firmware_dir: PathBuf,
    interactive: bool,
}

impl uartboot::Unlocker for CliUnlocker {
    fn unlock(&mut self, mcu: &mut dyn Link) -> Result<(), UnlockError> {
        if self.interactive {
            let mut operator = StdinOperator;
            SecureDebugSession::new(mcu, &mut operator, &self.firmware_dir).unlock()
        } else {
            let mut operator = secure_debug::NoOperatorPresent;
            SecureDebugSession::new(mcu, &mut operator, &self.firmware_dir).unlock()
        }
    }
}
