//! UART bootstrap: walk the board's scripted XMODEM transfers across the
//! three consoles until the SoC sits at its uboot prompt listening for
//! fastboot.
//!
//! The order of operations is rigid. The MCU must be coaxed (or unlocked)
//! into UART download mode first; every loading step then waits for that
//! port's `C` handshake before sending its image; and only after the last
//! transfer does the SoC get nudged toward uboot. A failure anywhere aborts
//! the whole flow, because a half-loaded board is not recoverable from the
//! middle.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use board_config::{Config, ConfigError, LoadingStep, UartBootMethod};
use ota_fetch::{DownloadObserver, Downloader, FetchError};
use regex::Regex;
use serial_link::console::{self, CReady};
use serial_link::{xmodem, Link, LinkError, Progress};
use thiserror::Error;

use crate::package::{self, PackageLink, StageError};
use crate::secure_debug::UnlockError;

/// Shell prompts that prove the MCU is *not* in UART download mode.
const SHELL_MARKERS: [&str; 4] = ["horizon:/", "#", "$", "root@"];

#[derive(Debug, Error)]
pub enum BootError {
    #[error("unsupported mcu boot method {0:?}")]
    UnknownMethod(String),
    #[error("bad prompt pattern in state manifest: {0}")]
    BadPrompt(#[from] regex::Error),
    #[error("board {0:?} has no uart boot method configured")]
    NoBootMethod(String),
    #[error("unknown uart port {0:?} in loading step")]
    UnknownPort(String),
    #[error("mcu refused uart download mode after {unlock_rounds} unlock rounds; last output:\n{output}")]
    UartModeFailed { unlock_rounds: u32, output: String },
    #[error("image {image} not found in {dir:?}")]
    MissingImage { image: String, dir: PathBuf },
    #[error("timeout waiting for C prompt on {port} before sending {image}")]
    NoCPrompt { port: String, image: String },
    #[error("soc never reached uboot; accumulated output:\n{0}")]
    NoUboot(String),
    #[error("power control failed: {0}")]
    Power(String),
    #[error("i/o on {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error(transparent)]
    Unlock(#[from] UnlockError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Stage(#[from] StageError),
}

/// Power-cycling seam. Production adapts `relay_ctl::Relay`; tests count
/// calls.
pub trait Power {
    fn reboot(&mut self) -> Result<(), BootError>;
}

pub struct RelayPower<'a> {
    pub relay: &'a mut relay_ctl::Relay,
}

impl<'a> Power for RelayPower<'a> {
    fn reboot(&mut self) -> Result<(), BootError> {
        self.relay
            .execute(relay_ctl::Action::Reboot, None, &mut relay_ctl::DenyAll)
            .map_err(|e| BootError::Power(e.to_string()))
    }
}

/// Secure-debug seam for the `UART locked` recovery path.
pub trait Unlocker {
    fn unlock(&mut self, mcu: &mut dyn Link) -> Result<(), UnlockError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UartStartMethod {
    McuGotoUart,
    McuReboot,
    Manual,
}

impl std::str::FromStr for UartStartMethod {
    type Err = BootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mcu goto uart" | "mcu-goto-uart" => Ok(UartStartMethod::McuGotoUart),
            "mcu reboot" | "mcu-reboot" => Ok(UartStartMethod::McuReboot),
            "manual operation" | "manual" => Ok(UartStartMethod::Manual),
            other => Err(BootError::UnknownMethod(other.to_string())),
        }
    }
}

/// Every wait and retry budget of the flow in one place, so tests can run
/// the identical code paths without wall-clock waits.
#[derive(Clone, Debug)]
pub struct UartTimings {
    pub probe_delay: Duration,
    pub post_reboot: Duration,
    pub goto_uart_window: Duration,
    pub reboot_window: Duration,
    pub poll: Duration,
    pub unlock_settle: Duration,
    pub unlock_rounds: u32,
    pub soc_ready: CReady,
    pub dev_ready: CReady,
    pub uboot_window: Duration,
    pub prompt_poll: Duration,
    pub fastboot_ip_window: Duration,
}

impl Default for UartTimings {
    fn default() -> Self {
        UartTimings {
            probe_delay: Duration::from_millis(300),
            post_reboot: Duration::from_millis(500),
            goto_uart_window: Duration::from_secs(1),
            reboot_window: Duration::from_secs(2),
            poll: Duration::from_millis(50),
            unlock_settle: Duration::from_secs(3),
            unlock_rounds: 3,
            soc_ready: CReady::soc(),
            dev_ready: CReady::keepalive(),
            uboot_window: Duration::from_secs(30),
            prompt_poll: Duration::from_millis(200),
            fastboot_ip_window: Duration::from_secs(30),
        }
    }
}

impl UartTimings {
    #[doc(hidden)]
    pub fn fast() -> Self {
        let quick = Duration::from_millis(1);
        let mut soc_ready = CReady::soc();
        soc_ready.window = Duration::from_millis(100);
        soc_ready.poll = quick;
        let mut dev_ready = CReady::keepalive();
        dev_ready.window = Duration::from_millis(100);
        dev_ready.poll = quick;
        UartTimings {
            probe_delay: quick,
            post_reboot: quick,
            goto_uart_window: Duration::from_millis(30),
            reboot_window: Duration::from_millis(30),
            poll: quick,
            unlock_settle: quick,
            unlock_rounds: 3,
            soc_ready,
            dev_ready,
            uboot_window: Duration::from_millis(200),
            prompt_poll: quick,
            fastboot_ip_window: Duration::from_millis(200),
        }
    }
}

/// Probe whether the MCU already sits in UART download mode: nudge it with
/// newlines and look for the `C` handshake. A shell prompt anywhere in the
/// response settles the question the other way.
pub fn check_uart_mode(mcu: &mut dyn Link, t: &UartTimings) -> Result<bool, BootError> {
    mcu.clear_input()?;
    let mut consecutive = 0;
    for _ in 0..5 {
        mcu.write_all(b"\n")?;
        thread::sleep(t.probe_delay);
        let chunk = mcu.read_avail()?;
        let text = String::from_utf8_lossy(&chunk);
        if text.trim() == "C" || text.contains("CCC") {
            consecutive += 1;
            if consecutive >= 2 {
                log::info!("mcu is already in uart download mode");
                return Ok(true);
            }
        } else {
            consecutive = 0;
            if SHELL_MARKERS.iter().any(|m| text.contains(m)) {
                log::info!("mcu is at a shell prompt, uart mode entry needed");
                return Ok(false);
            }
        }
    }
    Ok(false)
}

/// Put the MCU into UART download mode by the configured strategy,
/// unlocking it first if the firmware reports `UART locked`.
pub fn enter_uart_mode(
    mcu: &mut dyn Link,
    method: UartStartMethod,
    power: &mut dyn Power,
    unlocker: &mut dyn Unlocker,
    mcu_prompts: &[Regex],
    t: &UartTimings,
) -> Result<(), BootError> {
    if check_uart_mode(mcu, t)? {
        return Ok(());
    }

    log::info!("entering uart download mode via {:?}", method);
    match method {
        UartStartMethod::McuGotoUart => goto_uart(mcu, power, unlocker, t),
        UartStartMethod::McuReboot => reboot_into_uart(mcu, power, mcu_prompts, t),
        UartStartMethod::Manual => manual_uart(mcu, t),
    }
}

fn goto_uart(
    mcu: &mut dyn Link,
    power: &mut dyn Power,
    unlocker: &mut dyn Unlocker,
    t: &UartTimings,
) -> Result<(), BootError> {
    power.reboot()?;
    thread::sleep(t.post_reboot);

    let ccc = [Regex::new("CCC").unwrap()];
    let cmd = format!("mcu_goto_uart\n{}", "\n".repeat(16));
    let mut rounds = 0;
    let mut last = String::new();

    while rounds < t.unlock_rounds {
        for _ in 0..3 {
            let (hit, output) = console::send_expect(mcu, &cmd, t.goto_uart_window, &ccc, t.poll)?;
            log::debug!("mcu_goto_uart output:\n{}", output);
            if hit {
                log::info!("mcu entered uart download mode");
                return Ok(());
            }
            last = output;
            if last.contains("UART locked") {
                break;
            }
        }

        if !last.contains("UART locked") {
            break;
        }

        rounds += 1;
        log::warn!("uart is locked; secure debug unlock round {}/{}", rounds, t.unlock_rounds);
        match unlocker.unlock(mcu) {
            Ok(()) => {
                log::info!("unlock succeeded, settling before retrying uart entry");
                thread::sleep(t.unlock_settle);
            }
            Err(e) => log::error!("unlock round {} failed: {}", rounds, e),
        }
    }

    Err(BootError::UartModeFailed { unlock_rounds: rounds, output: last })
}

fn reboot_into_uart(
    mcu: &mut dyn Link,
    power: &mut dyn Power,
    mcu_prompts: &[Regex],
    t: &UartTimings,
) -> Result<(), BootError> {
    power.reboot()?;

    // older firmware wants mcureboot, newer wants mcureset; send both
    let cmd = format!("mcureboot\nmcureset{}", "\n".repeat(16));
    let mut last = String::new();
    for _ in 0..8 {
        let (_, output) = console::send_expect(mcu, &cmd, t.reboot_window, mcu_prompts, t.poll)?;
        log::debug!("mcu serial output:\n{}", output);
        if output.contains("CCC") {
            return Ok(());
        }
        last = output;
    }
    Err(BootError::UartModeFailed { unlock_rounds: 0, output: last })
}

fn manual_uart(mcu: &mut dyn Link, t: &UartTimings) -> Result<(), BootError> {
    log::info!("waiting for a manual uart mode entry (watching for 'CCC')...");
    let ccc = [Regex::new("CCC").unwrap()];
    let read_timeout = mcu.read_timeout();
    let (hit, output) = console::wait_for_prompt(mcu, &ccc, read_timeout, None, t.prompt_poll)?;
    if hit {
        Ok(())
    } else {
        Err(BootError::UartModeFailed { unlock_rounds: 0, output })
    }
}

/// Locate one step image. The HSM firmware package sometimes ships with the
/// board name prefixed.
fn resolve_image(image_dir: &Path, board: &str, image: &str) -> Result<PathBuf, BootError> {
    let direct = image_dir.join(image);
    if direct.exists() {
        return Ok(direct);
    }
    if image == "hsmfw_se.pkg" {
        let prefixed = image_dir.join(format!("{}-{}", board, image));
        if prefixed.exists() {
            return Ok(prefixed);
        }
    }
    Err(BootError::MissingImage { image: image.to_string(), dir: image_dir.to_owned() })
}

fn drain_trailing(link: &mut dyn Link) -> Result<(), BootError> {
    let mut tail = String::new();
    loop {
        let chunk = link.read_avail()?;
        if chunk.is_empty() {
            break;
        }
        tail.push_str(&String::from_utf8_lossy(&chunk));
    }
    if !tail.is_empty() {
        log::debug!("{} trailing output:\n{}", link.name(), tail);
    }
    Ok(())
}

/// Run the scripted transfers, one image at a time, in manifest order.
/// The SoC console is only ever *read* until its own step comes up.
pub fn run_loading_steps(
    soc: &mut dyn Link,
    mcu: &mut dyn Link,
    hsm: &mut dyn Link,
    steps: &[LoadingStep],
    board: &str,
    image_dir: &Path,
    progress: &mut dyn Progress,
    t: &UartTimings,
) -> Result<(), BootError> {
    // fail on a missing image before the first byte hits a console
    for step in steps {
        for image in &step.img_data {
            resolve_image(image_dir, board, image)?;
        }
    }

    for step in steps {
        for image in &step.img_data {
            let path = resolve_image(image_dir, board, image)?;
            let data = fs::read(&path).map_err(|source| BootError::Io { path: path.clone(), source })?;

            let (link, ready): (&mut dyn Link, &CReady) = match step.uart_port.as_str() {
                "soc" => (&mut *soc, &t.soc_ready),
                "mcu" => (&mut *mcu, &t.dev_ready),
                "hsm" => (&mut *hsm, &t.dev_ready),
                other => return Err(BootError::UnknownPort(other.to_string())),
            };

            log::info!("waiting for C prompt on {} to load {}", step.uart_port, path.display());
            let (hit, _) = console::wait_for_c(link, ready)?;
            if !hit {
                return Err(BootError::NoCPrompt {
                    port: step.uart_port.clone(),
                    image: image.clone(),
                });
            }

            log::info!("loading {} ({} blocks)", image, xmodem::block_count(data.len() as u64));
            xmodem::send(link, &data, progress)?;
            drain_trailing(link)?;
        }
    }
    Ok(())
}

/// Nudge the SoC to its uboot prompt, switch it into network fastboot and
/// return the address it listens on (if it printed one).
pub fn wait_uboot_then_fastboot(
    soc: &mut dyn Link,
    uboot_prompts: &[Regex],
    t: &UartTimings,
) -> Result<Option<String>, BootError> {
    log::info!("waiting for the soc to reach uboot");
    let (hit, content) =
        console::wait_for_prompt(soc, uboot_prompts, t.uboot_window, Some(b"\n"), t.prompt_poll)?;
    if !hit {
        return Err(BootError::NoUboot(content));
    }
    log::info!("soc is at uboot; starting network fastboot");

    soc.write_all(b"fastboot udp\n")?;
    soc.flush()?;

    let ip_pattern = Regex::new(r"Listening for fastboot command on (\d+\.\d+\.\d+\.\d+)").unwrap();
    let patterns = [ip_pattern.clone()];
    let (hit, output) =
        console::wait_for_prompt(soc, &patterns, t.fastboot_ip_window, None, t.prompt_poll)?;
    if hit {
        let ip = ip_pattern.captures(&output).map(|c| c[1].to_string());
        log::info!("board fastboot address: {}", ip.as_deref().unwrap_or("?"));
        Ok(ip)
    } else {
        log::warn!("fastboot started but no listening address was printed");
        log::debug!("fastboot command output:\n{}", output);
        Ok(None)
    }
}

/// Make sure every non-SoC step image exists in the scratch dir; download
/// and unpack the MCU SDK if not.
pub fn prepare_mcu_images(
    cfg: &Config,
    method: &UartBootMethod,
    device: &str,
    scratch: &Path,
    downloader: &Downloader,
    observer: &mut dyn DownloadObserver,
) -> Result<(), BootError> {
    let missing: Vec<&String> = method
        .loading_step
        .iter()
        .filter(|step| step.uart_port != "soc")
        .flat_map(|step| step.img_data.iter())
        .filter(|image| !scratch.join(image.as_str()).exists())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    log::info!("mcu images missing from {}: {:?}; fetching the mcu sdk", scratch.display(), missing);

    let url = cfg.mcu_sdk_url(method, device)?;
    let download_dir = scratch.parent().map(Path::to_owned).unwrap_or_else(std::env::temp_dir);
    let sdk_zip = downloader.download(url, &download_dir, observer)?;
    ota_fetch::unzip(&sdk_zip, scratch)?;

    for (nested, flat) in &[("IMG/SBL.img", "SBL.img"), ("BIN/J6_MCU_DEBUG.bin", "J6_MCU_DEBUG.bin")] {
        let src = scratch.join(nested);
        if !src.exists() {
            return Err(BootError::MissingImage { image: nested.to_string(), dir: scratch.to_owned() });
        }
        fs::copy(&src, scratch.join(flat))
            .map_err(|source| BootError::Io { path: src.clone(), source })?;
    }

    // loose firmware blobs that ride along with every station
    let firmware_dir = cfg.mcu_firmware_dir();
    if !firmware_dir.is_dir() {
        return Err(BootError::MissingImage {
            image: "mcu_firmware/".to_string(),
            dir: firmware_dir,
        });
    }
    for entry in fs::read_dir(&firmware_dir)
        .map_err(|source| BootError::Io { path: firmware_dir.clone(), source })?
    {
        let entry = entry.map_err(|source| BootError::Io { path: firmware_dir.clone(), source })?;
        if entry.path().is_file() {
            fs::copy(entry.path(), scratch.join(entry.file_name()))
                .map_err(|source| BootError::Io { path: entry.path(), source })?;
        }
    }
    Ok(())
}

/// Consoles and collaborators of one boot run, borrowed from the caller so
/// tests can hand in fakes.
pub struct BootContext<'a> {
    pub soc: &'a mut dyn Link,
    pub mcu: &'a mut dyn Link,
    pub hsm: &'a mut dyn Link,
    pub power: &'a mut dyn Power,
    pub unlocker: &'a mut dyn Unlocker,
    pub progress: &'a mut dyn Progress,
    pub observer: &'a mut dyn DownloadObserver,
    pub timings: UartTimings,
}

/// The whole flow: uart mode entry (with lock recovery), package staging,
/// MCU image provisioning, the scripted transfers, then uboot + fastboot.
pub fn boot(
    ctx: &mut BootContext,
    cfg: &Config,
    board: &str,
    link: Option<&PackageLink>,
    method: UartStartMethod,
    scratch: &Path,
    downloader: &Downloader,
) -> Result<Option<String>, BootError> {
    let entry = cfg.board(board)?;
    let boot_method =
        cfg.uart_boot.uart_boot_methods.first().ok_or_else(|| BootError::NoBootMethod(board.to_string()))?;

    let mcu_prompts = console::compile_prompts(&cfg.state.prompts.mcu)?;
    enter_uart_mode(ctx.mcu, method, ctx.power, ctx.unlocker, &mcu_prompts, &ctx.timings)?;

    let image_dir = package::stage(link, cfg, board, scratch, downloader, ctx.observer)?;
    prepare_mcu_images(cfg, boot_method, &entry.device, &image_dir, downloader, ctx.observer)?;

    run_loading_steps(
        ctx.soc,
        ctx.mcu,
        ctx.hsm,
        &boot_method.loading_step,
        board,
        &image_dir,
        ctx.progress,
        &ctx.timings,
    )?;

    let uboot_prompts = console::compile_prompts(&cfg.state.prompts.uboot)?;
    wait_uboot_then_fastboot(ctx.soc, &uboot_prompts, &ctx.timings)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use serial_link::fakes::ScriptedLink;
    use serial_link::NullProgress;

    use super::*;

    const ACK: u8 = 0x06;
    const EOT: u8 = 0x04;

    struct MockPower {
        reboots: u32,
    }

    impl Power for MockPower {
        fn reboot(&mut self) -> Result<(), BootError> {
            self.reboots += 1;
            Ok(())
        }
    }

    struct MockUnlocker {
        unlocked: Arc<AtomicBool>,
        calls: u32,
    }

    impl Unlocker for MockUnlocker {
        fn unlock(&mut self, _mcu: &mut dyn Link) -> Result<(), UnlockError> {
            self.calls += 1;
            self.unlocked.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn locked_mcu_recovers_through_one_unlock() {
        let unlocked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&unlocked);
        let mut mcu = ScriptedLink::with_raw_reactor(
            "mcu",
            Box::new(move |data: &[u8]| {
                if data.starts_with(b"mcu_goto_uart") {
                    if flag.load(Ordering::SeqCst) {
                        vec![b"CCC".to_vec()]
                    } else {
                        vec![b"UART locked\r\n".to_vec()]
                    }
                } else {
                    Vec::new()
                }
            }),
        );

        let mut power = MockPower { reboots: 0 };
        let mut unlocker = MockUnlocker { unlocked, calls: 0 };
        let t = UartTimings::fast();
        enter_uart_mode(&mut mcu, UartStartMethod::McuGotoUart, &mut power, &mut unlocker, &[], &t)
            .unwrap();

        assert_eq!(unlocker.calls, 1, "exactly one secure-debug unlock expected");
        assert_eq!(power.reboots, 1);
    }

    #[test]
    fn locked_mcu_gives_up_after_three_rounds() {
        let mut mcu = ScriptedLink::with_raw_reactor(
            "mcu",
            Box::new(|data: &[u8]| {
                if data.starts_with(b"mcu_goto_uart") {
                    vec![b"UART locked\r\n".to_vec()]
                } else {
                    Vec::new()
                }
            }),
        );
        let mut power = MockPower { reboots: 0 };
        // the unlocker reports success but the reactor never clears the lock
        let mut unlocker = MockUnlocker { unlocked: Arc::new(AtomicBool::new(false)), calls: 0 };

        let t = UartTimings::fast();
        let err =
            enter_uart_mode(&mut mcu, UartStartMethod::McuGotoUart, &mut power, &mut unlocker, &[], &t)
                .unwrap_err();
        match err {
            BootError::UartModeFailed { unlock_rounds: 3, .. } => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(unlocker.calls, 3);
    }

    #[test]
    fn already_in_uart_mode_skips_power_cycle() {
        let mut mcu = ScriptedLink::with_raw_reactor(
            "mcu",
            Box::new(|data: &[u8]| if data == b"\n" { vec![b"C".to_vec()] } else { Vec::new() }),
        );
        let mut power = MockPower { reboots: 0 };
        let mut unlocker = MockUnlocker { unlocked: Arc::new(AtomicBool::new(false)), calls: 0 };
        let t = UartTimings::fast();
        enter_uart_mode(&mut mcu, UartStartMethod::McuGotoUart, &mut power, &mut unlocker, &[], &t)
            .unwrap();
        assert_eq!(power.reboots, 0);
        assert_eq!(unlocker.calls, 0);
    }

    fn xmodem_receiver(name: &str) -> ScriptedLink {
        ScriptedLink::with_raw_reactor(
            name,
            Box::new(|data: &[u8]| {
                if data == b"\n" {
                    vec![b"CCC".to_vec()]
                } else if data.len() > 1 || data == [EOT] {
                    vec![vec![ACK]]
                } else {
                    Vec::new()
                }
            }),
        )
    }

    #[test]
    fn loading_steps_run_in_order_and_leave_soc_untouched() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("SBL.img"), vec![0x11u8; 2100]).unwrap();
        fs::write(dir.path().join("spl_uart.img"), vec![0x22u8; 100]).unwrap();

        let mut mcu = xmodem_receiver("mcu");
        let mut hsm = xmodem_receiver("hsm");
        let mut soc = ScriptedLink::with_raw_reactor(
            "soc",
            Box::new(|data: &[u8]| {
                if data.len() > 1 || data == [EOT] {
                    vec![vec![ACK]]
                } else {
                    Vec::new()
                }
            }),
        );
        soc.respond_once(b"CCC"); // the boot rom announces readiness on its own

        let steps = vec![
            LoadingStep { uart_port: "mcu".into(), img_data: vec!["SBL.img".into()] },
            LoadingStep { uart_port: "soc".into(), img_data: vec!["spl_uart.img".into()] },
        ];
        let t = UartTimings::fast();
        run_loading_steps(
            &mut soc,
            &mut mcu,
            &mut hsm,
            &steps,
            "cvm-a55",
            dir.path(),
            &mut NullProgress,
            &t,
        )
        .unwrap();

        // mcu got 3 frames (2100 bytes) plus EOT; keepalive newlines preceded them
        assert_eq!(mcu.written().iter().filter(|&&b| b == EOT).count(), 1);
        // the soc console is passive: nothing but frames may be written to it
        assert_eq!(soc.written()[0], 0x02, "no keepalive bytes allowed on the soc port");
        assert!(hsm.written().is_empty());
    }

    #[test]
    fn missing_image_fails_before_any_console_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut soc = ScriptedLink::new("soc");
        let mut mcu = ScriptedLink::new("mcu");
        let mut hsm = ScriptedLink::new("hsm");
        let steps = vec![LoadingStep { uart_port: "mcu".into(), img_data: vec!["nope.img".into()] }];
        let t = UartTimings::fast();
        let err = run_loading_steps(
            &mut soc,
            &mut mcu,
            &mut hsm,
            &steps,
            "cvm-a55",
            dir.path(),
            &mut NullProgress,
            &t,
        )
        .unwrap_err();
        assert!(matches!(err, BootError::MissingImage { .. }));
        assert!(mcu.written().is_empty());
    }

    #[test]
    fn hsm_package_falls_back_to_board_prefixed_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cvm-a55-hsmfw_se.pkg"), b"fw").unwrap();
        let path = resolve_image(dir.path(), "cvm-a55", "hsmfw_se.pkg").unwrap();
        assert!(path.ends_with("cvm-a55-hsmfw_se.pkg"));
    }

    #[test]
    fn uboot_prompt_then_fastboot_ip() {
        let mut soc = ScriptedLink::with_raw_reactor(
            "soc",
            Box::new(|data: &[u8]| {
                if data == b"\n" {
                    vec![b"U-Boot 2022.01\r\n=> ".to_vec()]
                } else if data.starts_with(b"fastboot udp") {
                    vec![b"Listening for fastboot command on 192.168.2.62\r\n".to_vec()]
                } else {
                    Vec::new()
                }
            }),
        );
        let prompts = console::compile_prompts(&["=>".to_string()]).unwrap();
        let t = UartTimings::fast();
        let ip = wait_uboot_then_fastboot(&mut soc, &prompts, &t).unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.2.62"));
    }

    #[test]
    fn uboot_timeout_is_fatal() {
        let mut soc = ScriptedLink::new("soc");
        let prompts = console::compile_prompts(&["=>".to_string()]).unwrap();
        let t = UartTimings::fast();
        let err = wait_uboot_then_fastboot(&mut soc, &prompts, &t).unwrap_err();
        assert!(matches!(err, BootError::NoUboot(_)));
    }
}
