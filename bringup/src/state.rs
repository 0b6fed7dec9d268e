//! Drives the SoC between power-off, uboot and kernel by watching its
//! console and pulling the power relay when nothing else helps. The prompt
//! patterns live in the state manifest, not here.

use std::thread;
use std::time::Duration;

use board_config::StateConfig;
use regex::Regex;
use serial_link::console;
use serial_link::{Link, LinkError};
use thiserror::Error;

use crate::uartboot::{BootError, Power};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocState {
    PowerOff,
    Uboot,
    KernelNormal,
    KernelRecovery,
    Unknown,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("bad prompt pattern in state manifest: {0}")]
    BadPrompt(#[from] regex::Error),
    #[error("soc did not reach {want:?} within {budget:?}; last output:\n{output}")]
    WrongState { want: SocState, budget: Duration, output: String },
    #[error("power control failed: {0}")]
    Power(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Clone, Debug)]
pub struct StateTimings {
    /// How long a silent console means "probably powered off".
    pub probe_window: Duration,
    /// Boot budget from power-on to a kernel prompt.
    pub boot_window: Duration,
    pub poll: Duration,
}

impl Default for StateTimings {
    fn default() -> Self {
        StateTimings {
            probe_window: Duration::from_secs(5),
            boot_window: Duration::from_secs(120),
            poll: Duration::from_millis(200),
        }
    }
}

pub struct StateMachine<'a> {
    soc: &'a mut dyn Link,
    power: &'a mut dyn Power,
    uboot: Vec<Regex>,
    kernel: Vec<Regex>,
    timings: StateTimings,
}

impl<'a> StateMachine<'a> {
    pub fn new(
        soc: &'a mut dyn Link,
        power: &'a mut dyn Power,
        state_cfg: &StateConfig,
    ) -> Result<StateMachine<'a>, StateError> {
        Ok(StateMachine {
            soc,
            power,
            uboot: console::compile_prompts(&state_cfg.prompts.uboot)?,
            kernel: console::compile_prompts(&state_cfg.prompts.kernel)?,
            timings: StateTimings::default(),
        })
    }

    #[doc(hidden)]
    pub fn with_timings(mut self, timings: StateTimings) -> Self {
        self.timings = timings;
        self
    }

    /// One probe: poke the console with a newline and classify whatever
    /// prompt answers.
    pub fn probe(&mut self) -> Result<SocState, StateError> {
        let (_, output) = console::wait_for_prompt(
            self.soc,
            &[],
            self.timings.probe_window,
            Some(b"\n"),
            self.timings.poll,
        )?;
        Ok(self.classify(&output))
    }

    fn classify(&self, output: &str) -> SocState {
        if self.kernel.iter().any(|p| p.is_match(output)) {
            // recovery kernels identify themselves on the prompt line
            if output.contains("recovery") {
                SocState::KernelRecovery
            } else {
                SocState::KernelNormal
            }
        } else if self.uboot.iter().any(|p| p.is_match(output)) {
            SocState::Uboot
        } else if output.trim().is_empty() {
            SocState::PowerOff
        } else {
            SocState::Unknown
        }
    }

    /// Get the SoC to a normal kernel prompt, power-cycling once if the
    /// console does not show one already.
    pub fn enter_kernel_normal(&mut self) -> Result<(), StateError> {
        let (hit, output) = console::wait_for_prompt(
            self.soc,
            &self.kernel,
            self.timings.probe_window,
            Some(b"\n"),
            self.timings.poll,
        )?;
        if hit && !output.contains("recovery") {
            log::info!("soc already at a kernel prompt");
            return Ok(());
        }

        log::info!("no kernel prompt, power-cycling the board");
        self.power.reboot().map_err(|e: BootError| StateError::Power(e.to_string()))?;
        thread::sleep(self.timings.poll);

        let (hit, output) = console::wait_for_prompt(
            self.soc,
            &self.kernel,
            self.timings.boot_window,
            Some(b"\n"),
            self.timings.poll,
        )?;
        if hit {
            log::info!("soc reached kernel normal mode");
            Ok(())
        } else {
            Err(StateError::WrongState {
                want: SocState::KernelNormal,
                budget: self.timings.boot_window,
                output,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use board_config::Prompts;
    use serial_link::fakes::ScriptedLink;

    use super::*;

    struct MockPower {
        reboots: u32,
        booted: Arc<AtomicBool>,
    }

    impl Power for MockPower {
        fn reboot(&mut self) -> Result<(), BootError> {
            self.reboots += 1;
            self.booted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn state_cfg() -> StateConfig {
        StateConfig {
            prompts: Prompts {
                uboot: vec!["=>\\s*".to_string()],
                mcu: vec!["CCC".to_string()],
                kernel: vec!["login:".to_string(), "root@.*:".to_string()],
            },
        }
    }

    fn fast() -> StateTimings {
        StateTimings {
            probe_window: Duration::from_millis(50),
            boot_window: Duration::from_millis(200),
            poll: Duration::from_millis(1),
        }
    }

    #[test]
    fn kernel_prompt_short_circuits_power_cycle() {
        let mut soc = ScriptedLink::with_raw_reactor(
            "soc",
            Box::new(|data: &[u8]| {
                if data == b"\n" { vec![b"cvm-a55 login: ".to_vec()] } else { Vec::new() }
            }),
        );
        let booted = Arc::new(AtomicBool::new(false));
        let mut power = MockPower { reboots: 0, booted: Arc::clone(&booted) };
        let cfg = state_cfg();
        let mut machine = StateMachine::new(&mut soc, &mut power, &cfg).unwrap().with_timings(fast());
        machine.enter_kernel_normal().unwrap();
        assert_eq!(power.reboots, 0);
    }

    #[test]
    fn silent_console_gets_a_power_cycle_then_boots() {
        let booted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&booted);
        let mut soc = ScriptedLink::with_raw_reactor(
            "soc",
            Box::new(move |data: &[u8]| {
                if data == b"\n" && flag.load(Ordering::SeqCst) {
                    vec![b"[  3.14] systemd started\r\ncvm-a55 login: ".to_vec()]
                } else {
                    Vec::new()
                }
            }),
        );
        let mut power = MockPower { reboots: 0, booted };
        let cfg = state_cfg();
        let mut machine = StateMachine::new(&mut soc, &mut power, &cfg).unwrap().with_timings(fast());
        machine.enter_kernel_normal().unwrap();
        assert_eq!(power.reboots, 1);
    }

    #[test]
    fn classification_matches_prompt_sets() {
        let mut soc = ScriptedLink::new("soc");
        let booted = Arc::new(AtomicBool::new(false));
        let mut power = MockPower { reboots: 0, booted };
        let cfg = state_cfg();
        let machine = StateMachine::new(&mut soc, &mut power, &cfg).unwrap();
        assert_eq!(machine.classify("=> "), SocState::Uboot);
        assert_eq!(machine.classify("cvm login: "), SocState::KernelNormal);
        assert_eq!(machine.classify("recovery login: "), SocState::KernelRecovery);
        assert_eq!(machine.classify(""), SocState::PowerOff);
        assert_eq!(machine.classify("garbage"), SocState::Unknown);
    }
}
