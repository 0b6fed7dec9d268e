//! External command execution with a hard per-command deadline.
//!
//! fastboot, ping, scp and ssh all run through this seam so the flows can
//! be tested against a scripted runner.

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub success: bool,
    /// stdout and stderr, concatenated; fastboot reports on stderr.
    pub output: String,
}

pub trait CommandRunner {
    fn run(&mut self, program: &str, args: &[String], timeout: Duration) -> std::io::Result<CmdOutput>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, program: &str, args: &[String], timeout: Duration) -> std::io::Result<CmdOutput> {
        log::debug!("run: {} {} (timeout {:?})", program, args.join(" "), timeout);
        let mut child =
            Command::new(program).args(args).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait()? {
                Some(_) => break,
                None => {
                    if Instant::now() >= deadline {
                        log::warn!("{} timed out after {:?}, killing it", program, timeout);
                        let _ = child.kill();
                        let _ = child.wait();
                        return Ok(CmdOutput {
                            success: false,
                            output: format!("{} timed out after {:?}", program, timeout),
                        });
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        let output = child.wait_with_output()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CmdOutput { success: output.status.success(), output: text })
    }
}
