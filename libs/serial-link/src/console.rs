//! Console command and prompt discipline.
//!
//! Two disciplines live here. The MCU shell one ([`command`]) paces every
//! character out individually and then polls the input side until it goes
//! quiet. The boot-flow one ([`send_expect`], [`wait_for_prompt`],
//! [`wait_for_c`]) accumulates console output against a deadline and matches
//! prompt patterns in the accumulated text.

use std::thread;
use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};

use crate::{Link, LinkError};

/// Timing knobs of the paced command discipline. Hardware uses
/// [`Pacing::mcu_shell`]; tests use [`Pacing::immediate`] so a scripted peer
/// answers without wall-clock cost.
#[derive(Clone, Copy, Debug)]
pub struct Pacing {
    /// Delay after each transmitted character.
    pub per_char: Duration,
    /// Settle time between the CRLF and the first read poll.
    pub settle: Duration,
    /// Delay between empty read polls.
    pub poll: Duration,
    /// Consecutive empty polls that end the read-back.
    pub empty_polls: u32,
}

impl Pacing {
    /// The timing the MCU's secure-debug shell needs: 10 ms per character,
    /// 200 ms settle, then 100 ms polls ending after 3 consecutive misses.
    pub fn mcu_shell() -> Self {
        Pacing {
            per_char: Duration::from_millis(10),
            settle: Duration::from_millis(200),
            poll: Duration::from_millis(100),
            empty_polls: 3,
        }
    }

    pub fn immediate() -> Self {
        Pacing { per_char: Duration::ZERO, settle: Duration::ZERO, poll: Duration::ZERO, empty_polls: 1 }
    }
}

fn write_paced(link: &mut dyn Link, cmd: &str, pacing: &Pacing) -> Result<(), LinkError> {
    link.clear_input()?;
    for byte in cmd.as_bytes() {
        link.write_all(std::slice::from_ref(byte))?;
        if !pacing.per_char.is_zero() {
            thread::sleep(pacing.per_char);
        }
    }
    link.write_all(b"\r\n")?;
    link.flush()
}

/// Send one shell command and collect its response.
///
/// The input buffer is cleared first, so the response is attributable to
/// this command. Reading stops after `pacing.empty_polls` consecutive empty
/// polls; if nothing arrived at all, one blocking read of up to the link's
/// read timeout is attempted before giving up.
pub fn command(link: &mut dyn Link, cmd: &str, pacing: &Pacing) -> Result<String, LinkError> {
    write_paced(link, cmd, pacing)?;
    if !pacing.settle.is_zero() {
        thread::sleep(pacing.settle);
    }

    let mut acc: Vec<u8> = Vec::new();
    let mut empty = 0;
    while empty < pacing.empty_polls {
        let chunk = link.read_avail()?;
        if chunk.is_empty() {
            empty += 1;
            if empty < pacing.empty_polls && !pacing.poll.is_zero() {
                thread::sleep(pacing.poll);
            }
        } else {
            acc.extend_from_slice(&chunk);
            empty = 0;
        }
    }

    if acc.is_empty() {
        if let Some(byte) = link.read_byte(link.read_timeout())? {
            acc.push(byte);
            acc.extend_from_slice(&link.read_avail()?);
        }
    }

    let text = String::from_utf8_lossy(&acc).into_owned();
    log::trace!("{} <- {:?}", link.name(), text);
    Ok(text)
}

/// Send one shell command without reading anything back. Used by the blind
/// unlock path where the MCU echoes nothing useful.
pub fn command_blind(link: &mut dyn Link, cmd: &str, pacing: &Pacing) -> Result<(), LinkError> {
    write_paced(link, cmd, pacing)
}

/// Write `data` once, then accumulate console output until any pattern
/// matches or `timeout` elapses. Returns the match flag and everything read.
pub fn send_expect(
    link: &mut dyn Link,
    data: &str,
    timeout: Duration,
    patterns: &[Regex],
    poll: Duration,
) -> Result<(bool, String), LinkError> {
    link.write_all(data.as_bytes())?;
    link.flush()?;

    let deadline = Instant::now() + timeout;
    let mut acc = String::new();
    loop {
        let chunk = link.read_avail()?;
        acc.push_str(&String::from_utf8_lossy(&chunk));
        if patterns.iter().any(|p| p.is_match(&acc)) {
            return Ok((true, acc));
        }
        if Instant::now() >= deadline {
            return Ok((false, acc));
        }
        thread::sleep(poll);
    }
}

/// Repeatedly write `keepalive` (if any) while accumulating output, until a
/// prompt pattern matches or `timeout` elapses.
pub fn wait_for_prompt(
    link: &mut dyn Link,
    patterns: &[Regex],
    timeout: Duration,
    keepalive: Option<&[u8]>,
    poll: Duration,
) -> Result<(bool, String), LinkError> {
    let deadline = Instant::now() + timeout;
    let mut acc = String::new();
    loop {
        if let Some(bytes) = keepalive {
            link.write_all(bytes)?;
        }
        let chunk = link.read_avail()?;
        acc.push_str(&String::from_utf8_lossy(&chunk));
        if patterns.iter().any(|p| p.is_match(&acc)) {
            return Ok((true, acc));
        }
        if Instant::now() >= deadline {
            return Ok((false, acc));
        }
        thread::sleep(poll);
    }
}

/// How to wait for the XMODEM receiver's `C` handshake on one console.
#[derive(Clone, Copy, Debug)]
pub struct CReady {
    /// Send a newline every poll. The SoC boot-ROM must never be poked, so
    /// its waiter runs passive; the MCU and HSM need the nudge.
    pub keepalive: bool,
    /// Consecutive `C` observations required before declaring readiness.
    pub required: u32,
    /// Total wait budget.
    pub window: Duration,
    /// Answer a `Please enter 1 or 0` SecureDebug query with a bare `0`.
    pub answer_secure_prompt: bool,
    /// Poll interval between reads.
    pub poll: Duration,
}

impl CReady {
    /// Passive SoC-side wait: ~10 s, a single `C` suffices.
    pub fn soc() -> Self {
        CReady {
            keepalive: false,
            required: 1,
            window: Duration::from_secs(10),
            answer_secure_prompt: false,
            poll: Duration::from_millis(200),
        }
    }

    /// Keepalive wait for the MCU/HSM side: ~15 s, two consecutive `C`s.
    pub fn keepalive() -> Self {
        CReady {
            keepalive: true,
            required: 2,
            window: Duration::from_secs(15),
            answer_secure_prompt: true,
            poll: Duration::from_millis(200),
        }
    }
}

/// Wait until the console signals XMODEM readiness: `required` consecutive
/// polls that read `C` (alone) or any poll containing `CCC`.
pub fn wait_for_c(link: &mut dyn Link, opts: &CReady) -> Result<(bool, String), LinkError> {
    let deadline = Instant::now() + opts.window;
    let mut acc = String::new();
    let mut consecutive = 0;
    while Instant::now() < deadline {
        if opts.keepalive {
            link.write_all(b"\n")?;
        }
        thread::sleep(opts.poll);
        let chunk = link.read_avail()?;
        let chunk_str = String::from_utf8_lossy(&chunk).into_owned();
        acc.push_str(&chunk_str);

        if opts.answer_secure_prompt && chunk_str.contains("Please enter 1 or 0") {
            // the SecureDebug query wants a bare '0', no newline, after a
            // 2 s grace so the firmware is actually listening
            thread::sleep(Duration::from_secs(2));
            link.write_all(b"0")?;
            thread::sleep(Duration::from_millis(200));
            continue;
        }

        if chunk_str.trim() == "C" || chunk_str.contains("CCC") {
            consecutive += 1;
            if consecutive >= opts.required {
                return Ok((true, acc));
            }
        } else {
            consecutive = 0;
        }
    }
    Ok((false, acc))
}

/// Compile a prompt set from the state manifest. Prompt matching is
/// case-insensitive, matching how operators write them.
pub fn compile_prompts(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|p| RegexBuilder::new(p).case_insensitive(true).build()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedLink;

    #[test]
    fn command_clears_input_and_paces_out_crlf() {
        let mut link = ScriptedLink::new("mcu");
        link.push_stale(b"old noise");
        link.respond_once(b"ok\r\n");
        let reply = command(&mut link, "help", &Pacing::immediate()).unwrap();
        assert_eq!(reply, "ok\r\n");
        // stale input must not leak into the response
        assert!(!reply.contains("noise"));
        assert_eq!(link.written(), b"help\r\n");
    }

    #[test]
    fn send_expect_matches_accumulated_output() {
        let mut link = ScriptedLink::new("mcu");
        link.respond_once(b"CC");
        link.respond_once(b"C");
        let patterns = vec![Regex::new("CCC").unwrap()];
        let (hit, output) =
            send_expect(&mut link, "mcu_goto_uart\n", Duration::from_millis(200), &patterns, Duration::ZERO)
                .unwrap();
        assert!(hit);
        assert!(output.contains("CCC"));
    }

    #[test]
    fn wait_for_c_needs_consecutive_cs() {
        let mut link = ScriptedLink::new("hsm");
        link.respond_once(b"C");
        link.respond_once(b"garbage");
        link.respond_once(b"C");
        link.respond_once(b"C");
        let opts = CReady {
            keepalive: true,
            required: 2,
            window: Duration::from_secs(2),
            answer_secure_prompt: false,
            poll: Duration::from_millis(1),
        };
        let (hit, _) = wait_for_c(&mut link, &opts).unwrap();
        assert!(hit);
    }

    #[test]
    fn wait_for_c_accepts_ccc_burst() {
        let mut link = ScriptedLink::new("soc");
        link.respond_once(b"boot rom v2\r\nCCC");
        let mut opts = CReady::soc();
        opts.poll = Duration::from_millis(1);
        opts.window = Duration::from_millis(100);
        let (hit, _) = wait_for_c(&mut link, &opts).unwrap();
        assert!(hit);
    }

    #[test]
    fn secure_prompt_answered_with_bare_zero() {
        let mut link = ScriptedLink::new("mcu");
        link.respond_once(b"Please enter 1 or 0");
        link.respond_once(b"CCC");
        let opts = CReady {
            keepalive: true,
            required: 1,
            window: Duration::from_secs(5),
            answer_secure_prompt: true,
            poll: Duration::from_millis(1),
        };
        let (hit, _) = wait_for_c(&mut link, &opts).unwrap();
        assert!(hit);
        // keepalive newlines plus exactly one bare '0'
        assert_eq!(link.written().iter().filter(|&&b| b == b'0').count(), 1);
    }
}
