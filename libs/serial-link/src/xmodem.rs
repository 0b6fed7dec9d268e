//! XMODEM-1K sender.
//!
//! 1024-byte STX frames with CRC-16/XMODEM, 0x1A padding on the tail block,
//! CAN-pair abort. The receiver announces readiness by emitting `C`; the
//! caller is expected to have observed that (see `console::wait_for_c`)
//! before starting the transfer.

use std::thread;
use std::time::Duration;

use crate::{Link, LinkError, Progress};

pub const BLOCK_LEN: usize = 1024;

const STX: u8 = 0x02;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const CRC_PROBE: u8 = b'C';
const PAD: u8 = 0x1A;

const BLOCK_RETRIES: usize = 10;
// a slow flash-backed receiver can sit on a block for a long time
const ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of data frames a payload of `len` bytes produces.
pub fn block_count(len: u64) -> u64 { (len + BLOCK_LEN as u64 - 1) / BLOCK_LEN as u64 }

/// CRC-16/XMODEM: poly 0x1021, init 0, no reflection.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= BLOCK_LEN);
    let mut buf = Vec::with_capacity(BLOCK_LEN + 5);
    buf.push(STX);
    buf.push(seq);
    buf.push(!seq);
    buf.extend_from_slice(payload);
    buf.resize(BLOCK_LEN + 3, PAD);
    let crc = crc16(&buf[3..]);
    buf.push((crc >> 8) as u8);
    buf.push((crc & 0xFF) as u8);
    buf
}

/// Send `data` over `link`. Blocks until the receiver has acknowledged every
/// frame and the EOT, or until the retry budget of a frame is exhausted.
pub fn send(link: &mut dyn Link, data: &[u8], progress: &mut dyn Progress) -> Result<(), LinkError> {
    let total = block_count(data.len() as u64);
    progress.start(total);

    // drop any residual 'C' probes so the first ACK we read is really an ACK
    link.clear_input()?;

    let mut seq: u8 = 1;
    for (index, chunk) in data.chunks(BLOCK_LEN).enumerate() {
        let buf = frame(seq, chunk);
        send_frame(link, &buf, index + 1, seq == 1)?;
        progress.advance(1);
        seq = seq.wrapping_add(1);
    }

    // EOT until acknowledged
    let mut retries = 0;
    loop {
        link.write_all(&[EOT])?;
        link.flush()?;
        match link.read_byte(ACK_TIMEOUT)? {
            Some(ACK) => break,
            Some(_) | None => {
                retries += 1;
                if retries >= BLOCK_RETRIES {
                    return Err(LinkError::RetriesExhausted {
                        port: link.name().to_string(),
                        block: block_count(data.len() as u64) as usize + 1,
                    });
                }
            }
        }
    }

    progress.finish();
    log::debug!("{}: xmodem transfer of {} blocks complete", link.name(), total);
    Ok(())
}

fn send_frame(link: &mut dyn Link, buf: &[u8], block: usize, first: bool) -> Result<(), LinkError> {
    let mut retries = 0;
    let mut cancels = 0;
    loop {
        link.write_all(buf)?;
        link.flush()?;

        loop {
            match link.read_byte(ACK_TIMEOUT)? {
                Some(ACK) => return Ok(()),
                Some(NAK) => break,
                Some(CAN) => {
                    cancels += 1;
                    if cancels >= 2 {
                        return Err(LinkError::Cancelled { port: link.name().to_string() });
                    }
                    continue;
                }
                Some(CRC_PROBE) if first => {
                    // a late readiness probe emitted before our first frame
                    // landed; not a response to it
                    continue;
                }
                Some(other) => {
                    log::trace!("{}: unexpected 0x{:02x} while waiting for ack", link.name(), other);
                    continue;
                }
                None => break,
            }
        }

        retries += 1;
        if retries >= BLOCK_RETRIES {
            return Err(LinkError::RetriesExhausted { port: link.name().to_string(), block });
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedLink;
    use crate::NullProgress;

    #[test]
    fn crc_vectors() {
        assert_eq!(crc16(b""), 0x0000);
        assert_eq!(crc16(b"A"), 0x58E5);
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn block_counts() {
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(1), 1);
        assert_eq!(block_count(1024), 1);
        assert_eq!(block_count(1025), 2);
        assert_eq!(block_count(10 * 1024), 10);
    }

    /// Walk the written stream frame by frame. Returns (frames, saw_eot).
    fn parse_stream(mut stream: &[u8]) -> (usize, bool) {
        let mut frames = 0;
        let mut eot = false;
        while !stream.is_empty() {
            match stream[0] {
                STX => {
                    assert!(stream.len() >= BLOCK_LEN + 5, "truncated frame");
                    frames += 1;
                    stream = &stream[BLOCK_LEN + 5..];
                }
                EOT => {
                    eot = true;
                    stream = &stream[1..];
                }
                other => panic!("unexpected byte {:#x} between frames", other),
            }
        }
        (frames, eot)
    }

    fn ack_everything(name: &str) -> ScriptedLink {
        ScriptedLink::with_raw_reactor(
            name,
            Box::new(|data: &[u8]| {
                if data.len() == 1 && data[0] != EOT {
                    Vec::new() // flush-side writes never happen; single bytes are EOT only
                } else {
                    vec![vec![ACK]]
                }
            }),
        )
    }

    #[test]
    fn frames_are_stx_seq_complement_padded_crc() {
        let payload = vec![0xAB; 100];
        let mut link = ack_everything("mcu");
        send(&mut link, &payload, &mut NullProgress).unwrap();

        let written = link.written().to_vec();
        // one 1029-byte frame plus the EOT
        assert_eq!(written.len(), BLOCK_LEN + 5 + 1);
        assert_eq!(written[0], STX);
        assert_eq!(written[1], 1);
        assert_eq!(written[2], !1u8);
        assert_eq!(&written[3..103], &payload[..]);
        assert!(written[103..BLOCK_LEN + 3].iter().all(|&b| b == PAD));
        let crc = crc16(&written[3..BLOCK_LEN + 3]);
        assert_eq!(written[BLOCK_LEN + 3], (crc >> 8) as u8);
        assert_eq!(written[BLOCK_LEN + 4], (crc & 0xFF) as u8);
        assert_eq!(*written.last().unwrap(), EOT);
    }

    #[test]
    fn emits_ceil_len_over_1024_blocks() {
        for (len, expect) in [(1024usize, 1usize), (1025, 2), (3 * 1024 + 17, 4)] {
            let payload = vec![0x5A; len];
            let mut link = ack_everything("mcu");
            send(&mut link, &payload, &mut NullProgress).unwrap();
            let (frames, eot) = parse_stream(link.written());
            assert_eq!(frames, expect, "len {}", len);
            assert!(eot);
        }
    }

    #[test]
    fn nak_triggers_resend() {
        let mut first = true;
        let mut link = ScriptedLink::with_raw_reactor(
            "hsm",
            Box::new(move |data: &[u8]| {
                if data == [EOT] {
                    vec![vec![ACK]]
                } else if first {
                    first = false;
                    vec![vec![NAK]]
                } else {
                    vec![vec![ACK]]
                }
            }),
        );
        send(&mut link, &[1, 2, 3], &mut NullProgress).unwrap();
        let (frames, _) = parse_stream(link.written());
        assert_eq!(frames, 2); // original plus one resend
    }

    #[test]
    fn double_can_aborts() {
        let mut link = ScriptedLink::with_raw_reactor(
            "mcu",
            Box::new(|_data: &[u8]| vec![vec![CAN], vec![CAN]]),
        );
        let err = send(&mut link, &[0u8; 10], &mut NullProgress).unwrap_err();
        assert!(matches!(err, LinkError::Cancelled { .. }));
    }

    #[test]
    fn stray_crc_probe_before_first_ack_is_ignored() {
        let mut sent = false;
        let mut link = ScriptedLink::with_raw_reactor(
            "soc",
            Box::new(move |data: &[u8]| {
                if data == [EOT] {
                    vec![vec![ACK]]
                } else if !sent {
                    sent = true;
                    vec![vec![CRC_PROBE], vec![ACK]]
                } else {
                    vec![vec![ACK]]
                }
            }),
        );
        send(&mut link, &[7u8; 2048], &mut NullProgress).unwrap();
        let (frames, eot) = parse_stream(link.written());
        assert_eq!(frames, 2);
        assert!(eot);
    }
}
