//! Secure-debug unlock of a locked MCU.
//!
//! The handshake pushes an X.509 certificate over the MCU shell in numbered
//! fragments, receives a 32-byte random challenge back, signs it with the
//! station's ECDSA P-256 key and pushes the signature back in fragments.
//! A responsive shell ACKs every fragment; a shell in card-platform mode
//! echoes nothing, so fragments go out blind on a fixed cadence and the
//! operator relays the challenge and the verdict by hand.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use regex::Regex;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serial_link::console::{self, Pacing};
use serial_link::{Link, LinkError};
use thiserror::Error;

/// The marker is the MCU firmware's actual output, misspelling included.
pub const CHALLENGE_MARKER: &str = "Rondom numbers are:";
pub const ACK_MARKER: &str = "Successfully received data";
pub const VERIFY_OK_MARKERS: [&str; 2] = ["Signature Verify Ok", "Debug mode ON!"];

const CERT_CMD: &str = "shell_cmd_SentCert";
const SIG_CMD: &str = "shell_cmd_SentSignature";
const CERT_CHUNK: usize = 60;
const SIG_CHUNK: usize = 50;

const NONCE_HEX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum UnlockError {
    #[error("private key file {0:?} is missing")]
    MissingKey(PathBuf),
    #[error("certificate file {0:?} is missing")]
    MissingCert(PathBuf),
    #[error("cannot read {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("cannot use private key {path:?}: {detail}")]
    BadKey { path: PathBuf, detail: String },
    #[error("mcu did not ack fragment {index}/{total}; response: {response:?}")]
    NoAck { index: usize, total: usize, response: String },
    #[error("no {}-hex challenge in mcu output: {output:?}", NONCE_HEX_LEN)]
    NoChallenge { output: String },
    #[error("mcu rejected the signature; response: {response:?}")]
    VerifyFailed { response: String },
    #[error("blind unlock needs an operator and none answered")]
    NoOperator,
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Human in the loop for the blind path. CI passes [`NoOperatorPresent`]
/// and the blind path fails cleanly instead of hanging on stdin.
pub trait Operator {
    /// Ask for the challenge as read off the serial terminal. `None` means
    /// the operator gave up.
    fn read_challenge(&mut self, attempt: u32, max: u32) -> Option<String>;
    /// Did the terminal show a verification success marker?
    fn confirm_verified(&mut self) -> Option<bool>;
}

pub struct NoOperatorPresent;

impl Operator for NoOperatorPresent {
    fn read_challenge(&mut self, _attempt: u32, _max: u32) -> Option<String> { None }
    fn confirm_verified(&mut self) -> Option<bool> { None }
}

/// Split `payload` into numbered wire fragments:
/// `<cmd> <total_len> <index> <is_last> <fragment_len> <payload-chunk>`.
/// Indices count from 1; the last-fragment flag is set exactly once.
pub fn fragments(cmd: &str, payload: &str, chunk: usize) -> Vec<String> {
    let total = payload.len();
    let count = (total + chunk - 1) / chunk;
    payload
        .as_bytes()
        .chunks(chunk)
        .enumerate()
        .map(|(i, piece)| {
            let piece = std::str::from_utf8(piece).expect("hex payload is ascii");
            let is_last = if i + 1 == count { 1 } else { 0 };
            format!("{} {} {} {} {} {}", cmd, total, i + 1, is_last, piece.len(), piece)
        })
        .collect()
}

/// Pull the 64-hex challenge out of shell output. Prefer a clean run after
/// the marker; fall back to stripping non-hex noise (the shell interleaves
/// log lines with the number). Result is uppercased.
pub fn extract_challenge(text: &str) -> Option<String> {
    if !text.contains(CHALLENGE_MARKER) {
        return None;
    }
    // everything after the last marker occurrence
    let suffix = text.rsplit(CHALLENGE_MARKER).next().unwrap_or("");

    let direct = Regex::new(&format!("[0-9A-Fa-f]{{{}}}", NONCE_HEX_LEN)).unwrap();
    if let Some(m) = direct.find(suffix) {
        return Some(m.as_str().to_uppercase());
    }

    let cleaned: String = suffix.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if cleaned.len() >= NONCE_HEX_LEN {
        return Some(cleaned[..NONCE_HEX_LEN].to_uppercase());
    }
    None
}

fn is_valid_challenge(s: &str) -> bool {
    s.len() == NONCE_HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Sign the challenge bytes with the PKCS#8 PEM key at `key_path`. ECDSA
/// P-256 over SHA-256 of the challenge, fixed-width (r||s) output.
pub fn sign_challenge(key_path: &Path, challenge_hex: &str) -> Result<Vec<u8>, UnlockError> {
    let pem_bytes =
        fs::read(key_path).map_err(|source| UnlockError::Io { path: key_path.to_owned(), source })?;
    let der = pem::parse(&pem_bytes)
        .map_err(|e| UnlockError::BadKey { path: key_path.to_owned(), detail: e.to_string() })?;
    let rng = SystemRandom::new();
    let keypair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &der.contents, &rng)
        .map_err(|e| UnlockError::BadKey { path: key_path.to_owned(), detail: e.to_string() })?;
    let message = hex::decode(challenge_hex)
        .map_err(|e| UnlockError::BadKey { path: key_path.to_owned(), detail: e.to_string() })?;
    let signature = keypair
        .sign(&rng, &message)
        .map_err(|e| UnlockError::BadKey { path: key_path.to_owned(), detail: e.to_string() })?;
    Ok(signature.as_ref().to_vec())
}

pub struct SecureDebugSession<'a> {
    link: &'a mut dyn Link,
    operator: &'a mut dyn Operator,
    key_path: PathBuf,
    cert_path: PathBuf,
    pacing: Pacing,
    blind_gap: Duration,
    responsive: Option<bool>,
}

impl<'a> SecureDebugSession<'a> {
    pub fn new(
        link: &'a mut dyn Link,
        operator: &'a mut dyn Operator,
        mcu_firmware_dir: &Path,
    ) -> SecureDebugSession<'a> {
        SecureDebugSession {
            link,
            operator,
            key_path: mcu_firmware_dir.join("pkcs8.key"),
            cert_path: mcu_firmware_dir.join("certificate.crt"),
            pacing: Pacing::mcu_shell(),
            blind_gap: Duration::from_millis(800),
            responsive: None,
        }
    }

    #[doc(hidden)]
    pub fn with_timing(mut self, pacing: Pacing, blind_gap: Duration) -> Self {
        self.pacing = pacing;
        self.blind_gap = blind_gap;
        self
    }

    /// Probe once whether the shell echoes anything, and remember the
    /// verdict for the rest of the session.
    fn detect_responsive(&mut self) -> Result<bool, UnlockError> {
        if let Some(cached) = self.responsive {
            return Ok(cached);
        }
        let mut responsive = false;
        for probe in &["help", ""] {
            let reply = console::command(self.link, probe, &self.pacing)?;
            if !reply.trim().is_empty() {
                responsive = true;
                break;
            }
        }
        log::info!("mcu shell is {}", if responsive { "responsive" } else { "non-responsive (card platform mode)" });
        self.responsive = Some(responsive);
        Ok(responsive)
    }

    fn shell(&mut self, cmd: &str) -> Result<String, UnlockError> {
        log::debug!("mcu <- {}", cmd);
        let reply = console::command(self.link, cmd, &self.pacing)?;
        log::debug!("mcu -> {:?}", reply);
        Ok(reply)
    }

    /// Run the whole unlock handshake. On success the MCU has debug mode on
    /// and will accept `mcu_goto_uart`.
    pub fn unlock(&mut self) -> Result<(), UnlockError> {
        if !self.key_path.exists() {
            return Err(UnlockError::MissingKey(self.key_path.clone()));
        }
        if !self.cert_path.exists() {
            return Err(UnlockError::MissingCert(self.cert_path.clone()));
        }
        let cert_hex = fs::read_to_string(&self.cert_path)
            .map_err(|source| UnlockError::Io { path: self.cert_path.clone(), source })?
            .trim()
            .to_uppercase();
        let cert_fragments = fragments(CERT_CMD, &cert_hex, CERT_CHUNK);

        self.shell("mcu_version_show")?;

        let challenge = if self.detect_responsive()? {
            self.push_cert_responsive(&cert_fragments)?
        } else {
            self.push_cert_blind(&cert_fragments)?
        };
        log::info!("challenge: {}", challenge);

        let signature = sign_challenge(&self.key_path, &challenge)?;
        let sig_hex = hex::encode(&signature);
        log::info!("signature: {}", sig_hex);
        let sig_fragments = fragments(SIG_CMD, &sig_hex, SIG_CHUNK);

        if self.responsive == Some(true) {
            self.push_signature_responsive(&sig_fragments)?;
            self.shell("mcu_version_show")?;
        } else {
            self.push_signature_blind(&sig_fragments)?;
        }
        log::info!("mcu debug unlock complete");
        Ok(())
    }

    fn push_cert_responsive(&mut self, frags: &[String]) -> Result<String, UnlockError> {
        let total = frags.len();
        for (i, frag) in frags[..total - 1].iter().enumerate() {
            let reply = self.shell(frag)?;
            if !reply.contains(ACK_MARKER) {
                return Err(UnlockError::NoAck { index: i + 1, total, response: reply });
            }
        }

        let final_reply = self.shell(&frags[total - 1])?;
        if let Some(challenge) = extract_challenge(&final_reply) {
            return Ok(challenge);
        }
        // some firmware revisions only print the number after another poke
        let retrigger = self.shell("")?;
        extract_challenge(&retrigger)
            .ok_or(UnlockError::NoChallenge { output: format!("{}{}", final_reply, retrigger) })
    }

    fn push_cert_blind(&mut self, frags: &[String]) -> Result<String, UnlockError> {
        log::info!("pushing {} certificate fragments blind", frags.len());
        for frag in frags {
            console::command_blind(self.link, frag, &self.pacing)?;
            thread::sleep(self.blind_gap);
        }
        const ATTEMPTS: u32 = 3;
        for attempt in 1..=ATTEMPTS {
            match self.operator.read_challenge(attempt, ATTEMPTS) {
                Some(input) => {
                    let input = input.trim().to_string();
                    if is_valid_challenge(&input) {
                        return Ok(input.to_uppercase());
                    }
                    log::warn!("challenge must be {} hex characters", NONCE_HEX_LEN);
                }
                None => break,
            }
        }
        Err(UnlockError::NoOperator)
    }

    fn push_signature_responsive(&mut self, frags: &[String]) -> Result<(), UnlockError> {
        let total = frags.len();
        for frag in &frags[..total - 1] {
            self.shell(frag)?;
        }
        let reply = self.shell(&frags[total - 1])?;
        if VERIFY_OK_MARKERS.iter().any(|m| reply.contains(m)) {
            Ok(())
        } else {
            Err(UnlockError::VerifyFailed { response: reply })
        }
    }

    fn push_signature_blind(&mut self, frags: &[String]) -> Result<(), UnlockError> {
        for (i, frag) in frags.iter().enumerate() {
            log::info!("blind signature fragment {}/{}", i + 1, frags.len());
            console::command_blind(self.link, frag, &self.pacing)?;
            // the firmware chews on signature pieces longer than cert pieces
            thread::sleep(self.blind_gap + Duration::from_millis(200));
        }
        match self.operator.confirm_verified() {
            Some(true) => Ok(()),
            Some(false) => {
                Err(UnlockError::VerifyFailed { response: "operator reported no success marker".into() })
            }
            None => Err(UnlockError::NoOperator),
        }
    }
}
