//! Serial plumbing for board bring-up: one [`Link`] per console (SoC, MCU,
//! HSM), the command/read-back discipline the MCU shell expects, prompt
//! waiters for the boot flow, and an XMODEM-1K sender.
//!
//! The caller owns endpoint discipline: at most one logical operation is in
//! flight per link at any time.

use std::path::PathBuf;

use thiserror::Error;

pub mod console;
pub mod link;
pub mod xmodem;

#[cfg(any(test, feature = "fakes"))]
pub mod fakes;

pub use link::{Link, SerialEndpoint};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot open serial port {path:?}: {source}")]
    Open { path: PathBuf, source: serialport::Error },
    #[error("serial i/o on {port}: {source}")]
    Io { port: String, source: std::io::Error },
    #[error("xmodem receiver cancelled the transfer on {port}")]
    Cancelled { port: String },
    #[error("xmodem retries exhausted on {port} at block {block}")]
    RetriesExhausted { port: String, block: usize },
}

/// Progress sink for long transfers. The core never renders; the CLI decides
/// what a block tick looks like.
pub trait Progress {
    fn start(&mut self, total_units: u64);
    fn advance(&mut self, units: u64);
    fn finish(&mut self);
}

/// Progress sink that discards everything.
pub struct NullProgress;

impl Progress for NullProgress {
    fn start(&mut self, _total_units: u64) {}
    fn advance(&mut self, _units: u64) {}
    fn finish(&mut self) {}
}
