//! Terminal progress rendering. The transfer and download cores only see
//! observer traits; everything indicatif lives here.

use indicatif::{ProgressBar, ProgressStyle};

/// Block-granular bar for XMODEM transfers.
pub struct TransferBar {
    bar: Option<ProgressBar>,
}

impl TransferBar {
    pub fn new() -> Self { TransferBar { bar: None } }
}

impl serial_link::Progress for TransferBar {
    fn start(&mut self, total_units: u64) {
        let bar = ProgressBar::new(total_units);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg:<24} [{bar:40.yellow/green}] {percent:>3}% {elapsed} eta {eta}")
                .progress_chars("=>-"),
        );
        bar.set_message("loading");
        self.bar = Some(bar);
    }

    fn advance(&mut self, units: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(units);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

/// Byte-granular bar for package downloads; falls back to a spinner when
/// the server sends no length.
pub struct DownloadBar {
    bar: Option<ProgressBar>,
}

impl DownloadBar {
    pub fn new() -> Self { DownloadBar { bar: None } }
}

impl ota_fetch::DownloadObserver for DownloadBar {
    fn begin(&mut self, total_bytes: Option<u64>) {
        let bar = match total_bytes {
            Some(total) => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{msg:<24} [{bar:40.cyan/blue}] {bytes}/{total_bytes} eta {eta}")
                        .progress_chars("=>-"),
                );
                bar
            }
            None => ProgressBar::new_spinner(),
        };
        bar.set_message("downloading");
        self.bar = Some(bar);
    }

    fn chunk(&mut self, bytes: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(bytes);
        }
    }

    fn end(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}
