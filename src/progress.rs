//! Per-device progress output.
//!
//! Each worker owns one spinner from a shared `MultiProgress`. Progress lines
//! are printed above the spinners when they are drawn, and straight to
//! stdout otherwise.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter for one device.
pub struct DeviceProgress {
    device: usize,
    bar: ProgressBar,
}

impl DeviceProgress {
    /// Adds a spinner for `device` to `multi`.
    pub fn new(multi: &MultiProgress, device: usize) -> Self {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {prefix} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix(format!("[GPU {}]", device));
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { device, bar }
    }

    /// Reporter that draws nothing and prints lines to stdout.
    pub fn hidden(device: usize) -> Self {
        Self {
            device,
            bar: ProgressBar::hidden(),
        }
    }

    fn tagged(&self, msg: &str) -> String {
        format!("[GPU {}] {}", self.device, msg)
    }

    /// Prints a progress line tagged with the device index.
    pub fn line(&self, msg: impl AsRef<str>) {
        let line = self.tagged(msg.as_ref());
        if self.bar.is_hidden() {
            println!("{}", line);
        } else {
            self.bar.println(line);
        }
    }

    /// Updates the spinner's status message.
    pub fn status(&self, msg: impl Into<String>) {
        self.bar.set_message(msg.into());
    }

    /// Stops the spinner, leaving `msg` in place.
    pub fn finish(&self, msg: impl Into<String>) {
        self.bar.finish_with_message(msg.into());
    }
}
