//! Terminal rendering of session events.
//!
//! Human output goes to stderr so stdout stays clean for `--json`.

use console::style;
use esplaunch::{ConnectionState, ConsoleLevel, SessionObserver, SessionProgress};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::use_fancy_output;

/// Prefix symbol for a console level.
pub(crate) fn level_symbol(level: ConsoleLevel) -> console::StyledObject<&'static str> {
    match level {
        ConsoleLevel::Info => style("ℹ").blue(),
        ConsoleLevel::Success => style("✓").green(),
        ConsoleLevel::Warning => style("⚠").yellow(),
        ConsoleLevel::Error => style("✗").red(),
    }
}

fn percent_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}

fn bytes_bar(total: Option<u64>) -> ProgressBar {
    match total {
        Some(total) => {
            let pb = ProgressBar::new(total);
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb
        },
        None => {
            let pb = ProgressBar::new_spinner();
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {bytes} {msg}")
                    .unwrap(),
            );
            pb
        },
    }
}

/// Renders controller messages and progress on the terminal.
pub(crate) struct TerminalObserver {
    quiet: bool,
    fancy: bool,
    bar: Option<ProgressBar>,
    download: Option<ProgressBar>,
}

impl TerminalObserver {
    pub(crate) fn new(quiet: bool) -> Self {
        Self {
            quiet,
            fancy: !quiet && use_fancy_output(),
            bar: None,
            download: None,
        }
    }

    fn print(&self, level: ConsoleLevel, text: &str) {
        let line = format!("{} {text}", level_symbol(level));
        match self.bar.as_ref().or(self.download.as_ref()) {
            Some(pb) => pb.suspend(|| eprintln!("{line}")),
            None => eprintln!("{line}"),
        }
    }

    /// Clear any bar still on screen.
    pub(crate) fn finish(&mut self) {
        if let Some(pb) = self.download.take() {
            pb.finish_and_clear();
        }
        if let Some(pb) = self.bar.take() {
            pb.finish_and_clear();
        }
    }
}

impl SessionObserver for TerminalObserver {
    fn on_message(&mut self, level: ConsoleLevel, text: &str) {
        let essential = matches!(level, ConsoleLevel::Warning | ConsoleLevel::Error);
        if !self.quiet || essential {
            self.print(level, text);
        }
    }

    fn on_progress(&mut self, progress: &SessionProgress) {
        if !self.fancy {
            return;
        }
        if let Some(pb) = self.download.take() {
            pb.finish_and_clear();
        }
        let pb = self.bar.get_or_insert_with(percent_bar);
        pb.set_position(progress.rounded());
        pb.set_message(progress.label.clone());
        if progress.rounded() >= 100 {
            pb.finish_and_clear();
            self.bar = None;
        }
    }

    fn on_download(&mut self, received: u64, total: Option<u64>) {
        if !self.fancy {
            return;
        }
        let pb = self.download.get_or_insert_with(|| bytes_bar(total));
        pb.set_position(received);
    }

    fn on_state(&mut self, state: ConnectionState) {
        debug!("Connection state: {state}");
        if matches!(state, ConnectionState::Disconnected | ConnectionState::Connected) {
            if let Some(pb) = self.bar.take() {
                pb.finish_and_clear();
            }
        }
    }
}

impl Drop for TerminalObserver {
    fn drop(&mut self) {
        self.finish();
    }
}
