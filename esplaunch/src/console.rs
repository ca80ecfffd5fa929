//! Console log and session observer.
//!
//! The controller never prints. It reports leveled messages, progress and
//! state changes to a [`SessionObserver`]; front ends render them.

use crate::progress::SessionProgress;
use crate::session::ConnectionState;
use std::fmt;

/// Severity of a console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsoleLevel {
    /// Neutral information.
    Info,
    /// An operation finished successfully.
    Success,
    /// Something went wrong but the operation carried on.
    Warning,
    /// An operation failed.
    Error,
}

impl ConsoleLevel {
    /// Lowercase name of the level.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded console message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    /// Severity.
    pub level: ConsoleLevel,
    /// Message text.
    pub text: String,
}

/// Receives controller events.
///
/// Every method has an empty default so observers implement only what they
/// render.
pub trait SessionObserver {
    /// A console message.
    fn on_message(&mut self, level: ConsoleLevel, text: &str) {
        let _ = (level, text);
    }

    /// Flashing or download progress.
    fn on_progress(&mut self, progress: &SessionProgress) {
        let _ = progress;
    }

    /// Quick-start image bytes received so far, against the declared size.
    fn on_download(&mut self, received: u64, total: Option<u64>) {
        let _ = (received, total);
    }

    /// The connection state changed.
    fn on_state(&mut self, state: ConnectionState) {
        let _ = state;
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}

/// In-memory console, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct ConsoleLog {
    lines: Vec<ConsoleLine>,
    progress: Option<SessionProgress>,
    states: Vec<ConnectionState>,
}

impl ConsoleLog {
    /// Create an empty console.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line.
    pub fn push(&mut self, level: ConsoleLevel, text: impl Into<String>) {
        self.lines.push(ConsoleLine {
            level,
            text: text.into(),
        });
    }

    /// Recorded lines.
    pub fn lines(&self) -> &[ConsoleLine] {
        &self.lines
    }

    /// Lines at a given level.
    pub fn lines_at(&self, level: ConsoleLevel) -> impl Iterator<Item = &ConsoleLine> {
        self.lines.iter().filter(move |l| l.level == level)
    }

    /// Whether any line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.text.contains(needle))
    }

    /// Last progress snapshot seen.
    pub fn last_progress(&self) -> Option<&SessionProgress> {
        self.progress.as_ref()
    }

    /// State transitions seen, in order.
    pub fn states(&self) -> &[ConnectionState] {
        &self.states
    }

    /// Drop every line and leave a single note that the console was cleared.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.push(ConsoleLevel::Info, "Console cleared");
    }
}

impl SessionObserver for ConsoleLog {
    fn on_message(&mut self, level: ConsoleLevel, text: &str) {
        self.push(level, text);
    }

    fn on_progress(&mut self, progress: &SessionProgress) {
        self.progress = Some(progress.clone());
    }

    fn on_state(&mut self, state: ConnectionState) {
        self.states.push(state);
    }
}
