//! Host-facing run diagnostics
//!
//! The host sees four severities. Every entry is also emitted as a
//! `tracing` event so the binary's subscriber picks it up.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Shared handle to a host logger
pub type Logger = Arc<dyn HostLogger>;

/// Diagnostic severity as understood by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    /// Step-by-step tracing
    Verbose,
    /// Detailed progress
    Detailed,
    /// A failure the run recovered from or reported
    Error,
    /// An unexpected fault that aborted the run
    Panic,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verbose => write!(f, "verbose"),
            Self::Detailed => write!(f, "detailed"),
            Self::Error => write!(f, "error"),
            Self::Panic => write!(f, "panic"),
        }
    }
}

/// Receiver of run diagnostics
pub trait HostLogger: Send + Sync {
    /// Record a message
    fn log(&self, severity: Severity, message: &str);

    /// Record a [`Severity::Verbose`] message
    fn verbose(&self, message: &str) {
        self.log(Severity::Verbose, message);
    }

    /// Record a [`Severity::Detailed`] message
    fn detailed(&self, message: &str) {
        self.log(Severity::Detailed, message);
    }

    /// Record a [`Severity::Error`] message
    fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }

    /// Record a [`Severity::Panic`] message
    fn panic(&self, message: &str) {
        self.log(Severity::Panic, message);
    }
}

fn emit(severity: Severity, message: &str) {
    match severity {
        Severity::Verbose => tracing::trace!(target: "nanotest::host", "{message}"),
        Severity::Detailed => tracing::debug!(target: "nanotest::host", "{message}"),
        Severity::Error => tracing::error!(target: "nanotest::host", "{message}"),
        Severity::Panic => tracing::error!(target: "nanotest::host", panic = true, "{message}"),
    }
}

/// Logger that only forwards to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl HostLogger for TracingLogger {
    fn log(&self, severity: Severity, message: &str) {
        emit(severity, message);
    }
}

/// A recorded diagnostic
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// When the entry was recorded
    pub timestamp: DateTime<Local>,
    /// Severity
    pub severity: Severity,
    /// Text
    pub message: String,
}

/// Logger that keeps entries in memory and forwards them to `tracing`
#[derive(Debug, Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogger {
    /// Create an empty logger
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Entries at or above `severity`
    pub fn at_least(&self, severity: Severity) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.severity >= severity)
            .cloned()
            .collect()
    }

    /// Whether any entry at `severity` contains `needle`
    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.severity == severity && e.message.contains(needle))
    }
}

impl HostLogger for MemoryLogger {
    fn log(&self, severity: Severity, message: &str) {
        emit(severity, message);
        self.entries.lock().push(LogEntry {
            timestamp: Local::now(),
            severity,
            message: message.to_string(),
        });
    }
}
