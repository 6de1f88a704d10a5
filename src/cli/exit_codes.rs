//! CLI Exit Codes
//!
//! Standard exit codes for test runs and automation.

use crate::config::ConfigError;
use crate::core::discovery::DiscoveryError;
use crate::core::model::RunSummary;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Every test passed or was skipped
    pub const SUCCESS: u8 = 0;

    /// At least one test failed
    pub const TESTS_FAILED: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Some tests were never reported by the target
    pub const TESTS_PENDING: u8 = 3;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Success without message
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Map a finished run to an exit status
    pub fn from_summary(summary: &RunSummary, cancelled: bool) -> Self {
        if cancelled {
            Self::Error(ExitCodes::CANCELLED, format!("Run cancelled: {summary}"))
        } else if summary.failed > 0 {
            Self::Error(ExitCodes::TESTS_FAILED, summary.to_string())
        } else if summary.pending > 0 {
            Self::Error(ExitCodes::TESTS_PENDING, summary.to_string())
        } else {
            Self::Success(Some(summary.to_string()))
        }
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to `ExitCode`
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ExitCodes::FILE_NOT_FOUND
            }
            _ => ExitCodes::CONFIG_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<DiscoveryError> for CliResult {
    fn from(err: DiscoveryError) -> Self {
        let code = match &err {
            DiscoveryError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ExitCodes::FILE_NOT_FOUND
            }
            DiscoveryError::Io { .. } => ExitCodes::INTERNAL_ERROR,
            DiscoveryError::Parse { .. } => ExitCodes::INVALID_ARGS,
        };
        Self::Error(code, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "All tests passed or skipped",
        1 => "One or more tests failed",
        2 => "Invalid arguments",
        3 => "One or more tests were not reported",
        6 => "File not found",
        8 => "Configuration error",
        11 => "Run cancelled",
        12 => "Device not found",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 6, 8, 11, 12, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
