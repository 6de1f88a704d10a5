//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Result reports in text or JSON

pub mod exit_codes;
pub mod report;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
pub use report::{OutputFormat, Reporter};
