//! # nanotest Core Library
//!
//! Runs compiled test images on an embedded target and reports per-test
//! results. Supported targets:
//! - A local emulator process
//! - A physical device reached through a debug session
//!
//! ## Features
//!
//! - Device discovery with retry and port selection
//! - Connect / erase / initialize with bounded retries and backoff
//! - Deployment with a single retry from a pristine copy of the images
//! - Emulator supervision with session timeout and guaranteed kill
//! - Output parsing with setup skip propagation
//! - Cancellation of in-flight runs
//! - CLI with exit codes and text/JSON reports
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nanotest_core::{Orchestrator, RunSettings, TestCase, TracingLogger};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = RunSettings::load()?;
//!     let orchestrator = Orchestrator::new(settings.run_options(), Arc::new(TracingLogger));
//!
//!     let tests = vec![TestCase::new("Tests.Math.Add", "Add", "bin/Tests.pe")];
//!     for result in orchestrator.run(&tests).await {
//!         println!("{}: {}", result.test_case.display_name, result.outcome);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::RunSettings;
pub use crate::core::device::{DeviceDiscovery, DeviceSession, RetryPolicy};
pub use crate::core::image::{DeploymentBlob, DeploymentImage, MetadataReader};
pub use crate::core::logger::{HostLogger, Logger, MemoryLogger, Severity, TracingLogger};
pub use crate::core::model::{RunSummary, TestCase, TestOutcome, TestResult, TestTrait};
pub use crate::core::orchestrator::{Orchestrator, RunOptions, Target};
pub use crate::core::sink::{publish, ResultSink};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
