//! Configuration module
//!
//! Handles run settings and their on-disk location

mod settings;

pub use settings::{ConfigError, DeviceSettings, EmulatorSettings, LoggingSettings, RunSettings};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "nanotest", "nanotest")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "nanotest", "nanotest")
        .map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// Default settings file location
pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("settings.toml"))
}
