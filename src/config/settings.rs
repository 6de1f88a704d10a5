//! Run settings

use crate::core::device::RetryPolicy;
use crate::core::emulator::EmulatorConfig;
use crate::core::orchestrator::{RunOptions, Target};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Settings file could not be read
    #[error("Failed to read settings {path}: {source}")]
    Io {
        /// Settings path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Settings file could not be parsed
    #[error("Invalid settings {path}: {source}")]
    Parse {
        /// Settings path
        path: PathBuf,
        /// Parser error
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range
    #[error("Invalid setting {key}: {message}")]
    Invalid {
        /// Setting name
        key: &'static str,
        /// What is wrong
        message: String,
    },
}

/// Settings for one test run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Run on a physical device instead of the emulator
    pub is_real_hardware: bool,
    /// Port to select when several devices are connected
    pub real_hardware_port: Option<String>,
    /// Upper bound for one test execution, in milliseconds
    pub session_timeout_ms: u64,
    /// Logging
    pub logging: LoggingSettings,
    /// Emulator invocation
    pub emulator: EmulatorSettings,
    /// Device preparation
    pub device: DeviceSettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            is_real_hardware: false,
            real_hardware_port: None,
            session_timeout_ms: 300_000,
            logging: LoggingSettings::default(),
            emulator: EmulatorSettings::default(),
            device: DeviceSettings::default(),
        }
    }
}

impl RunSettings {
    /// Load settings from `path`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        match super::settings_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "session_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.device.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "device.connect_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.emulator.executable.trim().is_empty() && self.emulator.path.is_none() {
            return Err(ConfigError::Invalid {
                key: "emulator.executable",
                message: "must name an executable when no path is set".to_string(),
            });
        }
        Ok(())
    }

    /// Session timeout as a duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Options for the orchestrator
    pub fn run_options(&self) -> RunOptions {
        let target = if self.is_real_hardware {
            Target::Hardware {
                port: self
                    .real_hardware_port
                    .clone()
                    .filter(|p| !p.trim().is_empty()),
            }
        } else {
            Target::Emulator
        };
        RunOptions {
            target,
            session_timeout: self.session_timeout(),
            emulator: self.emulator.config(self.session_timeout()),
            retry: self.device.policy(),
            fail_on_port_mismatch: self.device.fail_on_port_mismatch,
            fail_on_stuck_initialize: self.device.fail_on_stuck_initialize,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive, e.g. `info` or `nanotest_core=debug`
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
    /// Also write a daily log file into this directory
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

/// Emulator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorSettings {
    /// Explicit executable path
    pub path: Option<PathBuf>,
    /// Executable name searched on `PATH`
    pub executable: String,
    /// Arguments placed before the image list
    pub extra_args: Vec<String>,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        let defaults = EmulatorConfig::default();
        Self {
            path: defaults.path,
            executable: defaults.executable,
            extra_args: defaults.extra_args,
        }
    }
}

impl EmulatorSettings {
    /// Emulator configuration bounded by `session_timeout`
    pub fn config(&self, session_timeout: Duration) -> EmulatorConfig {
        EmulatorConfig {
            path: self.path.clone(),
            executable: self.executable.clone(),
            extra_args: self.extra_args.clone(),
            session_timeout,
        }
    }
}

/// Device preparation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Retries after the first attempt of each step
    pub number_of_retries: u32,
    /// Upper bound for one device enumeration
    pub enumeration_timeout_ms: u64,
    /// Per-attempt connect timeout
    pub connect_timeout_ms: u64,
    /// Pause between connect attempts
    pub connect_retry_delay_ms: u64,
    /// Pause between erase attempts
    pub erase_retry_delay_ms: u64,
    /// Base of the initialization backoff
    pub init_base_delay_ms: u64,
    /// Fail the run when the configured port matches no device
    pub fail_on_port_mismatch: bool,
    /// Fail the run when the device never leaves its initialize state
    pub fail_on_stuck_initialize: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            number_of_retries: policy.number_of_retries,
            enumeration_timeout_ms: millis(policy.enumeration_timeout),
            connect_timeout_ms: millis(policy.connect_timeout),
            connect_retry_delay_ms: millis(policy.connect_retry_delay),
            erase_retry_delay_ms: millis(policy.erase_retry_delay),
            init_base_delay_ms: millis(policy.init_base_delay),
            fail_on_port_mismatch: true,
            fail_on_stuck_initialize: true,
        }
    }
}

impl DeviceSettings {
    /// Retry policy for the session manager
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            number_of_retries: self.number_of_retries,
            enumeration_timeout: Duration::from_millis(self.enumeration_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            connect_retry_delay: Duration::from_millis(self.connect_retry_delay_ms),
            erase_retry_delay: Duration::from_millis(self.erase_retry_delay_ms),
            init_base_delay: Duration::from_millis(self.init_base_delay_ms),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
