//! Device discovery and debug-session preparation
//!
//! The debug protocol itself lives behind [`DeviceSession`]; this module
//! only drives it: find the target, connect, erase the deployment area and
//! make sure the runtime has finished initializing before anything is
//! deployed.

use super::image::DeploymentBlob;
use super::logger::HostLogger;
use crate::utils::retry::{pause, retry, Backoff, RetryError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Device error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Device rejected or failed a command
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Transfer of the deployment blob failed
    #[error("Deployment failed: {0}")]
    DeploymentFailed(String),

    /// Device went away
    #[error("Disconnected")]
    Disconnected,
}

/// Flags passed when opening a debug session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Take over a session another tool may hold
    pub force: bool,
    /// Query device capabilities after connecting
    pub request_capabilities: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            force: true,
            request_capabilities: true,
        }
    }
}

/// Flash region to erase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseRegion {
    /// Managed-code deployment area
    Deployment,
    /// User storage
    UserStorage,
}

/// Reboot flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootOptions {
    /// Restart only the managed runtime
    ClrOnly,
    /// Full device reboot
    Normal,
}

/// Which firmware stage the device is executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Minimal bootloader
    Bootloader,
    /// Main runtime
    Clr,
    /// Not determined
    Unknown,
}

/// A runtime component resident on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeAssembly {
    /// Name
    pub name: String,
    /// Version
    pub version: String,
}

/// Receives deployment progress messages
pub trait ProgressSink: Send + Sync {
    /// Report progress
    fn report(&self, message: &str);
}

/// Progress sink that writes debug events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, message: &str) {
        debug!(target: "nanotest::deploy", "{message}");
    }
}

/// An open debug connection to one device
///
/// Implementations may be shared with other host-side consumers; callers
/// hold an `Arc` and never assume exclusive ownership.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Port or connection id, e.g. `COM3` or `/dev/ttyACM0`
    fn port(&self) -> &str;

    /// Open the debug session
    async fn connect(&self, timeout: Duration, options: ConnectOptions) -> Result<(), DeviceError>;

    /// Erase a flash region
    async fn erase(&self, region: EraseRegion) -> Result<(), DeviceError>;

    /// Whether the runtime is still in its initialize state
    async fn is_initializing(&self) -> Result<bool, DeviceError>;

    /// Ask a paused runtime to continue
    async fn resume_execution(&self) -> Result<(), DeviceError>;

    /// Firmware stage currently running
    async fn runtime_mode(&self) -> Result<RuntimeMode, DeviceError>;

    /// Address the bootloader jumps to for starting the runtime
    async fn runtime_start_address(&self) -> Result<u32, DeviceError>;

    /// Start execution at `address`
    async fn execute_memory(&self, address: u32) -> Result<(), DeviceError>;

    /// Reboot the device or its runtime
    async fn reboot(&self, options: RebootOptions) -> Result<(), DeviceError>;

    /// Runtime components already on the device
    async fn native_assemblies(&self) -> Result<Vec<NativeAssembly>, DeviceError>;

    /// Transfer a blob
    async fn deploy(
        &self,
        blob: &DeploymentBlob,
        erase: bool,
        reboot: bool,
        progress: &dyn ProgressSink,
    ) -> Result<(), DeviceError>;

    /// Text messages printed by the device
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// Source of connected devices
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Resolve once the running enumeration has finished
    async fn wait_enumeration_complete(&self);

    /// Start a fresh scan and wait for it
    async fn rescan(&self);

    /// Devices found by the last scan, in enumeration order
    fn devices(&self) -> Vec<Arc<dyn DeviceSession>>;
}

/// Retry budgets and delays for preparing a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt of each step
    pub number_of_retries: u32,
    /// Upper bound for one enumeration
    pub enumeration_timeout: Duration,
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
    /// Pause between connect attempts
    pub connect_retry_delay: Duration,
    /// Pause between erase attempts
    pub erase_retry_delay: Duration,
    /// Base of the initialization backoff
    pub init_base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            number_of_retries: 5,
            enumeration_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            connect_retry_delay: Duration::from_millis(100),
            erase_retry_delay: Duration::from_millis(400),
            init_base_delay: Duration::from_millis(500),
        }
    }
}

/// Result of preparing a device
pub enum SessionOutcome {
    /// Connected, erased and initialized
    Ready(Arc<dyn DeviceSession>),
    /// A step ran out of retries; carries the message for the host
    Failed(String),
    /// Several devices present and none on the configured port
    PortNotFound(String),
    /// Device never left its initialize state
    NotInitialized(String),
    /// The run was cancelled
    Cancelled,
}

impl std::fmt::Debug for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(session) => write!(f, "Ready({})", session.port()),
            Self::Failed(msg) => write!(f, "Failed({msg})"),
            Self::PortNotFound(port) => write!(f, "PortNotFound({port})"),
            Self::NotInitialized(port) => write!(f, "NotInitialized({port})"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Message used when no device shows up
pub const NO_DEVICE_MESSAGE: &str = "Couldn't find any device. Disable background device \
     scanning in other tools and, if the situation persists, reboot the device.";

/// Prepares a device session for deployment
pub struct DeviceSessionManager<'a> {
    discovery: &'a dyn DeviceDiscovery,
    policy: RetryPolicy,
    logger: &'a dyn HostLogger,
    cancel: CancellationToken,
}

impl<'a> DeviceSessionManager<'a> {
    /// Create a manager
    pub fn new(
        discovery: &'a dyn DeviceDiscovery,
        policy: RetryPolicy,
        logger: &'a dyn HostLogger,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            discovery,
            policy,
            logger,
            cancel,
        }
    }

    /// Find, connect, erase and initialize the target device
    pub async fn prepare(&self, port: Option<&str>) -> SessionOutcome {
        let devices = match self.find_devices().await {
            Ok(devices) => devices,
            Err(outcome) => return outcome,
        };

        let Some(session) = select_device(&devices, port) else {
            let port = port.unwrap_or_default().to_string();
            self.logger
                .error(&format!("No device found on the configured port {port}"));
            return SessionOutcome::PortNotFound(port);
        };
        info!(port = session.port(), "target device selected");
        self.logger
            .detailed(&format!("Running tests on device at {}", session.port()));

        if let Err(outcome) = self.connect(&session).await {
            return outcome;
        }
        if let Err(outcome) = self.erase(&session).await {
            return outcome;
        }
        match self.initialize(&session).await {
            Ok(true) => {}
            Ok(false) => return SessionOutcome::NotInitialized(session.port().to_string()),
            Err(outcome) => return outcome,
        }
        if let Err(outcome) = self.check_native_assemblies(&session).await {
            return outcome;
        }

        SessionOutcome::Ready(session)
    }

    async fn find_devices(&self) -> Result<Vec<Arc<dyn DeviceSession>>, SessionOutcome> {
        self.wait_enumeration(false).await?;

        let mut devices = self.discovery.devices();
        let mut retries = 0;
        while devices.is_empty() {
            if retries >= self.policy.number_of_retries {
                self.logger.error(NO_DEVICE_MESSAGE);
                return Err(SessionOutcome::Failed(NO_DEVICE_MESSAGE.to_string()));
            }
            retries += 1;
            self.logger
                .verbose(&format!("No device found, rescanning (attempt {retries})"));
            self.wait_enumeration(true).await?;
            devices = self.discovery.devices();
        }

        self.logger
            .verbose(&format!("Found {} device(s)", devices.len()));
        Ok(devices)
    }

    async fn wait_enumeration(&self, rescan: bool) -> Result<(), SessionOutcome> {
        let wait = async {
            if rescan {
                self.discovery.rescan().await;
            } else {
                self.discovery.wait_enumeration_complete().await;
            }
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SessionOutcome::Cancelled),
            waited = tokio::time::timeout(self.policy.enumeration_timeout, wait) => {
                if waited.is_err() {
                    warn!(timeout = ?self.policy.enumeration_timeout, "device enumeration did not complete");
                }
                Ok(())
            }
        }
    }

    async fn connect(&self, session: &Arc<dyn DeviceSession>) -> Result<(), SessionOutcome> {
        let timeout = self.policy.connect_timeout;
        let result = retry(
            "connect",
            self.policy.number_of_retries,
            Backoff::Fixed(self.policy.connect_retry_delay),
            &self.cancel,
            |_| async move {
                tokio::time::timeout(timeout, session.connect(timeout, ConnectOptions::default()))
                    .await
                    .map_err(|_| DeviceError::Timeout(timeout))?
            },
        )
        .await;

        self.step_result(result, || {
            format!(
                "Couldn't connect to the device at {}. Disable background device scanning \
                 in other tools and, if the situation persists, reboot the device.",
                session.port()
            )
        })?;
        self.logger.verbose(&format!("Connected to {}", session.port()));
        Ok(())
    }

    async fn erase(&self, session: &Arc<dyn DeviceSession>) -> Result<(), SessionOutcome> {
        let result = retry(
            "erase",
            self.policy.number_of_retries,
            Backoff::Fixed(self.policy.erase_retry_delay),
            &self.cancel,
            |_| session.erase(EraseRegion::Deployment),
        )
        .await;

        self.step_result(result, || {
            format!(
                "Couldn't erase the deployment area of the device at {}. \
                 If the situation persists, reboot the device.",
                session.port()
            )
        })?;
        self.logger.verbose("Deployment area erased");
        Ok(())
    }

    /// `Ok(false)` when the device is still initializing after every retry
    async fn initialize(&self, session: &Arc<dyn DeviceSession>) -> Result<bool, SessionOutcome> {
        if !self.query_initializing(session).await {
            return Ok(true);
        }

        self.logger.verbose("Device is initializing, resuming execution");
        if let Err(e) = session.resume_execution().await {
            warn!(error = %e, "resume execution failed");
        }

        for attempt in 0..self.policy.number_of_retries {
            if !self.query_initializing(session).await {
                return Ok(true);
            }

            match session.runtime_mode().await {
                Ok(RuntimeMode::Bootloader) => {
                    self.logger.verbose("Device running the bootloader, launching runtime");
                    let launched = match session.runtime_start_address().await {
                        Ok(address) => session.execute_memory(address).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = launched {
                        warn!(error = %e, "failed to launch runtime");
                    }
                }
                Ok(RuntimeMode::Clr) => {
                    self.logger.verbose("Device running the runtime, rebooting it");
                    if let Err(e) = session.reboot(RebootOptions::ClrOnly).await {
                        warn!(error = %e, "runtime reboot failed");
                    }
                }
                Ok(RuntimeMode::Unknown) => {}
                Err(e) => warn!(error = %e, "could not read runtime mode"),
            }

            if !pause(Backoff::Linear(self.policy.init_base_delay).delay(attempt), &self.cancel).await {
                return Err(SessionOutcome::Cancelled);
            }
        }

        if self.query_initializing(session).await {
            self.logger.error(&format!(
                "Device at {} failed to leave the initialize state",
                session.port()
            ));
            Ok(false)
        } else {
            Ok(true)
        }
    }

    async fn query_initializing(&self, session: &Arc<dyn DeviceSession>) -> bool {
        match session.is_initializing().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "could not read initialize state");
                true
            }
        }
    }

    async fn check_native_assemblies(
        &self,
        session: &Arc<dyn DeviceSession>,
    ) -> Result<(), SessionOutcome> {
        let assemblies = session.native_assemblies().await.unwrap_or_else(|e| {
            warn!(error = %e, "could not list native assemblies");
            Vec::new()
        });
        if assemblies.is_empty() {
            let message = format!(
                "Couldn't find any native assemblies deployed in the device at {}. \
                 If the situation persists, reboot the device.",
                session.port()
            );
            self.logger.error(&message);
            return Err(SessionOutcome::Failed(message));
        }
        self.logger.verbose(&format!(
            "{} native assemblies resident on the device",
            assemblies.len()
        ));
        Ok(())
    }

    fn step_result<T>(
        &self,
        result: Result<T, RetryError<DeviceError>>,
        message: impl FnOnce() -> String,
    ) -> Result<T, SessionOutcome> {
        match result {
            Ok(value) => Ok(value),
            Err(RetryError::Cancelled) => Err(SessionOutcome::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => {
                let message = message();
                self.logger
                    .error(&format!("{message} ({attempts} attempts, last error: {last})"));
                Err(SessionOutcome::Failed(message))
            }
        }
    }
}

/// Pick the target among enumerated devices
///
/// With several devices and a configured port, only an exact port match is
/// accepted. Otherwise the first device wins.
pub fn select_device(
    devices: &[Arc<dyn DeviceSession>],
    port: Option<&str>,
) -> Option<Arc<dyn DeviceSession>> {
    match port {
        Some(port) if devices.len() > 1 => devices.iter().find(|d| d.port() == port).cloned(),
        _ => devices.first().cloned(),
    }
}
