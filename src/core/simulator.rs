//! Virtual device simulator
//!
//! Scriptable stand-ins for [`DeviceSession`] and [`DeviceDiscovery`].
//! A script decides how many times each step fails, how long the device
//! stays in its initialize state, and what text it prints once the runtime
//! restarts after a deployment. Useful for dry runs and for testing the
//! hardware path without a board attached.

use super::device::{
    ConnectOptions, DeviceDiscovery, DeviceError, DeviceSession, EraseRegion, NativeAssembly,
    ProgressSink, RebootOptions, RuntimeMode,
};
use super::image::DeploymentBlob;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Behaviour of a simulated device
#[derive(Debug, Clone)]
pub struct DeviceScript {
    /// Connect attempts that fail before one succeeds
    pub connect_failures: u32,
    /// Connect attempts that hang forever before one succeeds
    pub connect_hangs: u32,
    /// Erase attempts that fail before one succeeds
    pub erase_failures: u32,
    /// Deploy attempts that fail before one succeeds
    pub deploy_failures: u32,
    /// `is_initializing` answers `true` this many times
    pub initializing_polls: u32,
    /// Firmware stage reported while initializing
    pub mode: RuntimeMode,
    /// Address returned by `runtime_start_address`
    pub start_address: u32,
    /// Resident runtime components
    pub native_assemblies: Vec<NativeAssembly>,
    /// Chunks printed after the runtime restarts with a deployment
    pub output: Vec<String>,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            connect_failures: 0,
            connect_hangs: 0,
            erase_failures: 0,
            deploy_failures: 0,
            initializing_polls: 0,
            mode: RuntimeMode::Clr,
            start_address: 0x0800_4000,
            native_assemblies: vec![NativeAssembly {
                name: "mscorlib".to_string(),
                version: "100.5.0.19".to_string(),
            }],
            output: Vec::new(),
        }
    }
}

impl DeviceScript {
    /// Script printing `output` as a single chunk
    pub fn printing(output: impl Into<String>) -> Self {
        Self {
            output: vec![output.into()],
            ..Self::default()
        }
    }
}

/// Calls received by a simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    /// `connect`
    Connect,
    /// `erase`
    Erase(EraseRegion),
    /// `resume_execution`
    Resume,
    /// `execute_memory`
    ExecuteMemory(u32),
    /// `reboot`
    Reboot(RebootOptions),
    /// `deploy`, with the buffer lengths received
    Deploy {
        /// Length of each buffer
        buffers: Vec<usize>,
        /// Erase flag
        erase: bool,
        /// Reboot flag
        reboot: bool,
    },
}

#[derive(Debug, Default)]
struct DeviceState {
    connects: u32,
    erases: u32,
    deploys: u32,
    init_polls: u32,
    deployed: bool,
    calls: Vec<DeviceCall>,
}

/// A scripted device
pub struct SimulatedDevice {
    port: String,
    script: DeviceScript,
    state: Mutex<DeviceState>,
    tx: broadcast::Sender<String>,
}

impl SimulatedDevice {
    /// Create a device on `port`
    pub fn new(port: &str, script: DeviceScript) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            port: port.to_string(),
            script,
            state: Mutex::new(DeviceState::default()),
            tx,
        }
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    /// Number of `deploy` calls
    pub fn deploy_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, DeviceCall::Deploy { .. }))
            .count()
    }

    fn record(&self, call: DeviceCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl DeviceSession for SimulatedDevice {
    fn port(&self) -> &str {
        &self.port
    }

    async fn connect(&self, timeout: Duration, _options: ConnectOptions) -> Result<(), DeviceError> {
        self.record(DeviceCall::Connect);
        let attempt = {
            let mut state = self.state.lock();
            state.connects += 1;
            state.connects
        };
        if attempt <= self.script.connect_hangs {
            std::future::pending::<()>().await;
        }
        if attempt <= self.script.connect_hangs + self.script.connect_failures {
            return Err(DeviceError::ConnectionFailed(format!(
                "{} did not answer within {timeout:?}",
                self.port
            )));
        }
        Ok(())
    }

    async fn erase(&self, region: EraseRegion) -> Result<(), DeviceError> {
        self.record(DeviceCall::Erase(region));
        let mut state = self.state.lock();
        state.erases += 1;
        if state.erases <= self.script.erase_failures {
            return Err(DeviceError::CommandFailed("erase rejected".to_string()));
        }
        Ok(())
    }

    async fn is_initializing(&self) -> Result<bool, DeviceError> {
        let mut state = self.state.lock();
        if state.init_polls < self.script.initializing_polls {
            state.init_polls += 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn resume_execution(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::Resume);
        Ok(())
    }

    async fn runtime_mode(&self) -> Result<RuntimeMode, DeviceError> {
        Ok(self.script.mode)
    }

    async fn runtime_start_address(&self) -> Result<u32, DeviceError> {
        Ok(self.script.start_address)
    }

    async fn execute_memory(&self, address: u32) -> Result<(), DeviceError> {
        self.record(DeviceCall::ExecuteMemory(address));
        Ok(())
    }

    async fn reboot(&self, options: RebootOptions) -> Result<(), DeviceError> {
        self.record(DeviceCall::Reboot(options));
        let deployed = self.state.lock().deployed;
        if deployed && options == RebootOptions::ClrOnly {
            for chunk in &self.script.output {
                // No subscribers is not an error for a device.
                let _ = self.tx.send(chunk.clone());
            }
        }
        Ok(())
    }

    async fn native_assemblies(&self) -> Result<Vec<NativeAssembly>, DeviceError> {
        Ok(self.script.native_assemblies.clone())
    }

    async fn deploy(
        &self,
        blob: &DeploymentBlob,
        erase: bool,
        reboot: bool,
        progress: &dyn ProgressSink,
    ) -> Result<(), DeviceError> {
        self.record(DeviceCall::Deploy {
            buffers: blob.buffers().iter().map(|b| b.len()).collect(),
            erase,
            reboot,
        });
        progress.report(&format!("Deploying {} bytes", blob.total_size()));

        let mut state = self.state.lock();
        state.deploys += 1;
        if state.deploys <= self.script.deploy_failures {
            return Err(DeviceError::DeploymentFailed("write verification failed".to_string()));
        }
        state.deployed = true;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Scripted device enumeration
///
/// Each scan returns the next entry of `scans`; the last entry repeats.
#[derive(Default)]
pub struct SimulatedDiscovery {
    scans: Vec<Vec<Arc<dyn DeviceSession>>>,
    scan: AtomicUsize,
}

impl SimulatedDiscovery {
    /// Every scan finds the same devices
    pub fn with_devices(devices: Vec<Arc<dyn DeviceSession>>) -> Self {
        Self::with_scans(vec![devices])
    }

    /// Scans return these device lists in order
    pub fn with_scans(scans: Vec<Vec<Arc<dyn DeviceSession>>>) -> Self {
        Self {
            scans,
            scan: AtomicUsize::new(0),
        }
    }

    /// Number of scans performed, including the initial enumeration
    pub fn scan_count(&self) -> usize {
        self.scan.load(Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl DeviceDiscovery for SimulatedDiscovery {
    async fn wait_enumeration_complete(&self) {}

    async fn rescan(&self) {
        self.scan.fetch_add(1, Ordering::SeqCst);
    }

    fn devices(&self) -> Vec<Arc<dyn DeviceSession>> {
        let index = self.scan.load(Ordering::SeqCst);
        self.scans
            .get(index)
            .or_else(|| self.scans.last())
            .cloned()
            .unwrap_or_default()
    }
}
