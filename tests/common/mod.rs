//! Shared helpers for integration tests

#![allow(dead_code)]

use nanotest_core::core::device::DeviceSession;
use nanotest_core::core::simulator::{DeviceScript, SimulatedDevice, SimulatedDiscovery};
use nanotest_core::{RetryPolicy, TestCase};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A build output directory holding `images` (name, byte length)
pub fn image_dir(images: &[(&str, usize)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, len) in images {
        std::fs::write(dir.path().join(name), vec![0xA5; *len]).unwrap();
    }
    dir
}

/// Path of the test assembly inside `dir`
pub fn source(dir: &Path) -> PathBuf {
    dir.join("Tests.pe")
}

/// Test cases of one assembly
pub fn cases(dir: &Path, names: &[&str]) -> Vec<TestCase> {
    names
        .iter()
        .map(|name| TestCase::new(format!("Tests.Math.{name}"), *name, source(dir)))
        .collect()
}

/// Policy with short delays for paused-time tests
pub fn fast_policy(retries: u32) -> RetryPolicy {
    RetryPolicy {
        number_of_retries: retries,
        enumeration_timeout: Duration::from_secs(1),
        connect_timeout: Duration::from_millis(50),
        connect_retry_delay: Duration::from_millis(10),
        erase_retry_delay: Duration::from_millis(10),
        init_base_delay: Duration::from_millis(10),
    }
}

/// One simulated device and a discovery that always finds it
pub fn single_device(port: &str, script: DeviceScript) -> (Arc<SimulatedDevice>, Arc<SimulatedDiscovery>) {
    let device = Arc::new(SimulatedDevice::new(port, script));
    let session: Arc<dyn DeviceSession> = device.clone();
    let discovery = Arc::new(SimulatedDiscovery::with_devices(vec![session]));
    (device, discovery)
}
