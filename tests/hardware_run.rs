//! Hardware runs against simulated devices

mod common;

use common::{cases, fast_policy, image_dir, single_device, source};
use nanotest_core::core::device::{DeviceSession, RebootOptions, NO_DEVICE_MESSAGE};
use nanotest_core::core::model::{MessageCategory, SETUP_TRAIT_VALUE, TYPE_TRAIT};
use nanotest_core::core::simulator::{DeviceCall, DeviceScript, SimulatedDevice, SimulatedDiscovery};
use nanotest_core::{MemoryLogger, Orchestrator, RunOptions, Severity, Target, TestCase, TestOutcome};
use std::sync::Arc;
use std::time::Duration;

fn hardware(port: Option<&str>, retries: u32) -> RunOptions {
    RunOptions {
        target: Target::Hardware {
            port: port.map(str::to_string),
        },
        session_timeout: Duration::from_secs(10),
        retry: fast_policy(retries),
        ..RunOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_passing_run_reports_every_test() {
    let dir = image_dir(&[("Tests.pe", 10), ("mscorlib.pe", 8)]);
    let tests = cases(dir.path(), &["Add", "Sub"]);
    let (device, discovery) = single_device(
        "COM3",
        DeviceScript::printing(
            "Ready.\r\nTest passed: Add, 500\r\nTest passed: Sub, 1200\r\nDone.\r\n",
        ),
    );

    let logger = Arc::new(MemoryLogger::new());
    let orchestrator =
        Orchestrator::new(hardware(None, 2), logger.clone()).with_discovery(discovery);
    let results = orchestrator.run(&tests).await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.outcome == TestOutcome::Passed));
    assert_eq!(results[0].duration, Duration::from_micros(50));
    assert_eq!(results[1].duration, Duration::from_micros(120));
    assert!(logger.at_least(Severity::Error).is_empty());

    let calls = device.calls();
    assert!(calls.contains(&DeviceCall::Deploy {
        buffers: vec![12, 8],
        erase: false,
        reboot: false,
    }));
    assert!(calls.contains(&DeviceCall::Reboot(RebootOptions::ClrOnly)));
}

#[tokio::test(start_paused = true)]
async fn test_skipped_setup_skips_its_class() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let src = source(dir.path());
    let tests = vec![
        TestCase::new("Tests.Math.Init", "Init", &src)
            .with_trait(TYPE_TRAIT, SETUP_TRAIT_VALUE),
        TestCase::new("Tests.Math.Add", "Add", &src),
        TestCase::new("Tests.Math.Sub", "Sub", &src),
        TestCase::new("Tests.Io.Read", "Read", &src),
    ];
    let (_device, discovery) = single_device(
        "COM3",
        DeviceScript::printing(
            "Ready.\nTest skipped: Init, board has no SD card\nTest passed: Read, 10\nDone.\n",
        ),
    );

    let orchestrator =
        Orchestrator::new(hardware(None, 0), Arc::new(MemoryLogger::new())).with_discovery(discovery);
    let results = orchestrator.run(&tests).await;

    assert_eq!(results[0].outcome, TestOutcome::Skipped);
    assert_eq!(results[1].outcome, TestOutcome::Skipped);
    assert_eq!(
        results[1].error_message.as_deref(),
        Some("Setup method 'Init' has been skipped, skipping test")
    );
    assert_eq!(results[2].outcome, TestOutcome::Skipped);
    assert_eq!(results[3].outcome, TestOutcome::Passed);
}

#[tokio::test(start_paused = true)]
async fn test_no_device_fails_first_result_without_deploying() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add", "Sub"]);
    let discovery = Arc::new(SimulatedDiscovery::with_scans(vec![Vec::new()]));

    let logger = Arc::new(MemoryLogger::new());
    let orchestrator =
        Orchestrator::new(hardware(None, 3), logger.clone()).with_discovery(discovery.clone());
    let results = orchestrator.run(&tests).await;

    assert_eq!(discovery.scan_count(), 4);
    assert_eq!(results[0].outcome, TestOutcome::Failed);
    assert_eq!(results[0].error_message.as_deref(), Some(NO_DEVICE_MESSAGE));
    assert_eq!(results[1].outcome, TestOutcome::Pending);
    assert!(logger.contains(Severity::Error, "Couldn't find any device"));
}

#[tokio::test(start_paused = true)]
async fn test_device_appearing_on_rescan_is_used() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add"]);
    let device = Arc::new(SimulatedDevice::new(
        "COM3",
        DeviceScript::printing("Ready.\nTest passed: Add, 1\nDone.\n"),
    ));
    let session: Arc<dyn DeviceSession> = device.clone();
    let discovery = Arc::new(SimulatedDiscovery::with_scans(vec![
        Vec::new(),
        Vec::new(),
        vec![session],
    ]));

    let orchestrator = Orchestrator::new(hardware(None, 5), Arc::new(MemoryLogger::new()))
        .with_discovery(discovery.clone());
    let results = orchestrator.run(&tests).await;

    assert_eq!(discovery.scan_count(), 3);
    assert_eq!(results[0].outcome, TestOutcome::Passed);
}

#[tokio::test(start_paused = true)]
async fn test_deploy_retry_sends_identical_buffers() {
    let dir = image_dir(&[("Tests.pe", 10), ("mscorlib.pe", 6)]);
    let tests = cases(dir.path(), &["Add"]);
    let (device, discovery) = single_device(
        "COM3",
        DeviceScript {
            deploy_failures: 1,
            ..DeviceScript::printing("Ready.\nTest passed: Add, 1\nDone.\n")
        },
    );

    let orchestrator =
        Orchestrator::new(hardware(None, 0), Arc::new(MemoryLogger::new())).with_discovery(discovery);
    let results = orchestrator.run(&tests).await;

    let deploys: Vec<DeviceCall> = device
        .calls()
        .into_iter()
        .filter(|c| matches!(c, DeviceCall::Deploy { .. }))
        .collect();
    assert_eq!(deploys.len(), 2);
    assert_eq!(deploys[0], deploys[1]);
    assert_eq!(results[0].outcome, TestOutcome::Passed);
}

#[tokio::test(start_paused = true)]
async fn test_second_deploy_failure_fails_first_result() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add", "Sub"]);
    let (device, discovery) = single_device(
        "COM3",
        DeviceScript {
            deploy_failures: 2,
            ..DeviceScript::default()
        },
    );

    let orchestrator =
        Orchestrator::new(hardware(None, 0), Arc::new(MemoryLogger::new())).with_discovery(discovery);
    let results = orchestrator.run(&tests).await;

    assert_eq!(device.deploy_count(), 2);
    assert_eq!(results[0].outcome, TestOutcome::Failed);
    assert!(results[0]
        .error_message
        .as_deref()
        .is_some_and(|m| m.starts_with("Couldn't deploy to the device at COM3")));
    assert_eq!(results[1].outcome, TestOutcome::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_port_mismatch_policy() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add"]);
    let devices = || -> Vec<Arc<dyn DeviceSession>> {
        vec![
            Arc::new(SimulatedDevice::new("COM3", DeviceScript::default())) as Arc<dyn DeviceSession>,
            Arc::new(SimulatedDevice::new("COM4", DeviceScript::default())),
        ]
    };

    let strict = Orchestrator::new(hardware(Some("COM9"), 0), Arc::new(MemoryLogger::new()))
        .with_discovery(Arc::new(SimulatedDiscovery::with_devices(devices())));
    let results = strict.run(&tests).await;
    assert_eq!(results[0].outcome, TestOutcome::Failed);
    assert!(results[0]
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("COM9")));

    let lenient = Orchestrator::new(
        RunOptions {
            fail_on_port_mismatch: false,
            ..hardware(Some("COM9"), 0)
        },
        Arc::new(MemoryLogger::new()),
    )
    .with_discovery(Arc::new(SimulatedDiscovery::with_devices(devices())));
    let results = lenient.run(&tests).await;
    assert_eq!(results[0].outcome, TestOutcome::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_configured_port_selects_among_devices() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add"]);
    let idle = Arc::new(SimulatedDevice::new("COM3", DeviceScript::default()));
    let wanted = Arc::new(SimulatedDevice::new(
        "COM4",
        DeviceScript::printing("Ready.\nTest failed: Add, Expected 2 but was 3\nDone.\n"),
    ));
    let devices: Vec<Arc<dyn DeviceSession>> =
        vec![idle.clone() as Arc<dyn DeviceSession>, wanted.clone()];

    let orchestrator = Orchestrator::new(hardware(Some("COM4"), 0), Arc::new(MemoryLogger::new()))
        .with_discovery(Arc::new(SimulatedDiscovery::with_devices(devices)));
    let results = orchestrator.run(&tests).await;

    assert!(idle.calls().is_empty());
    assert_eq!(wanted.deploy_count(), 1);
    assert_eq!(results[0].outcome, TestOutcome::Failed);
    assert_eq!(results[0].error_message.as_deref(), Some("Expected 2 but was 3"));
}

#[tokio::test(start_paused = true)]
async fn test_connect_exhaustion_fails_without_deploying() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add"]);
    let (device, discovery) = single_device(
        "COM3",
        DeviceScript {
            connect_hangs: 1,
            connect_failures: 10,
            ..DeviceScript::default()
        },
    );

    let orchestrator =
        Orchestrator::new(hardware(None, 2), Arc::new(MemoryLogger::new())).with_discovery(discovery);
    let results = orchestrator.run(&tests).await;

    let connects = device
        .calls()
        .iter()
        .filter(|c| **c == DeviceCall::Connect)
        .count();
    assert_eq!(connects, 3);
    assert_eq!(device.deploy_count(), 0);
    assert_eq!(results[0].outcome, TestOutcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_erase_recovers_within_retries() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add"]);
    let (device, discovery) = single_device(
        "COM3",
        DeviceScript {
            erase_failures: 2,
            ..DeviceScript::printing("Ready.\nTest passed: Add, 1\nDone.\n")
        },
    );

    let orchestrator =
        Orchestrator::new(hardware(None, 2), Arc::new(MemoryLogger::new())).with_discovery(discovery);
    let results = orchestrator.run(&tests).await;

    let erases = device
        .calls()
        .iter()
        .filter(|c| matches!(c, DeviceCall::Erase(_)))
        .count();
    assert_eq!(erases, 3);
    assert_eq!(results[0].outcome, TestOutcome::Passed);
}

#[tokio::test(start_paused = true)]
async fn test_missing_native_assemblies_fail_the_run() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add"]);
    let (device, discovery) = single_device(
        "COM3",
        DeviceScript {
            native_assemblies: Vec::new(),
            ..DeviceScript::default()
        },
    );

    let orchestrator =
        Orchestrator::new(hardware(None, 0), Arc::new(MemoryLogger::new())).with_discovery(discovery);
    let results = orchestrator.run(&tests).await;

    assert_eq!(device.deploy_count(), 0);
    assert_eq!(results[0].outcome, TestOutcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_initialize_policy() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add"]);
    let stuck = || DeviceScript {
        initializing_polls: u32::MAX,
        ..DeviceScript::default()
    };

    let (device, discovery) = single_device("COM3", stuck());
    let strict =
        Orchestrator::new(hardware(None, 1), Arc::new(MemoryLogger::new())).with_discovery(discovery);
    let results = strict.run(&tests).await;
    assert_eq!(device.deploy_count(), 0);
    assert_eq!(results[0].outcome, TestOutcome::Failed);
    assert!(results[0]
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("reboot the device")));

    let (_device, discovery) = single_device("COM3", stuck());
    let lenient = Orchestrator::new(
        RunOptions {
            fail_on_stuck_initialize: false,
            ..hardware(None, 1)
        },
        Arc::new(MemoryLogger::new()),
    )
    .with_discovery(discovery);
    let results = lenient.run(&tests).await;
    assert_eq!(results[0].outcome, TestOutcome::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_output_without_done_fails_first_result() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add", "Sub"]);
    let (_device, discovery) = single_device(
        "COM3",
        DeviceScript::printing("Ready.\nTest passed: Sub, 3\n"),
    );

    let logger = Arc::new(MemoryLogger::new());
    let orchestrator = Orchestrator::new(
        RunOptions {
            session_timeout: Duration::from_secs(2),
            ..hardware(None, 0)
        },
        logger.clone(),
    )
    .with_discovery(discovery);
    let results = orchestrator.run(&tests).await;

    assert_eq!(results[0].outcome, TestOutcome::Failed);
    assert!(results[0]
        .messages
        .iter()
        .any(|m| m.category == MessageCategory::StandardError && m.text.contains("Test passed: Sub")));
    assert_eq!(results[1].outcome, TestOutcome::Passed);
    assert_eq!(results[1].duration, Duration::from_nanos(300));
    assert!(logger.contains(Severity::Error, "completion marker"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_run_leaves_results_pending() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add"]);
    let (device, discovery) = single_device("COM3", DeviceScript::default());

    let orchestrator =
        Orchestrator::new(hardware(None, 0), Arc::new(MemoryLogger::new())).with_discovery(discovery);
    orchestrator.cancel();
    let results = orchestrator.run(&tests).await;

    assert!(device.calls().is_empty());
    assert_eq!(results[0].outcome, TestOutcome::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_run_after_cancel_executes() {
    let dir = image_dir(&[("Tests.pe", 16)]);
    let tests = cases(dir.path(), &["Add"]);
    let (device, discovery) = single_device(
        "COM3",
        DeviceScript::printing("Ready.\nTest passed: Add, 500\nDone.\n"),
    );

    let orchestrator =
        Orchestrator::new(hardware(None, 0), Arc::new(MemoryLogger::new())).with_discovery(discovery);
    let stale = orchestrator.cancel_token();
    orchestrator.cancel();
    let cancelled = orchestrator.run(&tests).await;
    assert_eq!(cancelled[0].outcome, TestOutcome::Pending);
    assert!(device.calls().is_empty());

    let results = orchestrator.run(&tests).await;
    assert!(stale.is_cancelled());
    assert!(!orchestrator.cancel_token().is_cancelled());
    assert_eq!(results[0].outcome, TestOutcome::Passed);
    assert_eq!(results[0].duration, Duration::from_micros(50));
}
