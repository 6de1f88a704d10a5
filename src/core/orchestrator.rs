//! Test run orchestration
//!
//! Picks the target, prepares it, runs the tests and turns the output into
//! results. Faults never reach the host: whatever happens, [`Orchestrator::run`]
//! returns one result per test.

use super::deploy::{DeploymentEngine, DeploymentError};
use super::device::{DeviceDiscovery, DeviceSessionManager, RetryPolicy, SessionOutcome};
use super::discovery::group_by_source;
use super::emulator::{EmulatorConfig, EmulatorError, EmulatorProcessManager};
use super::image::{DeploymentBlob, DeploymentImage, ImageCollector, ImageError, ManifestMetadataReader, MetadataReader};
use super::logger::{HostLogger, Logger};
use super::model::{build_scaffold, MessageCategory, TargetOutput, TestCase, TestOutcome, TestResult};
use super::parser::parse_output;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

/// Where the tests run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Local emulator process
    Emulator,
    /// Physical device, optionally pinned to a port
    Hardware {
        /// Port to select when several devices are connected
        port: Option<String>,
    },
}

/// Everything a run needs to know
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Target selection
    pub target: Target,
    /// Upper bound for one test execution on the target
    pub session_timeout: Duration,
    /// Emulator invocation
    pub emulator: EmulatorConfig,
    /// Device preparation budgets
    pub retry: RetryPolicy,
    /// Report a configured port with no matching device as a failure
    pub fail_on_port_mismatch: bool,
    /// Report a device stuck initializing as a failure
    pub fail_on_stuck_initialize: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            target: Target::Emulator,
            session_timeout: Duration::from_millis(300_000),
            emulator: EmulatorConfig::default(),
            retry: RetryPolicy::default(),
            fail_on_port_mismatch: true,
            fail_on_stuck_initialize: true,
        }
    }
}

/// Faults that abort a run group
#[derive(Error, Debug)]
enum RunError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Emulator(#[from] EmulatorError),
}

/// State owned by one run
struct RunContext {
    logger: Logger,
    cancel: CancellationToken,
}

/// Drives test runs against the emulator or a device
pub struct Orchestrator {
    options: RunOptions,
    logger: Logger,
    metadata: Arc<dyn MetadataReader>,
    discovery: Option<Arc<dyn DeviceDiscovery>>,
    cancel: Mutex<CancellationToken>,
}

impl Orchestrator {
    /// Create an orchestrator
    pub fn new(options: RunOptions, logger: Logger) -> Self {
        Self {
            options,
            logger,
            metadata: Arc::new(ManifestMetadataReader::new()),
            discovery: None,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Use a different metadata reader
    #[must_use]
    pub fn with_metadata_reader(mut self, reader: Arc<dyn MetadataReader>) -> Self {
        self.metadata = reader;
        self
    }

    /// Device discovery used by hardware runs
    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn DeviceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Options in effect
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Token that cancels the in-flight run, or the next one if none is running
    ///
    /// Once a cancelled run returns, later runs get a fresh token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Stop the in-flight run
    ///
    /// Kills a running emulator. Hardware runs stop at their next wait;
    /// tests not reported yet stay pending. Called between runs, it stops
    /// the next one before it starts.
    pub fn cancel(&self) {
        info!("cancellation requested");
        self.cancel.lock().cancel();
    }

    /// Run `tests` and return one result per test
    pub async fn run(&self, tests: &[TestCase]) -> Vec<TestResult> {
        let cancel = self.cancel_token();
        let mut all = Vec::with_capacity(tests.len());
        for (source, group) in group_by_source(tests) {
            let ctx = RunContext {
                logger: self.logger.clone(),
                cancel: cancel.child_token(),
            };
            let span = info_span!("run", source = %source.display(), tests = group.len());
            let results = self.run_group(&ctx, &source, &group).instrument(span).await;
            all.extend(results);
        }

        {
            let mut current = self.cancel.lock();
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
        }
        all
    }

    async fn run_group(&self, ctx: &RunContext, source: &Path, tests: &[TestCase]) -> Vec<TestResult> {
        let mut results = build_scaffold(tests);
        if ctx.cancel.is_cancelled() {
            return results;
        }

        let outcome = AssertUnwindSafe(self.execute(ctx, source, &mut results))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => ctx.logger.panic(&format!("Test run aborted: {e}")),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown fault".to_string());
                ctx.logger.panic(&format!("Test run aborted: {message}"));
            }
        }
        results
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        source: &Path,
        results: &mut [TestResult],
    ) -> Result<(), RunError> {
        let images = ImageCollector::new(self.metadata.as_ref()).collect_for_source(source)?;
        ctx.logger
            .verbose(&format!("Collected {} image(s) for {}", images.len(), source.display()));

        match &self.options.target {
            Target::Emulator => self.run_emulator(ctx, &images, results).await,
            Target::Hardware { port } => {
                self.run_hardware(ctx, port.as_deref(), &images, results).await
            }
        }
    }

    async fn run_emulator(
        &self,
        ctx: &RunContext,
        images: &[DeploymentImage],
        results: &mut [TestResult],
    ) -> Result<(), RunError> {
        if images.is_empty() {
            fail_first(ctx.logger.as_ref(), results, "No images found to load in the emulator");
            return Ok(());
        }

        let config = EmulatorConfig {
            session_timeout: self.options.session_timeout,
            ..self.options.emulator.clone()
        };
        let manager = EmulatorProcessManager::new(config, ctx.logger.as_ref(), ctx.cancel.clone());
        let output = match manager.run(images).await {
            Ok(output) => output,
            Err(e @ (EmulatorError::NotFound(_) | EmulatorError::SpawnFailed { .. })) => {
                fail_first(ctx.logger.as_ref(), results, &e.to_string());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.conclude(ctx, output.into_target_output(), results);
        Ok(())
    }

    async fn run_hardware(
        &self,
        ctx: &RunContext,
        port: Option<&str>,
        images: &[DeploymentImage],
        results: &mut [TestResult],
    ) -> Result<(), RunError> {
        let logger = ctx.logger.as_ref();
        let Some(discovery) = &self.discovery else {
            fail_first(logger, results, "No device discovery is available for hardware runs");
            return Ok(());
        };

        let manager = DeviceSessionManager::new(
            discovery.as_ref(),
            self.options.retry.clone(),
            logger,
            ctx.cancel.clone(),
        );
        let session = match manager.prepare(port).await {
            SessionOutcome::Ready(session) => session,
            SessionOutcome::Failed(message) => {
                fail_first(logger, results, &message);
                return Ok(());
            }
            SessionOutcome::PortNotFound(port) => {
                if self.options.fail_on_port_mismatch {
                    fail_first(
                        logger,
                        results,
                        &format!("No device found on port {port}. Check the configured port."),
                    );
                }
                return Ok(());
            }
            SessionOutcome::NotInitialized(port) => {
                if self.options.fail_on_stuck_initialize {
                    fail_first(
                        logger,
                        results,
                        &format!(
                            "Device at {port} failed to initialize. If the situation persists, reboot the device."
                        ),
                    );
                }
                return Ok(());
            }
            SessionOutcome::Cancelled => {
                logger.detailed("Run cancelled while preparing the device");
                return Ok(());
            }
        };

        let blob = DeploymentBlob::load(images)?;
        let engine = DeploymentEngine::new(
            session.as_ref(),
            logger,
            ctx.cancel.clone(),
            self.options.session_timeout,
        );
        match engine.run(&blob).await {
            Ok(output) => self.conclude(ctx, output, results),
            Err(DeploymentError::Cancelled) => {
                logger.detailed("Run cancelled during deployment");
            }
            Err(DeploymentError::EmptyBlob) => {
                fail_first(logger, results, "No images found to deploy to the device");
            }
            Err(e @ (DeploymentError::TransferFailed(_) | DeploymentError::RebootFailed(_))) => {
                fail_first(
                    logger,
                    results,
                    &format!(
                        "Couldn't deploy to the device at {}: {e}. If the situation persists, reboot the device.",
                        session.port()
                    ),
                );
            }
        }
        Ok(())
    }

    /// Apply target output to the results
    ///
    /// Output without the completion marker is still parsed, then the
    /// first result is failed with the raw text attached.
    fn conclude(&self, ctx: &RunContext, output: TargetOutput, results: &mut [TestResult]) {
        if output.cancelled {
            ctx.logger.detailed("Run cancelled, results left pending");
            return;
        }

        let stats = parse_output(&output.text, results);
        ctx.logger.verbose(&format!(
            "Parsed output: {} outcome(s) applied, {} unmatched, {} propagated",
            stats.applied, stats.unmatched, stats.propagated
        ));

        if !output.completed {
            ctx.logger.error("Target output does not contain the completion marker");
            if let Some(first) = results.first_mut() {
                first.fail("Tests did not run to completion. See the captured output for details.");
                if !output.text.is_empty() {
                    first.add_message(MessageCategory::StandardError, output.text);
                }
            }
        }

        let pending = results
            .iter()
            .filter(|r| r.outcome == TestOutcome::Pending)
            .count();
        if pending > 0 {
            ctx.logger
                .detailed(&format!("{pending} test(s) not reported by the target"));
        }
    }
}

/// Fail the first result with a remediation message
fn fail_first(logger: &dyn HostLogger, results: &mut [TestResult], message: &str) {
    logger.error(message);
    if let Some(first) = results.first_mut() {
        first.fail(message);
    }
}
