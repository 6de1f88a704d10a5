//! Deployment to a prepared device and collection of its test output

use super::device::{DeviceError, DeviceSession, LogProgress, RebootOptions};
use super::image::DeploymentBlob;
use super::logger::HostLogger;
use super::model::TargetOutput;
use super::parser::DONE_MARKER;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deployment errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeploymentError {
    /// Nothing to deploy
    #[error("No images to deploy")]
    EmptyBlob,

    /// Both transfer attempts failed
    #[error("Deployment failed after retry: {0}")]
    TransferFailed(DeviceError),

    /// The runtime could not be restarted after deployment
    #[error("Reboot after deployment failed: {0}")]
    RebootFailed(DeviceError),

    /// Cancelled before the transfer finished
    #[error("Deployment cancelled")]
    Cancelled,
}

/// Deploys a blob, restarts the runtime and waits for the test run
pub struct DeploymentEngine<'a> {
    session: &'a dyn DeviceSession,
    logger: &'a dyn HostLogger,
    cancel: CancellationToken,
    retry_delay: Duration,
    completion_timeout: Duration,
}

impl<'a> DeploymentEngine<'a> {
    /// Pause before the single retry
    pub const RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Create an engine for a prepared session
    pub fn new(
        session: &'a dyn DeviceSession,
        logger: &'a dyn HostLogger,
        cancel: CancellationToken,
        completion_timeout: Duration,
    ) -> Self {
        Self {
            session,
            logger,
            cancel,
            retry_delay: Self::RETRY_DELAY,
            completion_timeout,
        }
    }

    /// Override the retry pause
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Transfer the blob, retrying once with a fresh copy
    ///
    /// Erase and reboot are suppressed; the session manager already erased.
    pub async fn deploy(&self, blob: &DeploymentBlob) -> Result<(), DeploymentError> {
        if blob.is_empty() {
            self.logger.error("No images to deploy");
            return Err(DeploymentError::EmptyBlob);
        }

        let spare = blob.deep_copy();
        info!(
            port = self.session.port(),
            images = blob.len(),
            bytes = blob.total_size(),
            "deploying"
        );

        let first = self.transfer(blob).await?;
        let Err(first_error) = first else {
            return Ok(());
        };
        warn!(error = %first_error, "deployment failed, retrying");
        self.logger.verbose(&format!(
            "Deployment failed ({first_error}), retrying in {:?}",
            self.retry_delay
        ));

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(DeploymentError::Cancelled),
            () = tokio::time::sleep(self.retry_delay) => {}
        }

        match self.transfer(&spare).await? {
            Ok(()) => Ok(()),
            Err(e) => {
                self.logger.error(&format!("Deployment failed twice: {e}"));
                Err(DeploymentError::TransferFailed(e))
            }
        }
    }

    async fn transfer(
        &self,
        blob: &DeploymentBlob,
    ) -> Result<Result<(), DeviceError>, DeploymentError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(DeploymentError::Cancelled),
            result = self.session.deploy(blob, false, false, &LogProgress) => Ok(result),
        }
    }

    /// Restart the runtime and collect its output until `Done.`
    ///
    /// Waiting stops at the completion marker, at the completion timeout,
    /// when the message stream closes, or on cancellation.
    pub async fn execute(&self) -> Result<TargetOutput, DeploymentError> {
        let mut messages = self.session.subscribe();

        self.session
            .reboot(RebootOptions::ClrOnly)
            .await
            .map_err(|e| {
                self.logger.error(&format!("Failed to reboot after deployment: {e}"));
                DeploymentError::RebootFailed(e)
            })?;
        self.logger.verbose("Runtime rebooted, waiting for test output");

        let deadline = Instant::now() + self.completion_timeout;
        let mut output = TargetOutput::default();

        loop {
            let received = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    output.cancelled = true;
                    break;
                }
                received = tokio::time::timeout_at(deadline, messages.recv()) => received,
            };

            match received {
                Ok(Ok(chunk)) => {
                    output.text.push_str(&chunk);
                    // The marker may straddle two chunks.
                    if output.text.contains(DONE_MARKER) {
                        output.completed = true;
                        break;
                    }
                }
                Ok(Err(RecvError::Lagged(missed))) => {
                    warn!(missed, "device output lagged, messages dropped");
                }
                Ok(Err(RecvError::Closed)) => {
                    debug!("device message stream closed");
                    break;
                }
                Err(_) => {
                    self.logger.error(&format!(
                        "Test run did not complete within {:?}",
                        self.completion_timeout
                    ));
                    break;
                }
            }
        }

        Ok(output)
    }

    /// Deploy then execute
    pub async fn run(&self, blob: &DeploymentBlob) -> Result<TargetOutput, DeploymentError> {
        self.deploy(blob).await?;
        self.execute().await
    }
}
