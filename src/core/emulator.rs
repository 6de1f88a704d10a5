//! Local emulator process management
//!
//! Runs the emulator with one `-load <image>` argument per image, captures
//! both output streams, and makes sure the process never outlives the run.

use super::image::DeploymentImage;
use super::logger::HostLogger;
use super::model::TargetOutput;
use super::parser::is_complete;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Emulator error types
#[derive(Error, Debug)]
pub enum EmulatorError {
    /// Executable could not be located
    #[error("Emulator executable '{0}' not found. Install it or set its path in the settings.")]
    NotFound(String),

    /// Process could not be started
    #[error("Failed to start the emulator {path}: {source}")]
    SpawnFailed {
        /// Executable
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the process failed
    #[error("I/O error while running the emulator: {0}")]
    Io(#[from] std::io::Error),
}

/// How to find and invoke the emulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorConfig {
    /// Explicit path to the executable
    pub path: Option<PathBuf>,
    /// Executable name searched on `PATH`
    pub executable: String,
    /// Arguments placed before the image list
    pub extra_args: Vec<String>,
    /// Upper bound for the whole emulator run
    pub session_timeout: Duration,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            path: None,
            executable: "nanoclr".to_string(),
            extra_args: Vec::new(),
            session_timeout: Duration::from_millis(300_000),
        }
    }
}

/// Captured emulator streams
#[derive(Debug, Clone, Default)]
pub struct EmulatorOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit status, when the process exited on its own
    pub status: Option<ExitStatus>,
    /// The session timeout elapsed
    pub timed_out: bool,
    /// The run was cancelled
    pub cancelled: bool,
}

impl EmulatorOutput {
    /// Output in the form the parser consumes
    pub fn into_target_output(self) -> TargetOutput {
        TargetOutput {
            completed: is_complete(&self.stdout),
            text: self.stdout,
            cancelled: self.cancelled,
        }
    }
}

/// Grace period for the process to die after a kill
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Kills the child on every exit path
struct ProcessGuard {
    child: Child,
}

impl ProcessGuard {
    async fn shutdown(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "emulator kill failed");
            return;
        }
        if tokio::time::timeout(KILL_GRACE, self.child.wait()).await.is_err() {
            warn!("emulator did not exit within {KILL_GRACE:?} of being killed");
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        // Already-exited children report an error here; nothing to do then.
        let _ = self.child.start_kill();
    }
}

/// Launches and supervises the emulator
pub struct EmulatorProcessManager<'a> {
    config: EmulatorConfig,
    logger: &'a dyn HostLogger,
    cancel: CancellationToken,
}

impl<'a> EmulatorProcessManager<'a> {
    /// Create a manager
    pub fn new(config: EmulatorConfig, logger: &'a dyn HostLogger, cancel: CancellationToken) -> Self {
        Self {
            config,
            logger,
            cancel,
        }
    }

    /// Resolve the executable path
    pub fn locate(&self) -> Result<PathBuf, EmulatorError> {
        if let Some(path) = &self.config.path {
            return if path.is_file() {
                Ok(path.clone())
            } else {
                Err(EmulatorError::NotFound(path.display().to_string()))
            };
        }
        find_on_path(&self.config.executable)
            .ok_or_else(|| EmulatorError::NotFound(self.config.executable.clone()))
    }

    /// Command-line arguments for the given images
    pub fn arguments(&self, images: &[DeploymentImage]) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.config.extra_args.iter().map(OsString::from).collect();
        for image in images {
            args.push(OsString::from("-load"));
            args.push(image.path.clone().into_os_string());
        }
        args
    }

    /// Run the emulator over `images` and collect its output
    pub async fn run(&self, images: &[DeploymentImage]) -> Result<EmulatorOutput, EmulatorError> {
        let executable = self.locate()?;
        self.run_executable(&executable, images).await
    }

    /// Run a specific executable over `images`
    pub async fn run_executable(
        &self,
        executable: &Path,
        images: &[DeploymentImage],
    ) -> Result<EmulatorOutput, EmulatorError> {
        let args = self.arguments(images);
        info!(executable = %executable.display(), images = images.len(), "starting emulator");
        self.logger.verbose(&format!(
            "Launching {} {}",
            executable.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        ));

        let child = Command::new(executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EmulatorError::SpawnFailed {
                path: executable.to_path_buf(),
                source,
            })?;
        let mut guard = ProcessGuard { child };

        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));
        let stdout_done = guard
            .child
            .stdout
            .take()
            .map(|pipe| capture_lines(pipe, stdout.clone(), "stdout"));
        let stderr_done = guard
            .child
            .stderr
            .take()
            .map(|pipe| capture_lines(pipe, stderr.clone(), "stderr"));

        let mut output = EmulatorOutput::default();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                info!("emulator run cancelled");
                output.cancelled = true;
            }
            waited = tokio::time::timeout(self.config.session_timeout, guard.child.wait()) => {
                match waited {
                    Ok(status) => output.status = Some(status?),
                    Err(_) => {
                        output.timed_out = true;
                        self.logger.verbose(&format!(
                            "Emulator still running after {:?}, stopping it",
                            self.config.session_timeout
                        ));
                    }
                }
            }
        }

        guard.shutdown().await;

        for done in [stdout_done, stderr_done].into_iter().flatten() {
            if tokio::time::timeout(KILL_GRACE, done).await.is_err() {
                debug!("output stream did not close after the emulator exited");
            }
        }

        output.stdout = std::mem::take(&mut *stdout.lock());
        output.stderr = std::mem::take(&mut *stderr.lock());
        if !output.stderr.is_empty() {
            self.logger
                .detailed(&format!("Emulator standard error:\n{}", output.stderr));
        }
        debug!(
            status = ?output.status,
            timed_out = output.timed_out,
            bytes = output.stdout.len(),
            "emulator finished"
        );
        Ok(output)
    }
}

/// Append every line of `pipe` to `buffer`; the receiver fires at end of stream
fn capture_lines<R>(pipe: R, buffer: Arc<Mutex<String>>, stream: &'static str) -> oneshot::Receiver<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    trace!(stream, "{line}");
                    let mut buffer = buffer.lock();
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(stream, error = %e, "emulator stream read failed");
                    break;
                }
            }
        }
        let _ = done_tx.send(());
    });
    done_rx
}

/// Search `PATH` for an executable
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let path = dir.join(name);
        if path.is_file() {
            return Some(path);
        }
        if cfg!(windows) {
            let exe = path.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}
