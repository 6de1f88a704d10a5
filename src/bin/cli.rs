//! nanotest CLI - runs test images on the emulator or a device
//!
//! Settings come from `settings.toml` (or `--settings`); flags override them.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use nanotest_core::cli::report::Reporter;
use nanotest_core::cli::{print_exit_codes, CliResult, ExitCodes, OutputFormat};
use nanotest_core::config::{ConfigError, LoggingSettings, RunSettings};
use nanotest_core::core::device::{DeviceSession, NO_DEVICE_MESSAGE};
use nanotest_core::core::discovery::{ManifestDiscoverer, TestDiscoverer};
use nanotest_core::core::serial::list_ports;
use nanotest_core::core::simulator::{DeviceScript, SimulatedDevice, SimulatedDiscovery};
use nanotest_core::{publish, Orchestrator, TestOutcome, TestResult, TracingLogger};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

/// nanotest CLI
#[derive(Parser, Debug)]
#[command(
    name = "nanotest",
    version,
    about = "Run unit tests on a device emulator or on real hardware",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Settings file (defaults to settings.toml in the config directory)
    #[arg(short, long, env = "NANOTEST_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tests listed in a manifest
    Run(RunArgs),

    /// List serial ports that may host a device
    ListDevices {
        /// Show USB details
        #[arg(short, long)]
        detailed: bool,
    },

    /// Show exit code table
    ExitCodes,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Test manifest (tests.toml)
    #[arg(short, long, default_value = "tests.toml")]
    tests: PathBuf,

    /// Run on real hardware
    #[arg(long)]
    hardware: bool,

    /// Device port to use when several are connected
    #[arg(short, long, env = "NANOTEST_PORT")]
    port: Option<String>,

    /// Session timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Emulator executable
    #[arg(long, env = "NANOTEST_EMULATOR")]
    emulator: Option<PathBuf>,

    /// Extra emulator argument (repeatable)
    #[arg(long = "emulator-arg", allow_hyphen_values = true)]
    emulator_args: Vec<String>,

    /// Dry run against a simulated device printing this file's contents
    #[arg(long, value_name = "OUTPUT_FILE")]
    simulate: Option<PathBuf>,

    /// Also write logs into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, settings: &mut RunSettings) {
        if self.hardware || self.simulate.is_some() {
            settings.is_real_hardware = true;
        }
        if let Some(port) = &self.port {
            settings.real_hardware_port = Some(port.clone());
        }
        if let Some(timeout) = self.timeout {
            settings.session_timeout_ms = timeout;
        }
        if let Some(path) = &self.emulator {
            settings.emulator.path = Some(path.clone());
        }
        settings
            .emulator
            .extra_args
            .extend(self.emulator_args.iter().cloned());
        if let Some(dir) = &self.log_dir {
            settings.logging.directory = Some(dir.clone());
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match load_settings(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => return finish(&cli, &CliResult::from(e)),
    };
    if let Commands::Run(args) = &cli.command {
        args.apply(&mut settings);
    }

    let _guard = init_logging(&settings.logging, cli.verbose, cli.quiet);

    let result = match &cli.command {
        Commands::Run(args) => run_tests(&cli, settings, args).await,
        Commands::ListDevices { detailed } => list_devices(&cli, *detailed)
            .unwrap_or_else(|e| CliResult::error(ExitCodes::INTERNAL_ERROR, format!("{e:#}"))),
        Commands::ExitCodes => {
            print_exit_codes();
            CliResult::success()
        }
    };
    finish(&cli, &result)
}

fn finish(cli: &Cli, result: &CliResult) -> ExitCode {
    match result.message() {
        Some(message) if !result.is_success() => eprintln!("Error: {message}"),
        Some(message) if !cli.quiet => eprintln!("{message}"),
        _ => {}
    }
    result.to_exit_code()
}

fn load_settings(path: Option<&Path>) -> Result<RunSettings, ConfigError> {
    match path {
        Some(path) => RunSettings::load_from(path),
        None => RunSettings::load(),
    }
}

fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Option<WorkerGuard> {
    let level = match (quiet, verbose) {
        (true, _) => "error".to_string(),
        (false, 0) => settings.level.clone(),
        (false, 1) => "debug".to_string(),
        (false, _) => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard) = match &settings.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "nanotest.log");
            let (file, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(std::io::stderr.and(file)), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(settings.directory.is_none());
    if settings.json {
        builder.json().init();
    } else {
        builder.init();
    }
    guard
}

async fn run_tests(cli: &Cli, settings: RunSettings, args: &RunArgs) -> CliResult {
    if let Err(e) = settings.validate() {
        return e.into();
    }

    let tests = match ManifestDiscoverer::new(&args.tests).discover() {
        Ok(tests) => tests,
        Err(e) => return e.into(),
    };
    if tests.is_empty() {
        return CliResult::error(
            ExitCodes::INVALID_ARGS,
            format!("No tests listed in {}", args.tests.display()),
        );
    }

    let mut orchestrator = Orchestrator::new(settings.run_options(), Arc::new(TracingLogger));
    if let Some(output_file) = &args.simulate {
        let output = match std::fs::read_to_string(output_file) {
            Ok(output) => output,
            Err(e) => {
                return CliResult::error(
                    ExitCodes::FILE_NOT_FOUND,
                    format!("Failed to read {}: {e}", output_file.display()),
                )
            }
        };
        let port = settings
            .real_hardware_port
            .clone()
            .unwrap_or_else(|| "SIM0".to_string());
        let device: Arc<dyn DeviceSession> =
            Arc::new(SimulatedDevice::new(&port, DeviceScript::printing(output)));
        orchestrator =
            orchestrator.with_discovery(Arc::new(SimulatedDiscovery::with_devices(vec![device])));
    } else if settings.is_real_hardware {
        warn!("no device backend is linked into this binary; use --simulate for a dry run");
    }

    let cancel = orchestrator.cancel_token();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(error = %e, "failed to install Ctrl+C handler");
    }

    info!(tests = tests.len(), manifest = %args.tests.display(), "starting run");
    let started = Instant::now();
    let results = orchestrator.run(&tests).await;

    let reporter = Reporter::new(std::io::stdout(), cli.format, cli.verbose > 0);
    let summary = publish(&results, &reporter);
    info!(elapsed = ?started.elapsed(), %summary, "run finished");

    if no_device_found(&results) {
        return CliResult::error(ExitCodes::DEVICE_NOT_FOUND, NO_DEVICE_MESSAGE);
    }
    CliResult::from_summary(&summary, cancel.is_cancelled())
}

fn no_device_found(results: &[TestResult]) -> bool {
    results.iter().any(|r| {
        r.outcome == TestOutcome::Failed && r.error_message.as_deref() == Some(NO_DEVICE_MESSAGE)
    })
}

fn list_devices(cli: &Cli, detailed: bool) -> anyhow::Result<CliResult> {
    let ports = list_ports().context("listing serial ports")?;

    if ports.is_empty() {
        return Ok(CliResult::error(
            ExitCodes::DEVICE_NOT_FOUND,
            "No serial ports found.",
        ));
    }

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ports)?),
        OutputFormat::Text if detailed => {
            println!("Available Serial Ports:");
            println!("{:-<60}", "");
            for port in &ports {
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "  {:<20} {:<10} {:04x}:{:04x} {}",
                        port.port,
                        port.kind,
                        vid,
                        pid,
                        port.product.as_deref().unwrap_or("")
                    ),
                    _ => println!("  {:<20} {}", port.port, port.kind),
                }
            }
        }
        OutputFormat::Text => {
            for port in &ports {
                println!("{}", port.port);
            }
        }
    }
    Ok(CliResult::success())
}
