//! screenrec - Desktop capture supervisor
//!
//! Keeps exactly one ffmpeg capture process recording the desktop to
//! segmented files, restarts it on crashes, config edits and display
//! changes, and uploads or prunes finished segments in the background.

#![allow(dead_code)] // Parts of the core API are only used by tests

mod core;
mod platform;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use single_instance::SingleInstance;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::invocation::{build_invocation, CaptureBackend};
use crate::core::topology::TopologySource;
use crate::core::trigger::{
    spawn_topology_poller, watch_config_file, DEBOUNCE_WINDOW, TOPOLOGY_POLL_PERIOD,
};
use crate::core::{
    ExclusiveOpenProbe, Housekeeper, HttpUploader, Identity, LogNotifier, RecorderConfig,
    RestartTrigger, Supervisor, SupervisorOptions, SystemTopology, TriggerSource,
};

/// Application name constant
pub const APP_NAME: &str = "screenrec";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = APP_NAME, version, about = "Supervised desktop recording")]
struct Cli {
    /// Configuration file (default: recorder.ini next to the executable)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory for daily log files (default: Logs next to the config file)
    #[arg(long, value_name = "PATH")]
    log_dir: Option<PathBuf>,

    /// Debug-level logging regardless of the config file
    #[arg(long)]
    verbose: bool,

    /// Print the capture command line as JSON and exit
    #[arg(long)]
    print_invocation: bool,

    /// Do not restart on config file or display changes
    #[arg(long)]
    no_watch: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if cli.print_invocation {
        return print_invocation(&config_path);
    }

    let log_dir = cli
        .log_dir
        .clone()
        .unwrap_or_else(|| config_dir(&config_path).join("Logs"));
    let verbose = cli.verbose
        || RecorderConfig::load(&config_path)
            .map(|c| c.verbose)
            .unwrap_or(false);
    init_logging(&log_dir, verbose);

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    let identity = Identity::current();

    // One recorder per operating user
    let lock_name = format!("ScreenRecorder_{}", identity.username);
    let instance =
        SingleInstance::new(&lock_name).context("Failed to create single instance lock")?;
    if !instance.is_single() {
        info!("Another recorder is already running for {}", identity.username);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(cli, config_path, identity))?;

    info!("{} shutting down", APP_NAME);
    Ok(())
}

async fn run(cli: Cli, config_path: PathBuf, identity: Identity) -> Result<()> {
    let topology: Arc<dyn TopologySource> = Arc::new(SystemTopology);
    let uploader = HttpUploader::new().context("Failed to build upload client")?;
    let housekeeper = Housekeeper::new(Arc::new(ExclusiveOpenProbe), Arc::new(uploader));

    let supervisor = Supervisor::new(
        SupervisorOptions::new(&config_path),
        identity,
        topology.clone(),
        Arc::new(LogNotifier),
        housekeeper,
    );

    // Failures are already reported; triggers may still fix them
    let _ = supervisor.start().await;

    let (trigger, debounce) = RestartTrigger::spawn(Arc::new(supervisor.clone()), DEBOUNCE_WINDOW);

    let mut watcher = None;
    let mut poller = None;
    if cli.no_watch {
        info!("Config and display watching disabled");
    } else {
        match watch_config_file(&config_path, trigger.clone()) {
            Ok(w) => watcher = Some(w),
            Err(e) => warn!("Could not watch {}: {}", config_path.display(), e),
        }
        poller = Some(spawn_topology_poller(
            topology,
            trigger.clone(),
            TOPOLOGY_POLL_PERIOD,
        ));
    }

    wait_for_shutdown(&trigger).await?;
    info!("Shutdown requested");

    drop(watcher);
    if let Some(poller) = poller {
        poller.abort();
    }
    supervisor.shutdown().await;
    debounce.abort();
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM; SIGHUP asks for an immediate restart
#[cfg(unix)]
async fn wait_for_shutdown(trigger: &RestartTrigger) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                return Ok(());
            }
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => trigger.request_immediate(TriggerSource::Manual),
        }
    }
}

/// Resolve on Ctrl-C; Ctrl-Break asks for an immediate restart
#[cfg(windows)]
async fn wait_for_shutdown(trigger: &RestartTrigger) -> Result<()> {
    let mut ctrl_break =
        tokio::signal::windows::ctrl_break().context("Failed to listen for Ctrl-Break")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                return Ok(());
            }
            _ = ctrl_break.recv() => trigger.request_immediate(TriggerSource::Manual),
        }
    }
}

fn print_invocation(config_path: &Path) -> Result<()> {
    let config = RecorderConfig::load(config_path)?;
    let topology = SystemTopology.snapshot();
    let spec = build_invocation(
        &config,
        &topology,
        &Identity::current(),
        &CaptureBackend::native(),
    )?;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}

/// Initialize the logging system: stderr plus a daily file
fn init_logging(log_dir: &Path, verbose: bool) {
    let default_filter = if verbose {
        "screenrec=debug"
    } else {
        "screenrec=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (file_layer, file_error) = match open_log_file(log_dir) {
        Ok(file) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        warn!("File logging disabled: {:#}", e);
    }
}

fn open_log_file(log_dir: &Path) -> Result<std::fs::File> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create {}", log_dir.display()))?;
    let path = log_dir.join(format!("{}.log", Local::now().format("%d%m%Y")));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("recorder.ini")))
        .unwrap_or_else(|| PathBuf::from("recorder.ini"))
}

fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
