//! Restart triggers - coalesces config edits, display changes and manual
//! requests into one debounced restart signal.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::topology::TopologySource;

/// Quiet period before a burst of requests turns into one restart
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Interval between display topology snapshots
pub const TOPOLOGY_POLL_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    ConfigFile,
    DisplayTopology,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigFile => write!(f, "config file change"),
            Self::DisplayTopology => write!(f, "display change"),
            Self::Manual => write!(f, "manual request"),
        }
    }
}

/// Whatever performs the restart
#[async_trait]
pub trait RestartTarget: Send + Sync + 'static {
    async fn restart_requested(&self, source: TriggerSource);
}

enum Request {
    Debounced(TriggerSource),
    Immediate(TriggerSource),
}

/// Handle for asking for a restart. Cheap to clone and usable from any
/// thread, including file watcher callbacks.
#[derive(Clone)]
pub struct RestartTrigger {
    tx: mpsc::UnboundedSender<Request>,
}

impl RestartTrigger {
    /// Spawn the debounce loop. It ends when every trigger handle is dropped.
    pub fn spawn(target: Arc<dyn RestartTarget>, window: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(debounce_loop(rx, target, window));
        (Self { tx }, handle)
    }

    /// Ask for a restart once the debounce window passes quietly
    pub fn request_restart(&self, source: TriggerSource) {
        if self.tx.send(Request::Debounced(source)).is_err() {
            debug!("Restart trigger closed, dropping {} request", source);
        }
    }

    /// Ask for a restart right away
    pub fn request_immediate(&self, source: TriggerSource) {
        if self.tx.send(Request::Immediate(source)).is_err() {
            debug!("Restart trigger closed, dropping {} request", source);
        }
    }
}

async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<Request>,
    target: Arc<dyn RestartTarget>,
    window: Duration,
) {
    let mut pending: Option<TriggerSource> = None;
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(Request::Debounced(source)) => {
                    pending = Some(source);
                    deadline.as_mut().reset(Instant::now() + window);
                }
                Some(Request::Immediate(source)) => {
                    pending = None;
                    fire(&target, source);
                }
                None => break,
            },
            () = &mut deadline, if pending.is_some() => {
                if let Some(source) = pending.take() {
                    fire(&target, source);
                }
            }
        }
    }
}

fn fire(target: &Arc<dyn RestartTarget>, source: TriggerSource) {
    let target = target.clone();
    tokio::spawn(async move { target.restart_requested(source).await });
}

/// Watch the config file's directory and request a restart whenever the
/// file itself is written, created or renamed into place
pub fn watch_config_file(
    path: &Path,
    trigger: RestartTrigger,
) -> notify::Result<RecommendedWatcher> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path.file_name().map(|n| n.to_os_string());

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if ours && is_relevant(&event.kind) {
                    debug!("Config file event: {:?}", event.kind);
                    trigger.request_restart(TriggerSource::ConfigFile);
                }
            }
            Err(e) => warn!("Config watcher error: {}", e),
        }
    })?;

    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!("Watching {} for changes", path.display());
    Ok(watcher)
}

fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

/// Poll the monitor layout and request a restart when it changes
pub fn spawn_topology_poller(
    source: Arc<dyn TopologySource>,
    trigger: RestartTrigger,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = source.snapshot();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let current = source.snapshot();
            if current != last {
                info!(
                    "Display layout changed ({} -> {} monitor(s))",
                    last.len(),
                    current.len()
                );
                last = current;
                trigger.request_restart(TriggerSource::DisplayTopology);
            }
        }
    })
}
