//! Capture supervisor - owns the lifecycle of the capture process
//!
//! All process state sits behind one async gate. Timers are named tasks that
//! only wait; when one fires it spawns the real work, so cancelling a timer
//! never interrupts a start or stop half way.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::capture::{ExitCallback, ProcessExit, RunningCapture, StopReport, StopTimings};
use super::config::{ConfigError, RecorderConfig};
use super::housekeeping::{Housekeeper, SweepReport, HOUSEKEEPING_PERIOD};
use super::identity::Identity;
use super::invocation::{build_invocation, CaptureBackend, InvocationError};
use super::notifier::Notifier;
use super::topology::TopologySource;
use super::trigger::{RestartTarget, TriggerSource};

/// Retry delay used when no configuration could be loaded
const FALLBACK_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("Capture executable not found: {}", .0.display())]
    MissingExecutable(PathBuf),

    #[error("Failed to create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch capture process: {0}")]
    Launch(#[source] std::io::Error),

    #[error("Supervisor has been shut down")]
    ShutDown,
}

impl SupervisorError {
    /// Structural failures need operator action and are not retried
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::OutputDir { .. } | Self::Launch(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// A restart is underway; `pending` while its delay timer is armed
    Restarting { pending: bool },
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub config_path: PathBuf,
    pub backend: CaptureBackend,
    pub stop_timings: StopTimings,
    pub housekeeping_period: Duration,
    /// Route process exits to the supervisor. When off, only the liveness
    /// guard notices a capture that died.
    pub report_exits: bool,
}

impl SupervisorOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            backend: CaptureBackend::native(),
            stop_timings: StopTimings::default(),
            housekeeping_period: HOUSEKEEPING_PERIOD,
            report_exits: true,
        }
    }
}

/// Everything guarded by the gate
#[derive(Default)]
struct Session {
    capture: Option<RunningCapture>,
    config: Option<Arc<RecorderConfig>>,
    /// Directory the housekeeping sweep works on
    output_dir: Option<PathBuf>,
}

impl Session {
    fn retry_delay(&self) -> Duration {
        self.config
            .as_ref()
            .map(|c| c.retry_delay)
            .unwrap_or(FALLBACK_RETRY_DELAY)
    }
}

#[derive(Default)]
struct Timers {
    guard: Option<JoinHandle<()>>,
    restart: Option<JoinHandle<()>>,
    housekeeping: Option<JoinHandle<()>>,
}

impl Timers {
    fn restart_pending(&self) -> bool {
        self.restart.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn cancel_all(&mut self) {
        abort(&mut self.guard);
        abort(&mut self.restart);
        abort(&mut self.housekeeping);
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

/// Clears the restart-in-progress flag when the restart ends
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    options: SupervisorOptions,
    identity: Identity,
    topology: Arc<dyn TopologySource>,
    notifier: Arc<dyn Notifier>,
    housekeeper: Housekeeper,

    gate: tokio::sync::Mutex<Session>,
    restarting: AtomicBool,
    shut_down: AtomicBool,
    generation: AtomicU64,
    timers: Mutex<Timers>,
    state: watch::Sender<SupervisorState>,
}

/// Cheap to clone; all clones drive the same capture process
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        options: SupervisorOptions,
        identity: Identity,
        topology: Arc<dyn TopologySource>,
        notifier: Arc<dyn Notifier>,
        housekeeper: Housekeeper,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            inner: Arc::new(Inner {
                options,
                identity,
                topology,
                notifier,
                housekeeper,
                gate: tokio::sync::Mutex::new(Session::default()),
                restarting: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                timers: Mutex::new(Timers::default()),
                state,
            }),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    /// Number of capture processes launched so far
    pub fn runs_started(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Pid of the current capture process, if one is running
    pub async fn current_pid(&self) -> Option<u32> {
        let session = self.inner.gate.lock().await;
        session
            .capture
            .as_ref()
            .filter(|c| !c.has_exited())
            .map(|c| c.pid())
    }

    /// Directory the housekeeping sweep currently works on
    pub async fn active_output_dir(&self) -> Option<PathBuf> {
        self.inner.gate.lock().await.output_dir.clone()
    }

    /// Start capturing unless a capture is already running
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut session = self.inner.gate.lock().await;
        if session.capture.as_ref().is_some_and(|c| !c.has_exited()) {
            debug!("Capture already running");
            return Ok(());
        }
        abort(&mut self.timers().restart);
        self.start_locked(&mut session).await
    }

    /// Stop the current capture, reload everything and start again.
    ///
    /// Returns `Ok(false)` without doing anything when another restart is
    /// already executing.
    pub async fn reconfigure(&self) -> Result<bool, SupervisorError> {
        if self.is_shut_down() {
            return Err(SupervisorError::ShutDown);
        }
        if self.inner.restarting.swap(true, Ordering::SeqCst) {
            debug!("Restart already in progress, ignoring request");
            return Ok(false);
        }
        let _busy = BusyGuard(&self.inner.restarting);

        abort(&mut self.timers().restart);
        self.set_state(SupervisorState::Restarting { pending: false });

        let mut session = self.inner.gate.lock().await;
        self.stop_locked(&mut session).await;
        self.start_locked(&mut session).await.map(|()| true)
    }

    /// Stop capturing and stay idle until the next start or trigger
    pub async fn stop(&self) -> Option<StopReport> {
        abort(&mut self.timers().restart);
        let mut session = self.inner.gate.lock().await;
        let report = self.stop_locked(&mut session).await;
        abort(&mut self.timers().housekeeping);
        self.set_state(SupervisorState::Idle);
        self.inner.notifier.status("idle");
        report
    }

    /// Cancel every timer and stop the capture for good. Idempotent.
    pub async fn shutdown(&self) -> Option<StopReport> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Supervisor already shut down");
            return None;
        }
        info!("Shutting down capture supervisor");

        self.timers().cancel_all();
        let mut session = self.inner.gate.lock().await;
        let report = self.stop_locked(&mut session).await;
        // A start that held the gate before we did may have armed new timers
        self.timers().cancel_all();
        session.output_dir = None;

        self.set_state(SupervisorState::Idle);
        self.inner.notifier.status("idle");
        report
    }

    /// Run one housekeeping pass over the active output directory now
    pub async fn run_housekeeping(&self) -> Option<SweepReport> {
        let (config, dir) = {
            let session = self.inner.gate.lock().await;
            (session.config.clone()?, session.output_dir.clone()?)
        };
        Some(self.inner.housekeeper.sweep(&config, &dir).await)
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!("Supervisor state {:?} -> {:?}", previous, state);
        }
    }

    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    async fn start_locked(&self, session: &mut Session) -> Result<(), SupervisorError> {
        if self.is_shut_down() {
            return Err(SupervisorError::ShutDown);
        }
        self.set_state(SupervisorState::Starting);

        match self.launch(session) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.start_failed(session, &e);
                Err(e)
            }
        }
    }

    fn launch(&self, session: &mut Session) -> Result<(), SupervisorError> {
        let config = Arc::new(RecorderConfig::load(&self.inner.options.config_path)?);
        session.config = Some(config.clone());

        let topology = self.inner.topology.snapshot();
        let spec = build_invocation(
            &config,
            &topology,
            &self.inner.identity,
            &self.inner.options.backend,
        )?;

        spec.prepare_output_dir()
            .map_err(|source| SupervisorError::OutputDir {
                path: spec.output_dir.clone(),
                source,
            })?;
        session.output_dir = Some(spec.output_dir.clone());

        info!(
            "Starting capture of {} monitor(s) into {}",
            topology.len(),
            spec.output_dir.display()
        );
        debug!("Capture command: {}", spec.display_command());

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let on_exit: ExitCallback = if self.inner.options.report_exits {
            self.exit_callback()
        } else {
            Box::new(|_| {})
        };
        let capture = RunningCapture::launch(&spec, generation, on_exit)?;
        session.capture = Some(capture);

        self.set_state(SupervisorState::Running);
        self.inner.notifier.status("recording");
        self.arm_guard(generation, config.guard_period());
        self.arm_housekeeping();
        Ok(())
    }

    fn start_failed(&self, session: &Session, error: &SupervisorError) {
        if error.is_structural() {
            abort(&mut self.timers().housekeeping);
            self.set_state(SupervisorState::Idle);
            self.inner
                .notifier
                .error(&format!("Recording not started: {}", error));
            return;
        }

        let delay = session.retry_delay();
        self.inner.notifier.warning(&format!(
            "Recording failed to start, retrying in {}s: {}",
            delay.as_secs(),
            error
        ));
        self.schedule_restart(delay);
    }

    async fn stop_locked(&self, session: &mut Session) -> Option<StopReport> {
        abort(&mut self.timers().guard);
        let capture = session.capture.take()?;

        self.set_state(SupervisorState::Stopping);
        let report = capture.stop(&self.inner.options.stop_timings).await;
        if !report.exited {
            self.inner.notifier.warning(&format!(
                "Capture process {} could not be confirmed stopped",
                report.pid
            ));
        }
        Some(report)
    }

    fn exit_callback(&self) -> ExitCallback {
        let weak = self.weak();
        Box::new(move |exit| {
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    Supervisor { inner }.on_process_exit(exit).await;
                }
            });
        })
    }

    async fn on_process_exit(&self, exit: ProcessExit) {
        let mut session = self.inner.gate.lock().await;
        let current = session.capture.as_ref().map(|c| c.generation());
        if current != Some(exit.generation) {
            debug!("Exit of run {} was expected", exit.generation);
            return;
        }

        warn!(
            "Capture process {} exited unexpectedly (code {:?})",
            exit.pid, exit.code
        );
        self.abandon_dead_capture(&mut session).await;
    }

    async fn check_liveness(&self, generation: u64) {
        let mut session = self.inner.gate.lock().await;
        let Some(capture) = session.capture.as_ref() else {
            return;
        };
        if capture.generation() != generation || capture.is_alive() {
            return;
        }

        warn!("Liveness check found capture process {} gone", capture.pid());
        self.abandon_dead_capture(&mut session).await;
    }

    /// Release a capture that died on its own and retry after the delay
    async fn abandon_dead_capture(&self, session: &mut Session) {
        abort(&mut self.timers().guard);
        if let Some(capture) = session.capture.take() {
            capture.stop(&self.inner.options.stop_timings).await;
        }

        let delay = session.retry_delay();
        self.inner.notifier.warning(&format!(
            "Recording stopped unexpectedly, restarting in {}s",
            delay.as_secs()
        ));
        self.schedule_restart(delay);
    }

    fn schedule_restart(&self, delay: Duration) {
        if self.is_shut_down() {
            return;
        }

        let mut timers = self.timers();
        if timers.restart_pending() {
            debug!("Delayed restart already pending");
            return;
        }

        let weak = self.weak();
        timers.restart = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(Supervisor { inner }.delayed_restart());
            }
        }));
        drop(timers);

        self.set_state(SupervisorState::Restarting { pending: true });
        info!("Restart scheduled in {}s", delay.as_secs());
    }

    async fn delayed_restart(self) {
        match self.reconfigure().await {
            Ok(true) => info!("Delayed restart completed"),
            Ok(false) => debug!("Delayed restart skipped, another restart is running"),
            Err(e) => debug!("Delayed restart failed: {}", e),
        }
    }

    fn arm_guard(&self, generation: u64, period: Duration) {
        let weak = self.weak();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    Supervisor { inner }.check_liveness(generation).await;
                });
            }
        });

        let mut timers = self.timers();
        abort(&mut timers.guard);
        timers.guard = Some(handle);
    }

    fn arm_housekeeping(&self) {
        let mut timers = self.timers();
        if timers
            .housekeeping
            .as_ref()
            .is_some_and(|h| !h.is_finished())
        {
            return;
        }

        let period = self.inner.options.housekeeping_period;
        let weak = self.weak();
        timers.housekeeping = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Supervisor { inner }.run_housekeeping().await;
            }
        }));
    }
}

#[async_trait]
impl RestartTarget for Supervisor {
    async fn restart_requested(&self, source: TriggerSource) {
        info!("Restart requested ({})", source);
        match self.reconfigure().await {
            Ok(true) => {}
            Ok(false) => debug!("Restart request from {} coalesced", source),
            Err(e) => debug!("Restart from {} failed: {}", source, e),
        }
    }
}
