//! A running capture process and the escalating stop protocol

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::invocation::InvocationSpec;
use super::supervisor::SupervisorError;
use crate::platform::{self, Assignment, ProcessGroup};

/// Grace periods between escalation steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTimings {
    /// Wait after writing `q` to stdin
    pub quit_grace: Duration,
    /// Wait after terminating the process group
    pub group_grace: Duration,
    /// Wait after the OS force-kill utility, also its own timeout
    pub kill_utility_grace: Duration,
}

impl Default for StopTimings {
    fn default() -> Self {
        Self {
            quit_grace: Duration::from_millis(2000),
            group_grace: Duration::from_millis(1500),
            kill_utility_grace: Duration::from_millis(2000),
        }
    }
}

/// Steps of the stop protocol, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EscalationStage {
    GracefulQuit,
    GroupTerminate,
    KillUtility,
    DirectKill,
}

impl EscalationStage {
    pub const ALL: [EscalationStage; 4] = [
        Self::GracefulQuit,
        Self::GroupTerminate,
        Self::KillUtility,
        Self::DirectKill,
    ];
}

/// What a single step managed to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StepAction {
    Sent,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationStep {
    pub stage: EscalationStage,
    pub action: StepAction,
    /// Whether the process had exited by the end of this step's grace period
    pub exited: bool,
}

/// Outcome of stopping one capture run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub pid: u32,
    pub generation: u64,
    pub steps: Vec<EscalationStep>,
    pub exited: bool,
    pub exit_code: Option<i32>,
}

impl StopReport {
    /// True when the graceful quit alone was not enough
    pub fn escalated(&self) -> bool {
        self.steps.len() > 1
    }
}

/// Exit of a capture process as seen by its reaper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub generation: u64,
    pub code: Option<i32>,
}

/// Called once by the reaper when the process exits, for any reason
pub type ExitCallback = Box<dyn FnOnce(ProcessExit) + Send + 'static>;

enum Reaped {
    Exited(std::io::Result<std::process::ExitStatus>),
    KillRequested,
}

/// The live capture process.
///
/// The reaper task owns the OS child and publishes its exit on a watch
/// channel. Everything else talks to the process through that channel, the
/// kill request sender, stdin and the process group.
pub struct RunningCapture {
    pid: u32,
    generation: u64,

    stdin: Option<ChildStdin>,
    group: Option<Box<dyn ProcessGroup>>,
    grouped: bool,

    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_tx: Option<oneshot::Sender<()>>,
    reaper: Option<JoinHandle<()>>,
    drains: Vec<JoinHandle<()>>,
}

impl RunningCapture {
    /// Launch the capture process described by `spec`
    pub fn launch(
        spec: &InvocationSpec,
        generation: u64,
        on_exit: ExitCallback,
    ) -> Result<Self, SupervisorError> {
        if has_separator(&spec.program) && !spec.program.is_file() {
            return Err(SupervisorError::MissingExecutable(spec.program.clone()));
        }

        let mut group = match platform::create_process_group() {
            Ok(group) => Some(group),
            Err(e) => {
                warn!("Capture will run without a process group: {}", e);
                None
            }
        };

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(group) = &group {
            group.prepare(&mut command);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SupervisorError::MissingExecutable(spec.program.clone())
            } else {
                SupervisorError::Launch(e)
            }
        })?;

        let Some(pid) = child.id() else {
            return Err(SupervisorError::Launch(std::io::Error::other(
                "capture process exited before its pid was read",
            )));
        };

        let mut grouped = false;
        if let Some(g) = group.as_mut() {
            match g.assign(pid) {
                Ok(Assignment::Assigned) => grouped = true,
                Ok(Assignment::AlreadyGrouped) => {
                    warn!(
                        "Capture process {} is already grouped elsewhere; stopping will use its handle only",
                        pid
                    );
                }
                Err(e) => warn!("Could not group capture process {}: {}", pid, e),
            }
        }
        if !grouped {
            group = None;
        }

        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(tokio::spawn(drain_lines(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(tokio::spawn(drain_lines(stderr)));
        }
        let stdin = child.stdin.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let reaper = tokio::spawn(async move {
            let reaped = tokio::select! {
                status = child.wait() => Reaped::Exited(status),
                Ok(()) = &mut kill_rx => Reaped::KillRequested,
            };
            let status = match reaped {
                Reaped::Exited(status) => status,
                Reaped::KillRequested => {
                    if let Err(e) = child.start_kill() {
                        warn!("Direct kill of capture process {} failed: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for capture process {}: {}", pid, e);
                    None
                }
            };
            let exit = ProcessExit {
                pid,
                generation,
                code,
            };
            exit_tx.send_replace(Some(exit));
            on_exit(exit);
        });

        info!("Capture process {} started (run {})", pid, generation);

        Ok(Self {
            pid,
            generation,
            stdin,
            group,
            grouped,
            exit_rx,
            kill_tx: Some(kill_tx),
            reaper: Some(reaper),
            drains,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Exit not yet observed and the OS still lists the pid
    pub fn is_alive(&self) -> bool {
        !self.has_exited() && platform::is_process_running(self.pid)
    }

    /// Stop the process, escalating until it is gone
    pub async fn stop(mut self, timings: &StopTimings) -> StopReport {
        let mut steps = Vec::new();

        for stage in EscalationStage::ALL {
            if self.has_exited() {
                break;
            }
            let (action, grace) = match stage {
                EscalationStage::GracefulQuit => (self.send_quit().await, timings.quit_grace),
                EscalationStage::GroupTerminate => (self.terminate_group(), timings.group_grace),
                EscalationStage::KillUtility => (
                    self.run_kill_utility(timings.kill_utility_grace).await,
                    timings.kill_utility_grace,
                ),
                EscalationStage::DirectKill => (self.request_kill(), timings.kill_utility_grace),
            };
            let exited = self.wait_exit(grace).await;
            debug!(
                "Stop step {:?} for PID {}: {:?}, exited: {}",
                stage, self.pid, action, exited
            );
            steps.push(EscalationStep {
                stage,
                action,
                exited,
            });
        }

        // Descendants may outlive the leader
        if let Some(mut group) = self.group.take() {
            if let Err(e) = group.terminate_all() {
                debug!("Final group termination for PID {}: {}", self.pid, e);
            }
        }

        let exit = *self.exit_rx.borrow();
        let report = StopReport {
            pid: self.pid,
            generation: self.generation,
            steps,
            exited: exit.is_some(),
            exit_code: exit.and_then(|e| e.code),
        };

        if report.exited {
            self.join_drains().await;
            if report.escalated() {
                warn!(
                    "Capture process {} needed {} stop step(s)",
                    self.pid,
                    report.steps.len()
                );
            } else {
                info!("Capture process {} stopped", self.pid);
            }
        } else {
            warn!("Capture process {} did not exit after all stop steps", self.pid);
        }

        report
    }

    async fn send_quit(&mut self) -> StepAction {
        let Some(mut stdin) = self.stdin.take() else {
            return StepAction::Skipped("stdin not available".to_string());
        };
        let result = async {
            stdin.write_all(b"q\n").await?;
            stdin.flush().await
        }
        .await;
        match result {
            Ok(()) => StepAction::Sent,
            Err(e) => StepAction::Failed(e.to_string()),
        }
    }

    fn terminate_group(&mut self) -> StepAction {
        if !self.grouped {
            return StepAction::Skipped("process is not in our group".to_string());
        }
        match self.group.as_mut().map(|g| g.terminate_all()) {
            Some(Ok(())) => StepAction::Sent,
            Some(Err(e)) => StepAction::Failed(e.to_string()),
            None => StepAction::Skipped("group already released".to_string()),
        }
    }

    async fn run_kill_utility(&self, timeout: Duration) -> StepAction {
        match platform::force_kill_tree(self.pid, timeout).await {
            Ok(true) => StepAction::Sent,
            Ok(false) => StepAction::Failed("kill utility reported failure".to_string()),
            Err(e) => StepAction::Failed(e.to_string()),
        }
    }

    fn request_kill(&mut self) -> StepAction {
        match self.kill_tx.take() {
            Some(tx) => match tx.send(()) {
                Ok(()) => StepAction::Sent,
                Err(()) => StepAction::Failed("reaper is gone".to_string()),
            },
            None => StepAction::Skipped("kill already requested".to_string()),
        }
    }

    async fn wait_exit(&self, grace: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        let exited = matches!(
            tokio::time::timeout(grace, rx.wait_for(|exit| exit.is_some())).await,
            Ok(Ok(_))
        );
        exited
    }

    async fn join_drains(&mut self) {
        for drain in self.drains.drain(..) {
            let abort = drain.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), drain).await.is_err() {
                abort.abort();
            }
        }
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.await;
        }
    }
}

impl Drop for RunningCapture {
    fn drop(&mut self) {
        if !self.has_exited() {
            warn!("Dropping live capture process {}; forcing termination", self.pid);
            if let Some(tx) = self.kill_tx.take() {
                let _ = tx.send(());
            }
        }
        // The group's own Drop terminates whatever is left inside it
    }
}

async fn drain_lines<R>(reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    info!("[ffmpeg] {}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Capture output stream closed: {}", e);
                break;
            }
        }
    }
}

fn has_separator(path: &Path) -> bool {
    path.components().count() > 1 || path.is_absolute()
}
