//! Platform-specific implementations for Windows and Unix

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub mod unix;

use std::path::Path;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::topology::Monitor;

/// Errors from the process group capability
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("Failed to create process group: {0}")]
    Create(#[source] std::io::Error),

    #[error("Failed to assign process {pid} to group: {source}")]
    Assign {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to terminate process group: {0}")]
    Terminate(#[source] std::io::Error),

    #[error("Process groups are not supported on this platform")]
    Unsupported,
}

/// Result of placing a process into a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// The group now owns the process and its descendants
    Assigned,
    /// The process already belongs to another group; only the direct
    /// process handle can be used to terminate it
    AlreadyGrouped,
}

/// A scoped kill group. Terminating the group ends every process inside it,
/// including descendants the owner never tracked.
pub trait ProcessGroup: Send + Sync {
    /// Configure a command before it is spawned
    fn prepare(&self, command: &mut Command);

    /// Add a running process to the group
    fn assign(&mut self, pid: u32) -> Result<Assignment, GroupError>;

    /// Terminate everything in the group. Idempotent.
    fn terminate_all(&mut self) -> Result<(), GroupError>;
}

/// Create a fresh kill group for one capture run
pub fn create_process_group() -> Result<Box<dyn ProcessGroup>, GroupError> {
    #[cfg(windows)]
    {
        Ok(Box::new(windows::JobObject::create()?))
    }
    #[cfg(unix)]
    {
        Ok(Box::new(unix::PosixGroup::new()))
    }
    #[cfg(not(any(windows, unix)))]
    {
        Err(GroupError::Unsupported)
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system.process(pid).is_some()
}

/// Force-kill a process tree with the operating system's own utility.
/// Returns whether the utility ran and reported success.
pub async fn force_kill_tree(pid: u32, timeout: Duration) -> std::io::Result<bool> {
    let mut command = force_kill_command(pid);
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status?;
            debug!("Force-kill utility for PID {} exited with {}", pid, status);
            Ok(status.success())
        }
        Err(_) => {
            warn!("Force-kill utility for PID {} timed out", pid);
            let _ = child.start_kill();
            Ok(false)
        }
    }
}

fn force_kill_command(pid: u32) -> Command {
    #[cfg(windows)]
    {
        windows::taskkill_command(pid)
    }
    #[cfg(not(windows))]
    {
        let mut command = Command::new("kill");
        command
            .arg("-s")
            .arg("KILL")
            .arg("--")
            .arg(format!("-{}", pid))
            .arg(pid.to_string());
        command
    }
}

/// Enumerate monitor rectangles in virtual-desktop coordinates
pub fn enumerate_monitors() -> Vec<Monitor> {
    #[cfg(windows)]
    {
        windows::enumerate_monitors()
    }
    #[cfg(unix)]
    {
        unix::enumerate_monitors()
    }
    #[cfg(not(any(windows, unix)))]
    {
        Vec::new()
    }
}

/// Operating-system session identifier of the current process
pub fn session_id() -> Option<u32> {
    #[cfg(windows)]
    {
        windows::session_id()
    }
    #[cfg(unix)]
    {
        unix::session_id()
    }
    #[cfg(not(any(windows, unix)))]
    {
        None
    }
}

/// True when no other process holds the file open for writing.
///
/// Windows enforces this through share modes. On Unix only cooperating
/// writers that take `flock` locks are detected.
pub fn is_file_released(path: &Path) -> bool {
    #[cfg(windows)]
    {
        windows::open_exclusive(path)
    }
    #[cfg(unix)]
    {
        unix::try_exclusive_lock(path)
    }
    #[cfg(not(any(windows, unix)))]
    {
        std::fs::File::open(path).is_ok()
    }
}
