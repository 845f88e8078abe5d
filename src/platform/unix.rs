//! Unix process groups, display enumeration and file probing

use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command as StdCommand;

use tokio::process::Command;
use tracing::{debug, warn};

use super::{Assignment, GroupError, ProcessGroup};
use crate::core::topology::Monitor;

/// POSIX process group led by the capture process.
///
/// The child is spawned as the leader of a new group, so signalling the
/// negative pid reaches every descendant that did not move itself out.
/// On Linux the child also receives `SIGKILL` when the supervisor dies.
#[derive(Debug, Default)]
pub struct PosixGroup {
    pgid: Option<libc::pid_t>,
}

impl PosixGroup {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessGroup for PosixGroup {
    fn prepare(&self, command: &mut Command) {
        command.process_group(0);

        #[cfg(target_os = "linux")]
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    fn assign(&mut self, pid: u32) -> Result<Assignment, GroupError> {
        let pid = pid as libc::pid_t;
        let pgid = unsafe { libc::getpgid(pid) };
        if pgid == -1 {
            return Err(GroupError::Assign {
                pid: pid as u32,
                source: std::io::Error::last_os_error(),
            });
        }

        if pgid == pid {
            self.pgid = Some(pgid);
            Ok(Assignment::Assigned)
        } else {
            debug!("PID {} is in process group {}, not its own", pid, pgid);
            Ok(Assignment::AlreadyGrouped)
        }
    }

    fn terminate_all(&mut self) -> Result<(), GroupError> {
        let Some(pgid) = self.pgid.take() else {
            return Ok(());
        };

        let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if result == 0 {
            debug!("Sent SIGKILL to process group {}", pgid);
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Group already empty
            Ok(())
        } else {
            Err(GroupError::Terminate(err))
        }
    }
}

impl Drop for PosixGroup {
    fn drop(&mut self) {
        if let Err(e) = self.terminate_all() {
            warn!("Failed to terminate process group on drop: {}", e);
        }
    }
}

/// Session id of the current process
pub fn session_id() -> Option<u32> {
    let sid = unsafe { libc::getsid(0) };
    u32::try_from(sid).ok()
}

/// Take a non-blocking exclusive `flock`; dropping the file releases it
pub fn try_exclusive_lock(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

/// Monitors reported by `xrandr --listmonitors`
pub fn enumerate_monitors() -> Vec<Monitor> {
    match StdCommand::new("xrandr").arg("--listmonitors").output() {
        Ok(output) if output.status.success() => {
            parse_xrandr_monitors(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            warn!("xrandr exited with {}", output.status);
            Vec::new()
        }
        Err(e) => {
            warn!("Failed to run xrandr: {}", e);
            Vec::new()
        }
    }
}

/// Parse lines like ` 0: +*DP-1 1920/527x1080/296+0+0  DP-1`
pub fn parse_xrandr_monitors(output: &str) -> Vec<Monitor> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with(|c: char| c.is_ascii_digit()))
        .filter_map(|line| line.split_whitespace().find_map(parse_geometry))
        .collect()
}

/// `W/mmxH/mm+X+Y` or `WxH+X+Y`
fn parse_geometry(token: &str) -> Option<Monitor> {
    let (size, offsets) = token.split_once('+')?;
    let (w, h) = size.split_once('x')?;
    let width = w.split('/').next()?.parse().ok()?;
    let height = h.split('/').next()?.parse().ok()?;

    // Offsets may be negative: "+-1280+0" or "+0+-200"
    let (x, y) = offsets.split_once('+')?;
    Some(Monitor::new(x.parse().ok()?, y.parse().ok()?, width, height))
}

/// Process checks for tests that must see through zombies left under a
/// PID 1 that never reaps
#[cfg(all(test, target_os = "linux"))]
pub(crate) mod testing {
    use std::path::Path;
    use std::time::Duration;

    /// Running or sleeping, not a zombie and not reaped
    pub(crate) fn is_live(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        // The state letter follows the parenthesised command name
        match stat.rsplit_once(')') {
            Some((_, rest)) => !matches!(rest.trim_start().chars().next(), Some('Z' | 'X')),
            None => false,
        }
    }

    /// Wait until `pid` is no longer live
    pub(crate) async fn wait_gone(pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while is_live(pid) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Wait for a script to write a pid into `path`
    pub(crate) async fn read_pid_file(path: &Path) -> u32 {
        for _ in 0..250 {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }
}
