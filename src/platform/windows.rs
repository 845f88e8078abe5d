//! Windows job objects, display enumeration and file probing

use std::mem;
use std::os::windows::fs::OpenOptionsExt;
use std::path::Path;

use tokio::process::Command;
use tracing::{debug, warn};

use windows::Win32::Foundation::{
    CloseHandle, BOOL, ERROR_ACCESS_DENIED, FALSE, HANDLE, LPARAM, RECT, TRUE,
};
use windows::Win32::Graphics::Gdi::{EnumDisplayMonitors, HDC, HMONITOR};
use windows::Win32::System::JobObjects::*;
use windows::Win32::System::RemoteDesktop::ProcessIdToSessionId;
use windows::Win32::System::Threading::*;

use super::{Assignment, GroupError, ProcessGroup};
use crate::core::topology::Monitor;

const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Job object configured to kill every member when its last handle closes.
/// The handle is stored as usize so the struct stays Send + Sync.
#[derive(Debug)]
pub struct JobObject {
    handle: Option<usize>,
}

impl JobObject {
    pub fn create() -> Result<Self, GroupError> {
        unsafe {
            let job = CreateJobObjectW(None, None)
                .map_err(|e| GroupError::Create(std::io::Error::from(e)))?;

            let mut limit_info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
            limit_info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

            if let Err(e) = SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &limit_info as *const _ as *const _,
                mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            ) {
                let _ = CloseHandle(job);
                return Err(GroupError::Create(std::io::Error::from(e)));
            }

            Ok(Self {
                handle: Some(job.0 as usize),
            })
        }
    }

    fn raw(&self) -> Option<HANDLE> {
        self.handle
            .map(|value| HANDLE(value as *mut std::ffi::c_void))
    }
}

impl ProcessGroup for JobObject {
    fn prepare(&self, command: &mut Command) {
        command.creation_flags(CREATE_NO_WINDOW);
    }

    fn assign(&mut self, pid: u32) -> Result<Assignment, GroupError> {
        let Some(job) = self.raw() else {
            return Err(GroupError::Assign {
                pid,
                source: std::io::Error::other("job object already closed"),
            });
        };

        unsafe {
            let process = OpenProcess(
                PROCESS_SET_QUOTA | PROCESS_TERMINATE | PROCESS_QUERY_LIMITED_INFORMATION,
                FALSE,
                pid,
            )
            .map_err(|e| GroupError::Assign {
                pid,
                source: std::io::Error::from(e),
            })?;

            let mut in_job = BOOL::default();
            let already_grouped = IsProcessInJob(process, HANDLE::default(), &mut in_job).is_ok()
                && in_job.as_bool();

            let result = if already_grouped {
                debug!("PID {} already belongs to a job object", pid);
                Ok(Assignment::AlreadyGrouped)
            } else {
                match AssignProcessToJobObject(job, process) {
                    Ok(()) => Ok(Assignment::Assigned),
                    Err(e) if e.code() == ERROR_ACCESS_DENIED.to_hresult() => {
                        debug!("Job assignment denied for PID {}", pid);
                        Ok(Assignment::AlreadyGrouped)
                    }
                    Err(e) => Err(GroupError::Assign {
                        pid,
                        source: std::io::Error::from(e),
                    }),
                }
            };

            let _ = CloseHandle(process);
            result
        }
    }

    fn terminate_all(&mut self) -> Result<(), GroupError> {
        let Some(job) = self.raw() else {
            return Ok(());
        };
        self.handle = None;

        unsafe {
            let terminated = TerminateJobObject(job, 1);
            let _ = CloseHandle(job);
            terminated.map_err(|e| GroupError::Terminate(std::io::Error::from(e)))
        }
    }
}

impl Drop for JobObject {
    fn drop(&mut self) {
        if let Err(e) = self.terminate_all() {
            warn!("Failed to terminate job object on drop: {}", e);
        }
    }
}

/// `taskkill /PID <pid> /T /F` without a console window
pub fn taskkill_command(pid: u32) -> Command {
    let mut command = Command::new("taskkill");
    command
        .arg("/PID")
        .arg(pid.to_string())
        .arg("/T")
        .arg("/F")
        .creation_flags(CREATE_NO_WINDOW);
    command
}

/// Terminal-services session of the current process
pub fn session_id() -> Option<u32> {
    let mut session = 0u32;
    unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session) }
        .ok()
        .map(|_| session)
}

/// Open with no sharing; fails while any other handle is open
pub fn open_exclusive(path: &Path) -> bool {
    std::fs::OpenOptions::new()
        .read(true)
        .share_mode(0)
        .open(path)
        .is_ok()
}

/// Monitor rectangles in virtual-screen coordinates
pub fn enumerate_monitors() -> Vec<Monitor> {
    let mut monitors: Vec<Monitor> = Vec::new();

    unsafe extern "system" fn enum_callback(
        _monitor: HMONITOR,
        _hdc: HDC,
        rect: *mut RECT,
        lparam: LPARAM,
    ) -> BOOL {
        let monitors = &mut *(lparam.0 as *mut Vec<Monitor>);
        if let Some(rect) = rect.as_ref() {
            let width = (rect.right - rect.left).max(0) as u32;
            let height = (rect.bottom - rect.top).max(0) as u32;
            monitors.push(Monitor::new(rect.left, rect.top, width, height));
        }
        TRUE
    }

    let ok = unsafe {
        EnumDisplayMonitors(
            HDC::default(),
            None,
            Some(enum_callback),
            LPARAM(&mut monitors as *mut Vec<Monitor> as isize),
        )
    };
    if !ok.as_bool() {
        warn!("EnumDisplayMonitors failed");
    }

    monitors
}
