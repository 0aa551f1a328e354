//! OS-level resource group isolation (§4.4).
//!
//! On Unix this is a process group plus, where available, a cgroup v2
//! scope; on Windows it is a kernel Job Object created with
//! `JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE`. Either way the group guarantees
//! the child's entire process tree is terminated when the group handle is
//! closed, and all native handles live behind one RAII wrapper so they are
//! released on every control path, including panic unwind (§4.4, §9).

use crate::config::ServerConfig;
use crate::error::ProcessError;

/// Resource caps applied to a resource group (§3 `ResourceLimits`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
    pub memory_mb: Option<u64>,
    pub cpu_millicores: Option<u32>,
}

impl ResourceLimits {
    pub fn from_config(config: &ServerConfig) -> ResourceLimits {
        ResourceLimits {
            memory_mb: config.memory_limit_mb,
            cpu_millicores: config
                .cpu_limit_percent
                .map(|pct| (pct as u32).saturating_mul(10)),
        }
    }
}

/// Owns the native isolation handle for one child process. `assign` MUST be
/// called before the child is allowed to create any children of its own
/// (§4.4): callers spawn with stdio piped and call `assign` immediately
/// with the freshly returned PID, before resuming/reading from the child.
pub struct ResourceGroup {
    #[cfg(unix)]
    inner: unix::UnixGroup,
    #[cfg(windows)]
    inner: windows::JobGroup,
}

impl ResourceGroup {
    pub fn create(limits: ResourceLimits) -> Result<ResourceGroup, ProcessError> {
        #[cfg(unix)]
        {
            Ok(ResourceGroup {
                inner: unix::UnixGroup::create(limits)?,
            })
        }
        #[cfg(windows)]
        {
            Ok(ResourceGroup {
                inner: windows::JobGroup::create(limits)?,
            })
        }
        #[cfg(not(any(unix, windows)))]
        {
            let _ = limits;
            Err(ProcessError::IsolationAssignFailed(
                "no isolation primitive available on this platform".into(),
            ))
        }
    }

    /// Bind the child to this group. Must happen before the child can fork.
    pub fn assign(&self, pid: u32) -> Result<(), ProcessError> {
        #[cfg(unix)]
        {
            self.inner.assign(pid)
        }
        #[cfg(windows)]
        {
            self.inner.assign(pid)
        }
        #[cfg(not(any(unix, windows)))]
        {
            let _ = pid;
            Ok(())
        }
    }

    /// Terminate every process still alive in the group.
    pub fn kill_all(&self) {
        #[cfg(unix)]
        {
            self.inner.kill_all();
        }
        #[cfg(windows)]
        {
            self.inner.kill_all();
        }
    }

    /// Ask every process in the group to terminate, giving it a chance to
    /// catch the signal and flush state before the graceful window elapses.
    /// On Windows, Job Objects have no catchable-signal equivalent; this is
    /// a no-op there and `kill_all` is the only termination primitive.
    pub fn terminate_group(&self) {
        #[cfg(unix)]
        {
            self.inner.terminate_group();
        }
        #[cfg(windows)]
        {
            let _ = &self.inner;
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    /// A process group, plus an optional cgroup v2 scope when the host
    /// supports delegated cgroups (§4.4 "on platforms without such
    /// primitives... still guarantee process-tree termination"). The
    /// process group alone already guarantees that: the cgroup is strictly
    /// an added resource-cap mechanism.
    pub struct UnixGroup {
        pgid: std::sync::Mutex<Option<i32>>,
        cgroup_path: Option<PathBuf>,
        limits: ResourceLimits,
    }

    impl UnixGroup {
        pub fn create(limits: ResourceLimits) -> Result<UnixGroup, ProcessError> {
            let cgroup_path = try_create_cgroup_scope(&limits);
            Ok(UnixGroup {
                pgid: std::sync::Mutex::new(None),
                cgroup_path,
                limits,
            })
        }

        pub fn assign(&self, pid: u32) -> Result<(), ProcessError> {
            // The child already called `process_group(0)` at spawn time
            // (tokio::process::Command), which makes it its own process
            // group leader with pgid == pid; record it for kill_all.
            *self.pgid.lock().unwrap() = Some(pid as i32);

            if let Some(cgroup_path) = &self.cgroup_path {
                let procs_file = cgroup_path.join("cgroup.procs");
                if let Err(e) = fs::write(&procs_file, pid.to_string()) {
                    return Err(ProcessError::IsolationAssignFailed(format!(
                        "failed to write {}: {e}",
                        procs_file.display()
                    )));
                }
            }
            Ok(())
        }

        pub fn kill_all(&self) {
            if let Some(pgid) = *self.pgid.lock().unwrap() {
                // SAFETY: signalling our own child's process group with a
                // plain kill(2) call; no pointers are dereferenced.
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
        }

        pub fn terminate_group(&self) {
            if let Some(pgid) = *self.pgid.lock().unwrap() {
                // SAFETY: same as `kill_all`, just a catchable signal.
                unsafe {
                    libc::kill(-pgid, libc::SIGTERM);
                }
            }
        }
    }

    impl Drop for UnixGroup {
        fn drop(&mut self) {
            if let Some(path) = &self.cgroup_path {
                let _ = fs::remove_dir(path);
            }
        }
    }

    fn try_create_cgroup_scope(limits: &ResourceLimits) -> Option<PathBuf> {
        let root = PathBuf::from("/sys/fs/cgroup");
        if !root.join("cgroup.controllers").exists() {
            return None;
        }
        let scope = root.join(format!("supervisor-{}", fastrand_u64()));
        fs::create_dir(&scope).ok()?;

        if let Some(mem) = limits.memory_mb {
            let _ = fs::write(scope.join("memory.max"), (mem * 1024 * 1024).to_string());
        }
        if let Some(millicores) = limits.cpu_millicores {
            // cgroup v2 cpu.max is "<quota> <period>"; scale millicores
            // (1000 == one full core) against a 100ms period.
            let period = 100_000u64;
            let quota = (millicores as u64 * period) / 1000;
            let _ = fs::write(scope.join("cpu.max"), format!("{quota} {period}"));
        }

        Some(scope)
    }

    fn fastrand_u64() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            ^ (std::process::id() as u64)
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::ptr;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JOB_OBJECT_LIMIT_PROCESS_MEMORY,
    };
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE};

    pub struct JobGroup {
        handle: HANDLE,
    }

    // SAFETY: the raw HANDLE is only ever touched through this type's
    // methods, each of which is a single well-defined Win32 call.
    unsafe impl Send for JobGroup {}
    unsafe impl Sync for JobGroup {}

    impl JobGroup {
        pub fn create(limits: ResourceLimits) -> Result<JobGroup, ProcessError> {
            let handle = unsafe { CreateJobObjectW(ptr::null(), ptr::null()) };
            if handle.is_null() {
                return Err(ProcessError::IsolationAssignFailed(
                    "CreateJobObjectW failed".into(),
                ));
            }

            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            if let Some(mem_mb) = limits.memory_mb {
                info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
                info.ProcessMemoryLimit = (mem_mb as usize) * 1024 * 1024;
            }

            let ok = unsafe {
                SetInformationJobObject(
                    handle,
                    JobObjectExtendedLimitInformation,
                    &info as *const _ as *const _,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                )
            };
            if ok == 0 {
                unsafe { CloseHandle(handle) };
                return Err(ProcessError::IsolationAssignFailed(
                    "SetInformationJobObject failed".into(),
                ));
            }

            Ok(JobGroup { handle })
        }

        pub fn assign(&self, pid: u32) -> Result<(), ProcessError> {
            let process = unsafe { OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, 0, pid) };
            if process.is_null() {
                return Err(ProcessError::IsolationAssignFailed(format!(
                    "OpenProcess failed for pid {pid}"
                )));
            }
            let ok = unsafe { AssignProcessToJobObject(self.handle, process) };
            unsafe { CloseHandle(process) };
            if ok == 0 {
                return Err(ProcessError::IsolationAssignFailed(
                    "AssignProcessToJobObject failed".into(),
                ));
            }
            Ok(())
        }

        pub fn kill_all(&self) {
            // Closing the job handle with KILL_ON_JOB_CLOSE set terminates
            // every process still assigned to it; dropping does that.
        }
    }

    impl Drop for JobGroup {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }
}
