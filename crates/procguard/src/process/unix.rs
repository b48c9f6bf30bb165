//! POSIX process backend using `std::process` and real system calls.

use super::{ChildProcess, LaunchPlan, NativeExit, ProcessOps, StdioSet};
use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Real backend for POSIX systems.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcess;

impl UnixProcess {
    pub fn new() -> Self {
        Self
    }
}

fn stdio_or_inherit(file: Option<std::fs::File>) -> Stdio {
    file.map_or_else(Stdio::inherit, Stdio::from)
}

fn native_exit(status: ExitStatus) -> NativeExit {
    match (status.code(), status.signal()) {
        (Some(code), _) => NativeExit::Code(code as u32),
        (None, Some(signal)) => NativeExit::Signaled(signal),
        // Stopped or continued; not produced by a plain wait.
        (None, None) => NativeExit::Code(1),
    }
}

impl ProcessOps for UnixProcess {
    fn spawn(&self, plan: &LaunchPlan<'_>, stdio: StdioSet) -> io::Result<Box<dyn ChildProcess>> {
        let mut cmd = Command::new(plan.program);
        if let Some((argv0, rest)) = plan.argv.split_first() {
            cmd.arg0(argv0).args(rest);
        }

        if let Some(env) = &plan.env {
            cmd.env_clear();
            for (key, value) in env.entries() {
                cmd.env(OsStr::from_bytes(key), OsStr::from_bytes(value));
            }
        }

        // The files move into `cmd` and close when it drops at the end of
        // this call, spawn success or not. The child keeps its own copies.
        cmd.stdin(stdio_or_inherit(stdio.stdin))
            .stdout(stdio_or_inherit(stdio.stdout))
            .stderr(stdio_or_inherit(stdio.stderr));

        let child = cmd.spawn()?;
        log::debug!("spawned pid {}", child.id());
        Ok(Box::new(UnixChild { child }))
    }

    #[cfg(target_os = "linux")]
    fn apply_memory_limit(&self, child: &dyn ChildProcess, limit_mb: u64) -> io::Result<()> {
        let bytes = limit_mb.saturating_mul(1024 * 1024) as libc::rlim_t;
        let limit = libc::rlimit {
            rlim_cur: bytes,
            rlim_max: bytes,
        };
        let pid = libc::pid_t::try_from(child.pid())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        let rc = unsafe { libc::prlimit(pid, libc::RLIMIT_AS, &limit, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_memory_limit(&self, _child: &dyn ChildProcess, _limit_mb: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "per-process memory limits need prlimit",
        ))
    }
}

#[derive(Debug)]
struct UnixChild {
    child: Child,
}

impl ChildProcess for UnixChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn wait(&mut self) -> io::Result<NativeExit> {
        self.child.wait().map(native_exit)
    }

    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<NativeExit>> {
        Ok(self.child.wait_timeout(timeout)?.map(native_exit))
    }

    fn try_wait(&mut self) -> io::Result<Option<NativeExit>> {
        Ok(self.child.try_wait()?.map(native_exit))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn detach(self: Box<Self>) {
        let mut child = self.child;
        let pid = child.id();
        // Reap in the background so a detached child never lingers as a zombie.
        let reaper = std::thread::Builder::new()
            .name(format!("procguard-reap-{}", pid))
            .spawn(move || {
                if let Err(err) = child.wait() {
                    log::warn!("failed to reap detached pid {}: {}", pid, err);
                }
            });
        if let Err(err) = reaper {
            log::warn!("no reaper thread for pid {}: {}", pid, err);
        }
    }
}
