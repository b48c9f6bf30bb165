use super::{ChildProcess, NativeExit, ProcessHandle};
use crate::error::{ProcessError, ProcessResult};
use std::time::Duration;

/// Fold a native 32-bit exit code into the caller-facing status.
///
/// * `0` is success.
/// * Codes whose top bits carry severity 2 or 3 with an empty facility
///   (`0x8000_xxxx`, `0xC000_xxxx`) come back as the same bits read as a
///   negative `i32`.
/// * Anything with a non-zero low byte is masked to 31 bits.
/// * Everything else becomes the generic failure `1`.
pub fn normalize_exit_code(code: u32) -> i32 {
    if code == 0 {
        0
    } else if code & 0xBFFF_0000 == 0x8000_0000 {
        code as i32
    } else if code & 0xFF != 0 {
        (code & 0x7FFF_FFFF) as i32
    } else {
        1
    }
}

fn signal_description(signal: i32) -> String {
    #[cfg(unix)]
    {
        match nix::sys::signal::Signal::try_from(signal) {
            Ok(sig) => format!("{} (signal {})", sig.as_str(), signal),
            Err(_) => format!("signal {}", signal),
        }
    }
    #[cfg(not(unix))]
    {
        format!("signal {}", signal)
    }
}

fn classify(pid: u32, exit: NativeExit) -> ProcessResult<i32> {
    match exit {
        NativeExit::Code(code) => {
            let status = normalize_exit_code(code);
            log::debug!("pid {} exited with {:#x} (status {})", pid, code, status);
            Ok(status)
        }
        NativeExit::Signaled(signal) => {
            let description = signal_description(signal);
            log::warn!("pid {} terminated by {}", pid, description);
            Err(ProcessError::Crashed {
                signal,
                description,
            })
        }
    }
}

/// Kill a child that outlived its timeout and collect it.
///
/// A kill that fails because the child exited on its own in the meantime is
/// not an error: the process is gone either way.
fn terminate(child: &mut dyn ChildProcess, pid: u32) -> ProcessResult<()> {
    if let Err(source) = child.kill() {
        return match child.try_wait() {
            Ok(Some(_)) => {
                log::debug!("pid {} exited before it could be terminated", pid);
                Ok(())
            }
            _ => Err(ProcessError::TerminateFailed { pid, source }),
        };
    }
    child
        .wait()
        .map(|_| ())
        .map_err(|source| ProcessError::WaitFailed { pid, source })
}

/// Wait for `handle` to finish.
///
/// `timeout_secs == 0` waits indefinitely. Otherwise a child still running
/// after the timeout is forcibly terminated and collected, and the result is
/// [`ProcessError::TimedOut`]. The handle is released on every path.
pub fn wait(handle: ProcessHandle, timeout_secs: u32) -> ProcessResult<i32> {
    let mut child = handle.into_child();
    let pid = child.pid();

    let exit = if timeout_secs > 0 {
        let timeout = Duration::from_secs(u64::from(timeout_secs));
        match child
            .wait_timeout(timeout)
            .map_err(|source| ProcessError::WaitFailed { pid, source })?
        {
            Some(exit) => exit,
            None => {
                log::warn!(
                    "pid {} still running after {}s; terminating",
                    pid,
                    timeout_secs
                );
                terminate(child.as_mut(), pid)?;
                return Err(ProcessError::TimedOut { pid, timeout_secs });
            }
        }
    } else {
        child
            .wait()
            .map_err(|source| ProcessError::WaitFailed { pid, source })?
    };

    classify(pid, exit)
}

/// [`wait`] flattened to the integer status contract: failures become `-2`.
pub fn wait_status(handle: ProcessHandle, timeout_secs: u32) -> i32 {
    match wait(handle, timeout_secs) {
        Ok(status) => status,
        Err(err) => {
            log::warn!("{}", err);
            err.exit_status()
        }
    }
}

/// Poll without blocking; `None` while the child is still running.
pub fn try_wait(handle: &mut ProcessHandle) -> ProcessResult<Option<i32>> {
    let pid = handle.pid();
    match handle
        .child_mut()
        .try_wait()
        .map_err(|source| ProcessError::WaitFailed { pid, source })?
    {
        Some(exit) => classify(pid, exit).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CRASH_STATUS;
    use crate::process::{FakeProcess, Operation};

    #[test]
    fn zero_is_success() {
        assert_eq!(normalize_exit_code(0), 0);
    }

    #[test]
    fn low_byte_codes_stay_positive() {
        assert_eq!(normalize_exit_code(0x0000_0007), 7);
        assert_eq!(normalize_exit_code(0x7000_0001), 0x7000_0001);
    }

    #[test]
    fn severity_coded_faults_become_negative() {
        let access_violation = 0xC000_0005u32;
        assert_eq!(normalize_exit_code(access_violation), access_violation as i32);
        assert!(normalize_exit_code(access_violation) < 0);
        assert_eq!(normalize_exit_code(0x8000_0003), 0x8000_0003u32 as i32);
    }

    #[test]
    fn other_codes_collapse_to_one() {
        assert_eq!(normalize_exit_code(0x0000_0100), 1);
        assert_eq!(normalize_exit_code(0xC001_0000), 1);
    }

    #[test]
    fn timeout_terminates_and_reports_sentinel() {
        let ops = FakeProcess::new().hanging();
        let handle = ops.spawn_handle();

        assert_eq!(wait_status(handle, 1), CRASH_STATUS);
        assert!(ops.has_operation(|op| matches!(op, Operation::Kill { .. })));
        assert!(!ops.is_running());
    }

    #[test]
    fn kill_race_with_natural_exit_is_not_a_failure() {
        let ops = FakeProcess::new().hanging().exits_before_kill();
        let handle = ops.spawn_handle();

        let err = wait(handle, 1).unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { timeout_secs: 1, .. }));
    }

    #[test]
    fn signaled_child_is_a_crash() {
        let ops = FakeProcess::new().with_exit(NativeExit::Signaled(11));
        let err = wait(ops.spawn_handle(), 0).unwrap_err();
        assert!(matches!(err, ProcessError::Crashed { signal: 11, .. }));
        assert_eq!(err.exit_status(), CRASH_STATUS);
    }

    #[test]
    fn try_wait_polls_without_terminating() {
        let ops = FakeProcess::new().hanging();
        let mut handle = ops.spawn_handle();
        assert_eq!(try_wait(&mut handle).unwrap(), None);
        assert!(ops.is_running());
        assert!(!ops.has_operation(|op| matches!(op, Operation::Kill { .. })));
    }
}
