use super::{
    is_executable, null_device, os_bytes, wait, ExecOptions, LaunchPlan, ProcessHandle, ProcessOps,
    Redirect, StdioSet,
};
use crate::cmdline::{arguments_fit_within_system_limits, build_command_line, command_line_len};
use crate::environment::EnvBlock;
use crate::error::{ProcessError, ProcessResult, StdStream};
use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

fn open_target(stream: StdStream, path: &Path) -> io::Result<File> {
    match stream {
        StdStream::Stdin => File::open(path),
        StdStream::Stdout | StdStream::Stderr => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path),
    }
}

fn open_redirect(stream: StdStream, redirect: &Redirect) -> ProcessResult<Option<File>> {
    let path = match redirect {
        Redirect::Inherit => return Ok(None),
        Redirect::Null => null_device(),
        Redirect::File(path) => path.as_path(),
    };
    open_target(stream, path)
        .map(Some)
        .map_err(|source| ProcessError::RedirectOpenFailed {
            stream,
            path: path.to_path_buf(),
            source,
        })
}

/// Open all three redirect targets.
///
/// When stdout and stderr name the same file, stderr gets a duplicate of the
/// stdout handle so both streams advance one shared offset. On error the
/// files opened so far are dropped, which closes them.
fn open_redirects(options: &ExecOptions) -> ProcessResult<StdioSet> {
    let stdin = open_redirect(StdStream::Stdin, options.redirect(StdStream::Stdin))?;
    let stdout = open_redirect(StdStream::Stdout, options.redirect(StdStream::Stdout))?;

    let stderr = match (
        options.redirect(StdStream::Stdout),
        options.redirect(StdStream::Stderr),
        stdout.as_ref(),
    ) {
        (Redirect::File(out), Redirect::File(err), Some(shared)) if out == err => {
            let dup = shared
                .try_clone()
                .map_err(|source| ProcessError::RedirectOpenFailed {
                    stream: StdStream::Stderr,
                    path: err.clone(),
                    source,
                })?;
            Some(dup)
        }
        (_, redirect, _) => open_redirect(StdStream::Stderr, redirect)?,
    };

    Ok(StdioSet {
        stdin,
        stdout,
        stderr,
    })
}

/// Spawn `program` through `ops`.
///
/// `args` is the full argv, program name first; an empty list uses `program`
/// itself as argv[0]. Nothing is opened or spawned when the program is not
/// executable or the command line is too long.
pub fn execute_with(
    ops: &dyn ProcessOps,
    program: &Path,
    args: &[OsString],
    options: &ExecOptions,
) -> ProcessResult<ProcessHandle> {
    if !is_executable(program) {
        return Err(ProcessError::NotExecutable(program.to_path_buf()));
    }

    let argv: Vec<&OsStr> = if args.is_empty() {
        vec![program.as_os_str()]
    } else {
        args.iter().map(OsString::as_os_str).collect()
    };
    let argv_bytes: Vec<Cow<'_, [u8]>> = argv.iter().map(|&a| os_bytes(a)).collect();
    if !arguments_fit_within_system_limits(&argv_bytes) {
        return Err(ProcessError::ArgumentsTooLong {
            len: command_line_len(&argv_bytes) + 1,
            limit: crate::cmdline::MAX_COMMAND_LINE_LEN,
        });
    }

    let env = options
        .env
        .as_ref()
        .map(|vars| EnvBlock::from_pairs(vars.iter().map(|(k, v)| (os_bytes(k), os_bytes(v)))))
        .transpose()?;
    let plan = LaunchPlan {
        program,
        command_line: build_command_line(&argv_bytes),
        env,
        argv,
    };

    let stdio = open_redirects(options)?;
    log::debug!(
        "spawning {}: {}",
        program.display(),
        String::from_utf8_lossy(&plan.command_line)
    );
    let mut child = ops
        .spawn(&plan, stdio)
        .map_err(|source| ProcessError::SpawnFailed {
            program: program.to_path_buf(),
            source,
        })?;
    let pid = child.pid();

    if options.memory_limit_mb > 0 {
        if let Err(source) = ops.apply_memory_limit(child.as_ref(), options.memory_limit_mb) {
            log::warn!(
                "memory limit for pid {} failed ({}); terminating child",
                pid,
                source
            );
            // Never leave the child running without the limit it asked for.
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessError::ResourceLimitSetupFailed {
                pid,
                limit_mb: options.memory_limit_mb,
                source,
            });
        }
        log::debug!(
            "pid {} limited to {} MiB",
            pid,
            options.memory_limit_mb
        );
    }

    log::info!("started {} (pid {})", program.display(), pid);
    Ok(ProcessHandle::new(child))
}

#[cfg(unix)]
pub fn execute(
    program: &Path,
    args: &[OsString],
    options: &ExecOptions,
) -> ProcessResult<ProcessHandle> {
    execute_with(super::default_ops(), program, args, options)
}

/// Fire-and-forget launch; the handle is released immediately.
#[cfg(unix)]
pub fn execute_detached(
    program: &Path,
    args: &[OsString],
    options: &ExecOptions,
) -> ProcessResult<u32> {
    let handle = execute(program, args, options)?;
    let pid = handle.pid();
    handle.into_child().detach();
    Ok(pid)
}

/// Launch and wait in one step. See [`wait`] for `timeout_secs`.
#[cfg(unix)]
pub fn execute_and_wait(
    program: &Path,
    args: &[OsString],
    options: &ExecOptions,
    timeout_secs: u32,
) -> ProcessResult<i32> {
    let handle = execute(program, args, options)?;
    wait(handle, timeout_secs)
}
