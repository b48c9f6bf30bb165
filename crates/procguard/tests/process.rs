#![cfg(unix)]

use procguard::process::{self, find_program_by_name, try_wait};
use procguard::{execute, execute_and_wait, execute_detached, wait_status};
use procguard::{ExecOptions, ProcessError, Redirect, StdStream, CRASH_STATUS};
use serial_test::serial;
use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const SH: &str = "/bin/sh";

fn sh(script: &str) -> Vec<OsString> {
    vec!["sh".into(), "-c".into(), script.into()]
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[test]
#[serial]
fn exit_code_is_reported() {
    let status = execute_and_wait(Path::new(SH), &sh("exit 7"), &ExecOptions::new(), 0).unwrap();
    assert_eq!(status, 7);
}

#[test]
#[serial]
fn timeout_kills_and_collects_the_child() {
    let handle = execute(Path::new(SH), &sh("sleep 10"), &ExecOptions::new()).unwrap();
    let pid = handle.pid();

    let started = Instant::now();
    assert_eq!(wait_status(handle, 1), CRASH_STATUS);
    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(!pid_alive(pid), "pid {pid} still exists");
}

#[test]
#[serial]
fn shared_output_file_gets_both_streams() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("build.log");
    let opts = ExecOptions::new()
        .with_redirect(StdStream::Stdout, Redirect::file(&log))
        .with_redirect(StdStream::Stderr, Redirect::file(&log));

    let status =
        execute_and_wait(Path::new(SH), &sh("echo to-out; echo to-err 1>&2"), &opts, 0).unwrap();
    assert_eq!(status, 0);

    let text = fs::read_to_string(&log).unwrap();
    assert!(text.contains("to-out\n"), "{text}");
    assert!(text.contains("to-err\n"), "{text}");
}

#[test]
#[serial]
fn stdin_redirect_feeds_the_child() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let output = dir.path().join("out.txt");
    fs::write(&input, "line one\nline two\n").unwrap();
    let opts = ExecOptions::new()
        .with_redirect(StdStream::Stdin, Redirect::file(&input))
        .with_redirect(StdStream::Stdout, Redirect::file(&output));

    assert_eq!(execute_and_wait(Path::new(SH), &sh("cat"), &opts, 0).unwrap(), 0);
    assert_eq!(fs::read_to_string(&output).unwrap(), "line one\nline two\n");
}

#[test]
#[serial]
fn null_stdin_reads_empty() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("out.txt");
    let opts = ExecOptions::new()
        .with_redirect(StdStream::Stdin, Redirect::Null)
        .with_redirect(StdStream::Stdout, Redirect::file(&output));

    assert_eq!(execute_and_wait(Path::new(SH), &sh("cat; echo end"), &opts, 0).unwrap(), 0);
    assert_eq!(fs::read_to_string(&output).unwrap(), "end\n");
}

#[test]
#[serial]
fn environment_is_replaced_exactly() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("env.txt");
    let opts = ExecOptions::new()
        .with_env([("GREETING", "hello world")])
        .with_redirect(StdStream::Stdout, Redirect::file(&output));

    let script = r#"echo "$GREETING"; echo "home=${HOME:-unset}""#;
    assert_eq!(execute_and_wait(Path::new(SH), &sh(script), &opts, 0).unwrap(), 0);
    assert_eq!(
        fs::read_to_string(&output).unwrap(),
        "hello world\nhome=unset\n"
    );
}

#[test]
#[serial]
fn nul_in_environment_never_reaches_the_child() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("env.txt");
    let opts = ExecOptions::new()
        .with_env([("A", "x\0EVIL=injected")])
        .with_redirect(StdStream::Stdout, Redirect::file(&output));

    let err = execute_and_wait(Path::new(SH), &sh(r#"echo "A=$A EVIL=$EVIL""#), &opts, 0)
        .unwrap_err();
    assert!(matches!(err, ProcessError::InvalidEnvironment(_)), "{err}");
    assert!(!output.exists());
}

#[test]
#[serial]
fn signaled_child_is_reported_as_crash() {
    let err = execute_and_wait(Path::new(SH), &sh("kill -SEGV $$"), &ExecOptions::new(), 0)
        .unwrap_err();
    match err {
        ProcessError::Crashed {
            signal,
            description,
        } => {
            assert_eq!(signal, libc::SIGSEGV);
            assert!(description.contains("SIGSEGV"), "{description}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
#[serial]
fn missing_program_is_not_executable() {
    let dir = tempdir().unwrap();
    let err = execute(&dir.path().join("nothing"), &[], &ExecOptions::new()).unwrap_err();
    assert!(matches!(err, ProcessError::NotExecutable(_)));
    assert!(err.is_precondition());
}

#[test]
#[serial]
fn polling_sees_the_exit() {
    let mut handle = execute(Path::new(SH), &sh("exit 3"), &ExecOptions::new()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = try_wait(&mut handle).unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "child never exited");
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(status, 3);
}

#[test]
#[serial]
fn detached_launch_returns_a_pid() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("ran");
    let script = format!("touch '{}'", marker.display());
    let pid = execute_detached(Path::new(SH), &sh(&script), &ExecOptions::new()).unwrap();
    assert!(pid > 0);

    let deadline = Instant::now() + Duration::from_secs(10);
    while !marker.exists() {
        assert!(Instant::now() < deadline, "detached child never ran");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
#[serial]
fn programs_are_found_on_path() {
    let sh = find_program_by_name("sh").expect("sh on PATH");
    assert!(process::is_executable(&sh));
    assert_eq!(find_program_by_name("procguard-no-such-tool"), None);
}

#[test]
#[serial]
fn path_lookup_follows_the_environment() {
    let dir = tempdir().unwrap();
    let tool = dir.path().join("only-here");
    fs::write(&tool, "#!/bin/sh\nexit 0\n").unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
    }

    let saved = std::env::var_os("PATH");
    std::env::set_var("PATH", dir.path());
    let found = find_program_by_name("only-here");
    match saved {
        Some(path) => std::env::set_var("PATH", path),
        None => std::env::remove_var("PATH"),
    }
    assert_eq!(found, Some(tool));
}

#[cfg(target_os = "linux")]
#[test]
#[serial]
fn memory_limit_is_visible_in_proc() {
    let opts = ExecOptions::new().with_memory_limit_mb(512);
    let handle = execute(Path::new(SH), &sh("sleep 10"), &opts).unwrap();
    let limits = fs::read_to_string(format!("/proc/{}/limits", handle.pid())).unwrap();
    let wanted = (512u64 * 1024 * 1024).to_string();

    let line = limits
        .lines()
        .find(|l| l.starts_with("Max address space"))
        .expect("address space row");
    assert!(line.contains(&wanted), "{line}");
    assert_eq!(wait_status(handle, 1), CRASH_STATUS);
}
