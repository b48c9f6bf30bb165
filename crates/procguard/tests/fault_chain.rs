#![cfg(unix)]

//! A fault is handed to the handler that was installed before the registry,
//! after cleanup. The faulting half runs in a re-executed copy of this test
//! binary.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

const CHILD_ENV: &str = "PROCGUARD_FAULT_CHAIN_FILE";
const TEST_NAME: &str = "earlier_fault_handler_runs_after_cleanup";
const AFTER_CLEANUP: i32 = 42;
const BEFORE_CLEANUP: i32 = 43;

static WATCHED: OnceCell<CString> = OnceCell::new();

extern "C" fn earlier_handler(_signum: libc::c_int) {
    let gone = match WATCHED.get() {
        Some(path) => (unsafe { libc::access(path.as_ptr(), libc::F_OK) }) != 0,
        None => false,
    };
    let msg = b"earlier fault handler\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::_exit(if gone { AFTER_CLEANUP } else { BEFORE_CLEANUP });
    }
}

fn fault_with_earlier_handler(doomed: &Path) -> ! {
    WATCHED
        .set(CString::new(doomed.as_os_str().as_bytes()).unwrap())
        .unwrap();
    let earlier = SigAction::new(
        SigHandler::Handler(earlier_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGSEGV, &earlier) }.unwrap();

    procguard::register_file_for_removal(doomed);

    unsafe {
        let page = libc::mmap(
            std::ptr::null_mut(),
            4096,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        assert_ne!(page, libc::MAP_FAILED);
        std::ptr::write_volatile(page.cast::<u8>(), 1);
    }
    unreachable!("write to a PROT_NONE page returned");
}

#[test]
fn earlier_fault_handler_runs_after_cleanup() {
    if let Some(path) = std::env::var_os(CHILD_ENV) {
        fault_with_earlier_handler(Path::new(&path));
    }

    let dir = tempdir().unwrap();
    let doomed = dir.path().join("obj.o");
    fs::write(&doomed, b"partial").unwrap();

    let output = Command::new(std::env::current_exe().unwrap())
        .args([TEST_NAME, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, &doomed)
        .env_remove("PROCGUARD_DISABLE_CRASH_REPORT")
        .env_remove("PROCGUARD_DISABLE_RUNTIME_DIALOGS")
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("earlier fault handler"), "{stderr}");
    assert_eq!(output.status.code(), Some(AFTER_CLEANUP), "{stderr}");
    assert!(!doomed.exists());
}
