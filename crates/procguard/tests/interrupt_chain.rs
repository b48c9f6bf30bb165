#![cfg(unix)]

//! An interrupt nobody claims goes back to the handler that was installed
//! before the registry, after cleanup. Own binary: it owns the process-wide
//! registry.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};
use tempfile::tempdir;

static WATCHED: OnceCell<CString> = OnceCell::new();
/// 0 until the earlier handler runs, then 1 if the file was gone, 2 if not.
static EARLIER_HANDLER: AtomicI32 = AtomicI32::new(0);

extern "C" fn earlier_handler(_signum: libc::c_int) {
    let gone = match WATCHED.get() {
        Some(path) => (unsafe { libc::access(path.as_ptr(), libc::F_OK) }) != 0,
        None => false,
    };
    EARLIER_HANDLER.store(if gone { 1 } else { 2 }, Ordering::SeqCst);
}

#[test]
fn unhandled_interrupt_reaches_the_earlier_handler_after_cleanup() {
    let dir = tempdir().unwrap();
    let doomed = dir.path().join("partial.o");
    fs::write(&doomed, b"half written").unwrap();
    WATCHED
        .set(CString::new(doomed.as_os_str().as_bytes()).unwrap())
        .unwrap();

    let earlier = SigAction::new(
        SigHandler::Handler(earlier_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGTERM, &earlier) }.unwrap();

    // First use installs the registry's handlers over the earlier one.
    procguard::register_file_for_removal(&doomed);

    unsafe {
        libc::raise(libc::SIGTERM);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while EARLIER_HANDLER.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "earlier handler never ran");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(
        EARLIER_HANDLER.load(Ordering::SeqCst),
        1,
        "earlier handler ran before cleanup"
    );
    assert!(!doomed.exists());
    assert!(procguard::registry::global().is_cleanup_done());
}
