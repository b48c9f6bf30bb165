use crate::config::SignalConfig;
use crate::registry::{self, HandlerInstaller, InterruptOutcome};
use crate::stack::{self, FaultContext, UnwindWalker};
use libc::{c_int, c_void};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;
use signal_hook::iterator::Signals;
use signal_hook::low_level;
use std::io::{self, Write};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub const INTERRUPT_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

pub const FAULT_SIGNALS: [Signal; 8] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGABRT,
    Signal::SIGTRAP,
    Signal::SIGSYS,
    Signal::SIGQUIT,
];

const ALT_STACK_SIZE: usize = 1 << 20;

/// How long a second faulting thread waits for the first one to finish.
const SECOND_FAULT_WAIT: Duration = Duration::from_secs(10);
const SECOND_FAULT_POLL: Duration = Duration::from_millis(5);

static IN_FAULT: AtomicBool = AtomicBool::new(false);
static FAULT_HANDLED: AtomicBool = AtomicBool::new(false);
/// `pthread_self` of the thread handling the first fault.
static FAULT_THREAD: AtomicUsize = AtomicUsize::new(0);
static PREVIOUS_INTERRUPT: OnceCell<Vec<(Signal, SigAction)>> = OnceCell::new();
static PREVIOUS_FAULT: OnceCell<Vec<(Signal, SigAction)>> = OnceCell::new();

/// Installs the real POSIX handlers.
///
/// The handlers always act on [`registry::global`], so only the global
/// registry is built with this installer.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SignalInstaller;

impl HandlerInstaller for SignalInstaller {
    fn install(&self, config: &SignalConfig) {
        if config.disable_crash_report {
            disable_core_dumps();
        }
        if let Err(err) = install_interrupt_handlers() {
            log::warn!("interrupt handlers not installed: {}", err);
        }
        if let Err(err) = install_fault_handlers() {
            log::warn!("fault handlers not installed: {}", err);
        }
        if config.disable_runtime_dialogs {
            super::install_runtime_dialog_suppression();
        }
    }
}

fn disable_core_dumps() {
    let result = getrlimit(Resource::RLIMIT_CORE)
        .and_then(|(_, hard)| setrlimit(Resource::RLIMIT_CORE, 0, hard));
    match result {
        Ok(()) => log::debug!("core dumps disabled"),
        Err(err) => log::warn!("could not disable core dumps: {}", err),
    }
}

fn default_action() -> SigAction {
    SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty())
}

fn previous_action(saved: &OnceCell<Vec<(Signal, SigAction)>>, signal: Signal) -> Option<SigAction> {
    saved
        .get()?
        .iter()
        .find(|(s, _)| *s == signal)
        .map(|(_, action)| *action)
}

fn signal_name(signum: c_int) -> &'static str {
    Signal::try_from(signum).map_or("unknown signal", Signal::as_str)
}

// ---------------------------------------------------------------------------
// Interrupts

fn install_interrupt_handlers() -> io::Result<()> {
    let mut watched = Vec::with_capacity(INTERRUPT_SIGNALS.len());
    let mut previous = Vec::with_capacity(INTERRUPT_SIGNALS.len());
    for signal in INTERRUPT_SIGNALS {
        // Parked at the default so signal-hook does not chain the old handler
        // on every delivery; it gets the signal back only when unhandled.
        let old = unsafe { sigaction(signal, &default_action()) }?;
        if old.handler() == SigHandler::SigIgn {
            // Ignored by whoever started us (nohup, background job).
            unsafe { sigaction(signal, &old) }?;
            continue;
        }
        previous.push((signal, old));
        watched.push(signal as c_int);
    }
    let _ = PREVIOUS_INTERRUPT.set(previous);
    if watched.is_empty() {
        return Ok(());
    }

    let signals = Signals::new(&watched)?;
    thread::Builder::new()
        .name("procguard-signals".to_string())
        .spawn(move || interrupt_loop(signals))?;
    Ok(())
}

fn interrupt_loop(mut signals: Signals) {
    for signum in signals.forever() {
        log::debug!("received {}", signal_name(signum));
        match registry::global().handle_interrupt() {
            InterruptOutcome::Handled => {}
            InterruptOutcome::Unhandled => terminate_with(signum),
        }
    }
}

/// Give the signal back to whatever owned it before us and resend it.
fn terminate_with(signum: c_int) {
    let Ok(signal) = Signal::try_from(signum) else {
        return;
    };
    match previous_action(&PREVIOUS_INTERRUPT, signal) {
        Some(action) if action.handler() != SigHandler::SigDfl => unsafe {
            let _ = sigaction(signal, &action);
            let _ = low_level::raise(signum);
        },
        _ => {
            if let Err(err) = low_level::emulate_default_handler(signum) {
                log::warn!("cannot terminate on {}: {}", signal.as_str(), err);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Faults

/// Give the installing thread a stack large enough to symbolize on.
fn install_alternate_stack() -> io::Result<()> {
    let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    };
    let len = ALT_STACK_SIZE + page;
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    let unmap_with = |err: io::Error| {
        unsafe { libc::munmap(base, len) };
        Err(err)
    };

    // Lowest page is the guard.
    if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
        return unmap_with(io::Error::last_os_error());
    }
    let stack = libc::stack_t {
        ss_sp: unsafe { base.cast::<u8>().add(page) }.cast::<c_void>(),
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE,
    };
    if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
        return unmap_with(io::Error::last_os_error());
    }
    Ok(())
}

fn install_fault_handlers() -> io::Result<()> {
    if let Err(err) = install_alternate_stack() {
        log::debug!("no alternate signal stack: {}", err);
    }
    let action = SigAction::new(
        SigHandler::SigAction(on_fault),
        SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    );
    let mut previous = Vec::with_capacity(FAULT_SIGNALS.len());
    for signal in FAULT_SIGNALS {
        previous.push((signal, unsafe { sigaction(signal, &action) }?));
    }
    let _ = PREVIOUS_FAULT.set(previous);
    Ok(())
}

fn restore_fault_actions() {
    for signal in FAULT_SIGNALS {
        let action = previous_action(&PREVIOUS_FAULT, signal).unwrap_or_else(default_action);
        unsafe {
            let _ = sigaction(signal, &action);
        }
    }
}

/// Hand the fault to the previous disposition. A kernel-raised fault repeats
/// by itself once the handler returns; a sent one has to be raised again.
fn chain_to_previous(signum: c_int, info: *const libc::siginfo_t) {
    restore_fault_actions();
    let user_sent = info.is_null() || unsafe { (*info).si_code } <= 0;
    if user_sent {
        unsafe {
            libc::raise(signum);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn fault_address(info: *const libc::siginfo_t) -> Option<usize> {
    (!info.is_null()).then(|| unsafe { (*info).si_addr() } as usize)
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn fault_address(info: *const libc::siginfo_t) -> Option<usize> {
    (!info.is_null()).then(|| unsafe { (*info).si_addr } as usize)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn fault_address(_info: *const libc::siginfo_t) -> Option<usize> {
    None
}

/// Unbuffered fd 2; `io::stderr()` takes a lock the faulting thread may hold.
struct RawStderr;

impl Write for RawStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr().cast::<c_void>(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn report_fault(signum: c_int, info: *const libc::siginfo_t, context: *mut c_void) {
    let mut err = RawStderr;
    let name = signal_name(signum);
    let _ = match fault_address(info) {
        Some(addr) => writeln!(err, "procguard: fatal {} at address {:#x}", name, addr),
        None => writeln!(err, "procguard: fatal {}", name),
    };
    let _ = writeln!(err, "Stack dump:");
    let start = unsafe { FaultContext::from_ucontext(context) };
    let _ = stack::write_trace(&UnwindWalker::default(), start.as_ref(), &mut err);
}

fn current_thread() -> usize {
    unsafe { libc::pthread_self() as usize }
}

/// Poll `flag` until it is set or `limit` passes.
fn wait_for(flag: &AtomicBool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while !flag.load(Ordering::SeqCst) {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(SECOND_FAULT_POLL);
    }
    true
}

extern "C" fn on_fault(signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    if IN_FAULT.swap(true, Ordering::SeqCst) {
        // Another thread is mid-cleanup: let it finish before the default
        // action can take the process down. A nested fault on the handling
        // thread itself chains at once.
        if FAULT_THREAD.load(Ordering::SeqCst) != current_thread() {
            wait_for(&FAULT_HANDLED, SECOND_FAULT_WAIT);
        }
        chain_to_previous(signum, info);
        return;
    }
    FAULT_THREAD.store(current_thread(), Ordering::SeqCst);

    let registry = registry::global();
    registry.cleanup_after_fault();
    if registry.print_trace_enabled() {
        report_fault(signum, info, context);
    }
    if registry.config().disable_crash_report {
        unsafe { libc::_exit(128 + signum) };
    }
    FAULT_HANDLED.store(true, Ordering::SeqCst);
    chain_to_previous(signum, info);
}
