//! Process-wide cleanup registry.
//!
//! Holds the files to delete, the callbacks to run and the interrupt function
//! that the signal handlers act on. All state sits behind one mutex which the
//! OS handler thread also takes, so a handler never sees a half-made change.
//! Cleanup runs at most once per registry, whoever triggers it first.

use crate::config::SignalConfig;
use once_cell::sync::Lazy;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

pub type CleanupCallback = Box<dyn FnOnce() + Send + 'static>;
pub type InterruptFn = Box<dyn FnOnce() + Send + 'static>;

const FAULT_LOCK_ATTEMPTS: u32 = 200;
const FAULT_LOCK_BACKOFF: Duration = Duration::from_millis(5);

/// Installs the OS-level handlers that feed a registry.
///
/// Called once, with the registry lock held, before the first change to the
/// registry becomes visible.
pub trait HandlerInstaller: Send + Sync {
    fn install(&self, config: &SignalConfig);
}

/// Installer that leaves the OS alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstaller;

impl HandlerInstaller for NoopInstaller {
    fn install(&self, _config: &SignalConfig) {}
}

/// What the interrupt path decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// An interrupt function ran; the process keeps going.
    Handled,
    /// Nothing claimed the interrupt; default termination should follow.
    Unhandled,
}

#[derive(Default)]
struct RegistryState {
    files: Vec<PathBuf>,
    callbacks: Vec<CleanupCallback>,
    interrupt: Option<InterruptFn>,
    cleanup_done: bool,
    installed: bool,
}

pub struct CleanupRegistry {
    state: Mutex<RegistryState>,
    installer: Box<dyn HandlerInstaller>,
    config: SignalConfig,
    print_trace: AtomicBool,
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("config", &self.config)
            .field("print_trace", &self.print_trace.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CleanupRegistry {
    /// A standalone registry.
    ///
    /// OS signals only ever reach [`global`]; a registry built here is
    /// cleaned up through [`run_cleanup`](Self::run_cleanup) and the other
    /// explicit triggers. `installer` still runs once, on first mutation.
    pub fn new(installer: impl HandlerInstaller + 'static, config: SignalConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            installer: Box::new(installer),
            config,
            print_trace: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> SignalConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock, installing the OS handlers first if this is the first use.
    fn lock_installed(&self) -> MutexGuard<'_, RegistryState> {
        let mut state = self.lock();
        if !state.installed {
            self.installer.install(&self.config);
            state.installed = true;
            log::debug!("cleanup handlers installed");
        }
        state
    }

    pub fn register_file_for_removal(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut state = self.lock_installed();
        log::debug!("will remove {} on signal", path.display());
        state.files.push(path);
    }

    /// Forget the most recent registration of `path`. Earlier duplicates stay.
    pub fn unregister_file_for_removal(&self, path: &Path) -> bool {
        let mut state = self.lock_installed();
        match state.files.iter().rposition(|p| p == path) {
            Some(idx) => {
                state.files.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Run `callback` once when cleanup happens, after the files are deleted.
    pub fn add_cleanup_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.lock_installed();
        state.callbacks.push(Box::new(callback));
    }

    /// Replace the function run when an interrupt arrives.
    pub fn set_interrupt_handler(&self, handler: impl FnOnce() + Send + 'static) {
        let mut state = self.lock_installed();
        state.interrupt = Some(Box::new(handler));
    }

    pub fn clear_interrupt_handler(&self) {
        let mut state = self.lock_installed();
        state.interrupt = None;
    }

    /// Print a stack trace when a fault is handled.
    pub fn enable_stack_trace_on_fault(&self) {
        let _state = self.lock_installed();
        self.print_trace.store(true, Ordering::SeqCst);
    }

    pub fn print_trace_enabled(&self) -> bool {
        self.print_trace.load(Ordering::SeqCst)
    }

    /// Delete the registered files and run the callbacks, once.
    ///
    /// The work is taken out under the lock and done after it is released,
    /// so callbacks may use the registry.
    pub fn run_cleanup(&self) {
        let work = self.lock().take_cleanup();
        if let Some(work) = work {
            work.run();
        }
    }

    /// Interrupt path: clean up, then hand over to the interrupt function.
    ///
    /// The function is taken out of the registry, so a second interrupt
    /// without a new one falls through to termination.
    pub fn handle_interrupt(&self) -> InterruptOutcome {
        let (work, handler) = {
            let mut state = self.lock();
            (state.take_cleanup(), state.interrupt.take())
        };
        if let Some(work) = work {
            work.run();
        }
        match handler {
            Some(handler) => {
                handler();
                InterruptOutcome::Handled
            }
            None => InterruptOutcome::Unhandled,
        }
    }

    /// Cleanup from a fault or panic context.
    ///
    /// The faulting thread may already hold the lock, so acquisition is
    /// bounded. Returns false if the lock never became available.
    pub fn cleanup_after_fault(&self) -> bool {
        for _ in 0..FAULT_LOCK_ATTEMPTS {
            let mut state = match self.state.try_lock() {
                Ok(state) => state,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    std::thread::sleep(FAULT_LOCK_BACKOFF);
                    continue;
                }
            };
            let work = state.take_cleanup();
            drop(state);
            if let Some(work) = work {
                work.run();
            }
            return true;
        }
        false
    }

    pub fn is_cleanup_done(&self) -> bool {
        self.lock().cleanup_done
    }

    /// Files that would be deleted right now, oldest first.
    pub fn pending_files(&self) -> Vec<PathBuf> {
        self.lock().files.clone()
    }

    pub fn has_interrupt_handler(&self) -> bool {
        self.lock().interrupt.is_some()
    }
}

impl RegistryState {
    /// Claim the one-shot cleanup. `None` if it was already claimed.
    fn take_cleanup(&mut self) -> Option<CleanupWork> {
        if self.cleanup_done {
            return None;
        }
        self.cleanup_done = true;
        Some(CleanupWork {
            files: std::mem::take(&mut self.files),
            callbacks: std::mem::take(&mut self.callbacks),
        })
    }
}

struct CleanupWork {
    files: Vec<PathBuf>,
    callbacks: Vec<CleanupCallback>,
}

impl CleanupWork {
    fn run(self) {
        // Newest first.
        for path in self.files.iter().rev() {
            remove_regular_file(path);
        }
        for callback in self.callbacks {
            callback();
        }
    }
}

/// Only regular files are removed: a registered name that now points at a
/// device or directory is left alone.
fn remove_regular_file(path: &Path) {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            let _ = fs::remove_file(path);
        }
        _ => {}
    }
}

fn platform_installer() -> Box<dyn HandlerInstaller> {
    #[cfg(unix)]
    {
        Box::new(crate::signals::SignalInstaller)
    }
    #[cfg(not(unix))]
    {
        Box::new(NoopInstaller)
    }
}

static GLOBAL: Lazy<CleanupRegistry> = Lazy::new(|| CleanupRegistry {
    state: Mutex::new(RegistryState::default()),
    installer: platform_installer(),
    config: SignalConfig::from_env(),
    print_trace: AtomicBool::new(false),
});

/// The registry the OS handlers of this process act on.
pub fn global() -> &'static CleanupRegistry {
    &GLOBAL
}

pub fn register_file_for_removal(path: impl Into<PathBuf>) {
    global().register_file_for_removal(path);
}

pub fn unregister_file_for_removal(path: &Path) -> bool {
    global().unregister_file_for_removal(path)
}

pub fn add_cleanup_callback(callback: impl FnOnce() + Send + 'static) {
    global().add_cleanup_callback(callback);
}

pub fn set_interrupt_handler(handler: impl FnOnce() + Send + 'static) {
    global().set_interrupt_handler(handler);
}

pub fn clear_interrupt_handler() {
    global().clear_interrupt_handler();
}

/// Explicit cleanup trigger for top-level error paths.
pub fn run_cleanup_handlers() {
    global().run_cleanup();
}

pub fn print_stack_trace_on_fault() {
    global().enable_stack_trace_on_fault();
}
