//! OS signal glue for the cleanup registry.
//!
//! Interrupt signals (SIGINT, SIGTERM, SIGHUP) are delivered by signal-hook
//! to a dedicated thread, so the registry's mutex and the user's interrupt
//! function run in ordinary thread context. Fault signals are
//! handled in place: cleanup, optional stack dump, then the previous
//! disposition takes over.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use unix::SignalInstaller;
#[cfg(unix)]
pub use unix::{FAULT_SIGNALS, INTERRUPT_SIGNALS};

use crate::config::RUNTIME_REPORT_EXIT_CODE;
use crate::registry;
use std::io::{self, Write};

/// Turn panics into a one-line report and a fixed exit code.
///
/// Registered cleanup still runs. Installed automatically when runtime
/// dialogs are disabled through the environment.
pub fn install_runtime_dialog_suppression() {
    std::panic::set_hook(Box::new(|info| {
        let mut stderr = io::stderr();
        let _ = writeln!(stderr, "procguard: runtime failure: {}", info);
        let registry = registry::global();
        if registry.print_trace_enabled() {
            let _ = crate::stack::print_stack_trace(&mut stderr);
        }
        if !registry.cleanup_after_fault() {
            let _ = writeln!(stderr, "procguard: cleanup skipped, registry busy");
        }
        std::process::exit(RUNTIME_REPORT_EXIT_CODE);
    }));
}
