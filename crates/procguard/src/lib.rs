//! Child process execution and cleanup-on-failure for toolchain drivers.
//!
//! * [`process`] launches programs with redirected streams, an exact
//!   environment and an optional memory ceiling, then waits with a timeout.
//! * [`registry`] tracks output files and callbacks that must be dealt with
//!   if the process is interrupted or crashes.
//! * [`stack`] captures and prints symbolized stack traces.

pub mod cmdline;
pub mod config;
pub mod environment;
pub mod error;
pub mod guards;
pub mod process;
pub mod registry;
pub mod signals;
pub mod stack;

pub use cmdline::{arguments_fit_within_system_limits, build_command_line};
pub use config::SignalConfig;
pub use error::{ProcessError, ProcessResult, StdStream, CRASH_STATUS};
pub use guards::RemoveFileOnSignal;
pub use process::{
    execute_with, find_program_by_name, wait, wait_status, ExecOptions, ProcessHandle, Redirect,
};
#[cfg(unix)]
pub use process::{execute, execute_and_wait, execute_detached};
pub use registry::{
    add_cleanup_callback, clear_interrupt_handler, print_stack_trace_on_fault,
    register_file_for_removal, run_cleanup_handlers, set_interrupt_handler,
    unregister_file_for_removal, CleanupRegistry,
};
pub use stack::print_stack_trace;
