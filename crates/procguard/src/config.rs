//! Settings read from the process environment.

/// Disables the native crash report and terminates right after the fault path.
pub const DISABLE_CRASH_REPORT_ENV: &str = "PROCGUARD_DISABLE_CRASH_REPORT";

/// Turns runtime assertion reports into a stderr message plus exit.
pub const DISABLE_RUNTIME_DIALOGS_ENV: &str = "PROCGUARD_DISABLE_RUNTIME_DIALOGS";

/// Exit code used when a runtime report is converted into termination.
pub const RUNTIME_REPORT_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalConfig {
    /// Exit immediately with the fault's code instead of chaining.
    pub disable_crash_report: bool,
    /// Replace the default panic report with a message and exit.
    pub disable_runtime_dialogs: bool,
}

impl SignalConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key).is_some())
    }

    /// Build from an arbitrary presence lookup. A variable counts when it is
    /// set at all, whatever its value.
    pub fn from_lookup(mut is_set: impl FnMut(&str) -> bool) -> Self {
        Self {
            disable_crash_report: is_set(DISABLE_CRASH_REPORT_ENV),
            disable_runtime_dialogs: is_set(DISABLE_RUNTIME_DIALOGS_ENV),
        }
    }
}
