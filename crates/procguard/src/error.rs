use crate::environment::EnvBlockError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

/// Status reported for a child that crashed, timed out, or could not be waited on.
pub const CRASH_STATUS: i32 = -2;

/// One of the three standard streams of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    pub fn index(self) -> usize {
        match self {
            StdStream::Stdin => 0,
            StdStream::Stdout => 1,
            StdStream::Stderr => 2,
        }
    }
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StdStream::Stdin => "stdin",
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Program is not executable: {0}")]
    NotExecutable(PathBuf),

    #[error("Command line too long: {len} bytes (limit {limit})")]
    ArgumentsTooLong { len: usize, limit: usize },

    #[error("Invalid child environment: {0}")]
    InvalidEnvironment(#[from] EnvBlockError),

    #[error("Cannot open {stream} redirect {path}: {source}")]
    RedirectOpenFailed {
        stream: StdStream,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot apply {limit_mb} MiB memory limit to pid {pid}: {source}")]
    ResourceLimitSetupFailed {
        pid: u32,
        limit_mb: u64,
        #[source]
        source: io::Error,
    },

    #[error("Child process timed out after {timeout_secs}s (pid {pid})")]
    TimedOut { pid: u32, timeout_secs: u32 },

    #[error("Child process crashed: {description}")]
    Crashed { signal: i32, description: String },

    #[error("Failed waiting for pid {pid}: {source}")]
    WaitFailed {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to terminate pid {pid}: {source}")]
    TerminateFailed {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    /// Integer status a waiter reports for this error.
    ///
    /// Launch failures never produced a child, so they map to the same
    /// sentinel as wait failures.
    pub fn exit_status(&self) -> i32 {
        CRASH_STATUS
    }

    /// True for errors raised before any OS resource was acquired.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ProcessError::NotExecutable(_)
                | ProcessError::ArgumentsTooLong { .. }
                | ProcessError::InvalidEnvironment(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_error_names_the_stream() {
        let err = ProcessError::RedirectOpenFailed {
            stream: StdStream::Stderr,
            path: PathBuf::from("/nope/err.log"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        let msg = err.to_string();
        assert!(msg.contains("stderr"), "{msg}");
        assert!(msg.contains("/nope/err.log"), "{msg}");
        assert_eq!(err.exit_status(), CRASH_STATUS);
    }

    #[test]
    fn preconditions_are_flagged() {
        assert!(ProcessError::NotExecutable(PathBuf::from("x")).is_precondition());
        assert!(!ProcessError::TimedOut {
            pid: 1,
            timeout_secs: 1
        }
        .is_precondition());
    }
}
