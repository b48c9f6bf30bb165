//! Child process execution.
//!
//! The launcher and waiter in this module are platform independent. Everything
//! that touches the OS goes through the [`ProcessOps`] and [`ChildProcess`]
//! traits, with a real backend per target ([`UnixProcess`]) and a recording
//! backend for tests ([`FakeProcess`]).

pub mod fake;
mod launch;
#[cfg(unix)]
pub mod unix;
mod wait;

pub use fake::{FakeProcess, Operation};
#[cfg(unix)]
pub use launch::{execute, execute_and_wait, execute_detached};
pub use launch::execute_with;
#[cfg(unix)]
pub use unix::UnixProcess;
pub use wait::{normalize_exit_code, try_wait, wait, wait_status};

use crate::environment::EnvBlock;
use crate::error::StdStream;
use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a child's standard stream goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Redirect {
    /// Share the caller's own stream.
    #[default]
    Inherit,
    /// The platform null device.
    Null,
    /// A named file: read for stdin, created or truncated for output.
    File(PathBuf),
}

impl Redirect {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Redirect::File(path.into())
    }
}

/// Launch settings.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Exact child environment. `None` inherits the caller's.
    pub env: Option<Vec<(OsString, OsString)>>,
    /// Indexed by [`StdStream::index`].
    pub redirects: [Redirect; 3],
    /// Address-space ceiling in MiB. Zero means unlimited.
    pub memory_limit_mb: u64,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_redirect(mut self, stream: StdStream, redirect: Redirect) -> Self {
        self.redirects[stream.index()] = redirect;
        self
    }

    pub fn with_memory_limit_mb(mut self, limit_mb: u64) -> Self {
        self.memory_limit_mb = limit_mb;
        self
    }

    pub fn redirect(&self, stream: StdStream) -> &Redirect {
        &self.redirects[stream.index()]
    }
}

/// Opened redirect targets handed to a backend. `None` means inherit.
///
/// The files are owned here and closed when the set is dropped, which a
/// backend does right after its spawn attempt whatever the outcome.
#[derive(Debug, Default)]
pub struct StdioSet {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

/// Everything a backend needs to create a child.
#[derive(Debug)]
pub struct LaunchPlan<'a> {
    pub program: &'a Path,
    /// Full argv, program name first.
    pub argv: Vec<&'a OsStr>,
    /// `argv` flattened with the native escaping rules.
    pub command_line: Vec<u8>,
    pub env: Option<EnvBlock>,
}

/// Raw termination state as the OS reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeExit {
    Code(u32),
    Signaled(i32),
}

/// A running (or finished, not yet collected) child owned by a backend.
pub trait ChildProcess: Send + fmt::Debug {
    fn pid(&self) -> u32;

    /// Block until the child exits.
    fn wait(&mut self) -> io::Result<NativeExit>;

    /// Block for at most `timeout`; `None` if the child is still running.
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<NativeExit>>;

    fn try_wait(&mut self) -> io::Result<Option<NativeExit>>;

    /// Forcibly terminate the child.
    fn kill(&mut self) -> io::Result<()>;

    /// Give up ownership without waiting; the backend collects the exit itself.
    fn detach(self: Box<Self>);
}

/// Process creation capability of a platform backend.
pub trait ProcessOps: Send + Sync {
    fn spawn(&self, plan: &LaunchPlan<'_>, stdio: StdioSet) -> io::Result<Box<dyn ChildProcess>>;

    /// Cap the address space of an already spawned child.
    fn apply_memory_limit(&self, child: &dyn ChildProcess, limit_mb: u64) -> io::Result<()>;
}

/// Exclusive owner of one child process.
///
/// Consumed by [`wait`]; dropping it without waiting releases the handle and
/// leaves the child running.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Box<dyn ChildProcess>,
}

impl ProcessHandle {
    pub(crate) fn new(child: Box<dyn ChildProcess>) -> Self {
        Self { child }
    }

    pub fn pid(&self) -> u32 {
        self.child.pid()
    }

    pub(crate) fn into_child(self) -> Box<dyn ChildProcess> {
        self.child
    }

    pub(crate) fn child_mut(&mut self) -> &mut dyn ChildProcess {
        self.child.as_mut()
    }
}

/// The backend for the build target.
#[cfg(unix)]
pub fn default_ops() -> &'static dyn ProcessOps {
    static OPS: UnixProcess = UnixProcess;
    &OPS
}

/// True if `path` names a regular file the caller may execute.
pub fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        nix::unistd::access(path, nix::unistd::AccessFlags::X_OK).is_ok()
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Locate `name` on `PATH`.
///
/// A name that already contains a path separator is returned unchanged.
pub fn find_program_by_name(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    let dirs: Vec<PathBuf> = std::env::split_paths(&path_var).collect();
    find_program_by_name_in(name, &dirs)
}

pub fn find_program_by_name_in<P: AsRef<Path>>(name: &str, dirs: &[P]) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
        return Some(PathBuf::from(name));
    }
    dirs.iter()
        .map(AsRef::as_ref)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

pub(crate) fn os_bytes(s: &OsStr) -> Cow<'_, [u8]> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Cow::Borrowed(s.as_bytes())
    }
    #[cfg(not(unix))]
    {
        Cow::Owned(s.to_string_lossy().into_owned().into_bytes())
    }
}

pub(crate) fn null_device() -> &'static Path {
    if cfg!(windows) {
        Path::new("NUL")
    } else {
        Path::new("/dev/null")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn executable_requires_exec_bit_and_regular_file() {
        let dir = tempdir().unwrap();
        let runnable = write_script(dir.path(), "runnable", 0o755);
        let plain = write_script(dir.path(), "plain", 0o644);

        assert!(is_executable(&runnable));
        assert!(!is_executable(&plain));
        assert!(!is_executable(dir.path()));
        assert!(!is_executable(&dir.path().join("missing")));
    }

    #[cfg(unix)]
    #[test]
    fn find_program_searches_dirs_in_order() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        write_script(first.path(), "tool", 0o644);
        let found = write_script(second.path(), "tool", 0o755);

        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(find_program_by_name_in("tool", &dirs), Some(found));
        assert_eq!(find_program_by_name_in("absent", &dirs), None);
    }

    #[test]
    fn find_program_keeps_paths_with_separators() {
        let dirs: Vec<PathBuf> = Vec::new();
        assert_eq!(
            find_program_by_name_in("./bin/tool", &dirs),
            Some(PathBuf::from("./bin/tool"))
        );
        assert_eq!(find_program_by_name_in("", &dirs), None);
    }

    #[test]
    fn options_builder_sets_streams_by_index() {
        let opts = ExecOptions::new()
            .with_redirect(StdStream::Stderr, Redirect::file("err.log"))
            .with_memory_limit_mb(64);
        assert_eq!(opts.redirect(StdStream::Stdin), &Redirect::Inherit);
        assert_eq!(opts.redirect(StdStream::Stderr), &Redirect::file("err.log"));
        assert_eq!(opts.memory_limit_mb, 64);
    }
}
