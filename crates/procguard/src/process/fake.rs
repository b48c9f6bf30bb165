//! Fake process backend for testing.
//!
//! Records every operation instead of touching the OS, so launcher and waiter
//! failure paths can be exercised deterministically.

use super::{ChildProcess, LaunchPlan, NativeExit, ProcessHandle, ProcessOps, StdioSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FAKE_KILL_SIGNAL: i32 = 9;
const FIRST_FAKE_PID: u32 = 4000;

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Spawn {
        program: PathBuf,
        argv: Vec<String>,
        command_line: String,
        env: Option<Vec<(String, String)>>,
        /// stdin, stdout, stderr: true when a file was handed over.
        redirected: [bool; 3],
    },
    MemoryLimit {
        pid: u32,
        limit_mb: u64,
    },
    Kill {
        pid: u32,
    },
    Wait {
        pid: u32,
    },
    Detach {
        pid: u32,
    },
}

#[derive(Debug, Default)]
struct FakeProcessState {
    operations: Vec<Operation>,
    running: usize,
    spawned: u32,
}

#[derive(Debug, Clone, Copy)]
struct Behavior {
    fail_spawn: bool,
    fail_memory_limit: bool,
    hang: bool,
    exits_before_kill: bool,
    exit: NativeExit,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            fail_spawn: false,
            fail_memory_limit: false,
            hang: false,
            exits_before_kill: false,
            exit: NativeExit::Code(0),
        }
    }
}

/// Backend that records operations and simulates children.
#[derive(Debug, Clone, Default)]
pub struct FakeProcess {
    state: Arc<Mutex<FakeProcessState>>,
    behavior: Behavior,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every spawn fails with `NotFound`.
    pub fn failing_spawn(mut self) -> Self {
        self.behavior.fail_spawn = true;
        self
    }

    pub fn failing_memory_limit(mut self) -> Self {
        self.behavior.fail_memory_limit = true;
        self
    }

    /// Children never exit by themselves.
    pub fn hanging(mut self) -> Self {
        self.behavior.hang = true;
        self
    }

    /// Kill reports an error because the child finished just before it.
    pub fn exits_before_kill(mut self) -> Self {
        self.behavior.exits_before_kill = true;
        self
    }

    pub fn with_exit(mut self, exit: NativeExit) -> Self {
        self.behavior.exit = exit;
        self
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn operation_count(&self) -> usize {
        self.state.lock().unwrap().operations.len()
    }

    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state.lock().unwrap().operations.iter().any(check)
    }

    /// True while any simulated child has not been collected.
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running > 0
    }

    /// Spawn a simulated child directly, bypassing the launcher checks.
    pub fn spawn_handle(&self) -> ProcessHandle {
        let plan = LaunchPlan {
            program: Path::new("fake"),
            argv: Vec::new(),
            command_line: Vec::new(),
            env: None,
        };
        let child = self
            .spawn(&plan, StdioSet::default())
            .expect("fake spawn configured to fail");
        ProcessHandle::new(child)
    }

    fn record_operation(&self, op: Operation) {
        self.state.lock().unwrap().operations.push(op);
    }
}

impl ProcessOps for FakeProcess {
    fn spawn(&self, plan: &LaunchPlan<'_>, stdio: StdioSet) -> io::Result<Box<dyn ChildProcess>> {
        if self.behavior.fail_spawn {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fake spawn failure"));
        }

        let env = plan.env.as_ref().map(|block| {
            block
                .entries()
                .map(|(k, v)| {
                    (
                        String::from_utf8_lossy(k).into_owned(),
                        String::from_utf8_lossy(v).into_owned(),
                    )
                })
                .collect()
        });
        let mut state = self.state.lock().unwrap();
        state.operations.push(Operation::Spawn {
            program: plan.program.to_path_buf(),
            argv: plan
                .argv
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
            command_line: String::from_utf8_lossy(&plan.command_line).into_owned(),
            env,
            redirected: [
                stdio.stdin.is_some(),
                stdio.stdout.is_some(),
                stdio.stderr.is_some(),
            ],
        });
        state.running += 1;
        state.spawned += 1;
        let pid = FIRST_FAKE_PID + state.spawned;

        Ok(Box::new(FakeChild {
            pid,
            state: Arc::clone(&self.state),
            behavior: self.behavior,
            killed: false,
            finished: false,
        }))
    }

    fn apply_memory_limit(&self, child: &dyn ChildProcess, limit_mb: u64) -> io::Result<()> {
        self.record_operation(Operation::MemoryLimit {
            pid: child.pid(),
            limit_mb,
        });
        if self.behavior.fail_memory_limit {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "fake memory limit failure",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FakeChild {
    pid: u32,
    state: Arc<Mutex<FakeProcessState>>,
    behavior: Behavior,
    killed: bool,
    finished: bool,
}

impl FakeChild {
    fn record(&self, op: Operation) {
        self.state.lock().unwrap().operations.push(op);
    }

    fn still_running(&self) -> bool {
        self.behavior.hang && !self.killed && !self.finished
    }

    fn finish(&mut self) -> NativeExit {
        if !self.finished {
            self.finished = true;
            let mut state = self.state.lock().unwrap();
            state.running = state.running.saturating_sub(1);
        }
        if self.killed {
            NativeExit::Signaled(FAKE_KILL_SIGNAL)
        } else {
            self.behavior.exit
        }
    }
}

impl ChildProcess for FakeChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn wait(&mut self) -> io::Result<NativeExit> {
        self.record(Operation::Wait { pid: self.pid });
        Ok(self.finish())
    }

    fn wait_timeout(&mut self, _timeout: Duration) -> io::Result<Option<NativeExit>> {
        if self.still_running() {
            return Ok(None);
        }
        self.wait().map(Some)
    }

    fn try_wait(&mut self) -> io::Result<Option<NativeExit>> {
        if self.still_running() {
            return Ok(None);
        }
        Ok(Some(self.finish()))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.record(Operation::Kill { pid: self.pid });
        if self.behavior.exits_before_kill {
            self.finish();
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "process already exited",
            ));
        }
        self.killed = true;
        Ok(())
    }

    fn detach(mut self: Box<Self>) {
        self.record(Operation::Detach { pid: self.pid });
        self.finish();
    }
}
