//! Process runtime seam.
//!
//! Containers spawn their supervised process through [`ProcessRuntime`], so
//! lifecycle logic can be exercised against [`MockRuntime`] without forking.
//! [`DirectRuntime`] is the real implementation on tokio's process support.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ExecutorError, ExecutorResult};
use mesh_proto::ExitReason;

/// What to spawn: program, argv, and a fully-resolved environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Supervisor binary.
    pub program: PathBuf,

    /// Arguments, ending with the container directory.
    pub args: Vec<String>,

    /// Complete environment for the child (nothing else is inherited).
    pub env: HashMap<String, String>,
}

/// A spawned process: its pid, a way to signal it, and a one-shot exit
/// observation.
pub struct SpawnedProcess {
    /// Child pid.
    pub pid: u32,

    /// Signal delivery handle.
    pub signaller: Box<dyn ProcessSignaller>,

    /// Fires exactly once when the process terminates.
    pub exit: oneshot::Receiver<ExitReason>,
}

/// Delivers signals to a spawned process.
pub trait ProcessSignaller: Send + Sync {
    /// Sends a signal. Returns `Ok(false)` when the process is already
    /// gone (no further exit event should be expected from the signal).
    fn signal(&self, signal: Signal) -> ExecutorResult<bool>;
}

/// Spawns supervised processes.
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    /// Spawns the process described by `spec`.
    async fn spawn(&self, spec: &SpawnSpec) -> ExecutorResult<SpawnedProcess>;
}

/// Real process runtime on tokio + POSIX signals.
#[derive(Debug, Default)]
pub struct DirectRuntime;

#[async_trait]
impl ProcessRuntime for DirectRuntime {
    async fn spawn(&self, spec: &SpawnSpec) -> ExecutorResult<SpawnedProcess> {
        let mut command = tokio::process::Command::new(&spec.program);
        command.args(&spec.args).env_clear().envs(&spec.env);

        let mut child = command.spawn().map_err(ExecutorError::Spawn)?;
        let pid = child.id().ok_or_else(|| {
            ExecutorError::Spawn(io::Error::new(io::ErrorKind::Other, "child has no pid"))
        })?;

        debug!(pid = pid, program = %spec.program.display(), "spawned");

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => exit_reason(status),
                Err(e) => {
                    debug!(error = %e, "wait failed");
                    ExitReason::Code(-1)
                }
            };
            let _ = exit_tx.send(reason);
        });

        Ok(SpawnedProcess {
            pid,
            signaller: Box::new(PidSignaller { pid }),
            exit: exit_rx,
        })
    }
}

struct PidSignaller {
    pid: u32,
}

impl ProcessSignaller for PidSignaller {
    #[allow(clippy::as_conversions, clippy::cast_possible_wrap)]
    fn signal(&self, signal: Signal) -> ExecutorResult<bool> {
        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(ExecutorError::Signal(io::Error::from_raw_os_error(
                e as i32,
            ))),
        }
    }
}

/// Maps an exit status to its wire reason: signal name or exit code.
#[allow(clippy::as_conversions)]
fn exit_reason(status: std::process::ExitStatus) -> ExitReason {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signo) = status.signal() {
        return match Signal::try_from(signo) {
            Ok(sig) => ExitReason::signal(sig.as_str()),
            Err(_) => ExitReason::Code(128 + signo),
        };
    }
    ExitReason::Code(status.code().unwrap_or(-1))
}

/// Scripted runtime for tests, mirroring the mock seams the deployment
/// manager tests use.
///
/// Records every [`SpawnSpec`] and hands back [`MockHandle`]s that let a
/// test drive exits. Delivered signals terminate the mock process with the
/// signal's name as reason, like a default-disposition POSIX process.
#[derive(Debug, Default)]
pub struct MockRuntime {
    next_pid: AtomicU32,
    inner: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    spawns: Vec<SpawnSpec>,
    procs: Vec<MockHandle>,
}

impl MockRuntime {
    /// Creates a mock runtime; pids are assigned from 9876 upward.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(9876),
            inner: Mutex::new(MockState::default()),
        }
    }

    /// All spawn specs seen so far, in order.
    #[must_use]
    pub fn spawns(&self) -> Vec<SpawnSpec> {
        self.inner.lock().expect("mock lock").spawns.clone()
    }

    /// Number of spawns seen so far.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.inner.lock().expect("mock lock").spawns.len()
    }

    /// Handle for the `n`th spawned process.
    #[must_use]
    pub fn proc(&self, n: usize) -> Option<MockHandle> {
        self.inner.lock().expect("mock lock").procs.get(n).cloned()
    }

    /// Handle for the most recent spawned process.
    #[must_use]
    pub fn last_proc(&self) -> Option<MockHandle> {
        self.inner.lock().expect("mock lock").procs.last().cloned()
    }
}

#[async_trait]
impl ProcessRuntime for MockRuntime {
    async fn spawn(&self, spec: &SpawnSpec) -> ExecutorResult<SpawnedProcess> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (exit_tx, exit_rx) = oneshot::channel();

        let handle = MockHandle {
            pid,
            shared: Arc::new(MockShared {
                exit_tx: Mutex::new(Some(exit_tx)),
            }),
        };

        {
            let mut state = self.inner.lock().expect("mock lock");
            state.spawns.push(spec.clone());
            state.procs.push(handle.clone());
        }

        Ok(SpawnedProcess {
            pid,
            signaller: Box::new(MockSignaller {
                shared: handle.shared.clone(),
            }),
            exit: exit_rx,
        })
    }
}

/// Test-side control over one mock process.
#[derive(Debug, Clone)]
pub struct MockHandle {
    pid: u32,
    shared: Arc<MockShared>,
}

#[derive(Debug)]
struct MockShared {
    exit_tx: Mutex<Option<oneshot::Sender<ExitReason>>>,
}

impl MockHandle {
    /// The mock process pid.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Terminates the mock process with the given reason. Returns `false`
    /// if it had already exited.
    pub fn exit(&self, reason: ExitReason) -> bool {
        match self.shared.exit_tx.lock().expect("mock lock").take() {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }

    /// Whether the mock process is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.exit_tx.lock().expect("mock lock").is_some()
    }
}

struct MockSignaller {
    shared: Arc<MockShared>,
}

impl ProcessSignaller for MockSignaller {
    fn signal(&self, signal: Signal) -> ExecutorResult<bool> {
        match self.shared.exit_tx.lock().expect("mock lock").take() {
            Some(tx) => {
                let _ = tx.send(ExitReason::signal(signal.as_str()));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
