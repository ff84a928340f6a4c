//! Remote execution capability consumed by the scheduler.
//!
//! The scheduler only knows [`ExecutionProvider`] and [`Session`]; concrete transports live in
//! [`ssh`] (password or key-based SSH through the system `ssh`/`scp` binaries) and [`local`]
//! (the coordinating host itself).

use std::{
    fs::File,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{trace, warn};

use crate::{error::ExecutionFault, worker_pool::Worker};

pub mod local;
pub mod ssh;

pub use local::LocalProvider;
pub use ssh::SshProvider;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Opens sessions on workers.
pub trait ExecutionProvider: Send + Sync {
    /// Connects to `worker` and prepares a private working directory for one match.
    fn connect(&self, worker: &Worker, workspace: &str) -> Result<Box<dyn Session>, ExecutionFault>;
}

/// One connection to one worker, scoped to one match attempt.
///
/// Remote paths are relative to the session workspace.
pub trait Session: Send {
    /// Copies a local file or directory into the workspace.
    fn push(&mut self, local: &Path, remote: &str) -> Result<(), ExecutionFault>;

    /// Runs `command` inside the workspace, streaming stdout and stderr into `log`.
    ///
    /// Exceeding `timeout` kills the command and yields a connectivity fault; a forced
    /// cancellation yields [`ExecutionFault::Cancelled`].
    fn execute(
        &mut self,
        command: &str,
        log: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<i32, ExecutionFault>;

    /// Copies a workspace file back to `local`.
    fn pull(&mut self, remote: &str, local: &Path) -> Result<(), ExecutionFault>;

    /// Removes the workspace and closes the connection.
    fn disconnect(self: Box<Self>) -> Result<(), ExecutionFault>;
}

const RUNNING: u8 = 0;
const STOP_DISPATCH: u8 = 1;
const FORCE: u8 = 2;

/// Operator-level cancellation shared by the scheduler and every in-flight match.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Stop dispatching; in-flight matches run to completion.
    pub fn cancel(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, STOP_DISPATCH, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Stop dispatching and kill in-flight matches.
    pub fn force_cancel(&self) {
        self.state.store(FORCE, Ordering::SeqCst);
    }

    /// True once any cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }

    /// True if in-flight matches must be killed.
    pub fn is_forced(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FORCE
    }
}

/// A child process that is killed if it is dropped before being reaped.
#[derive(Debug)]
pub(crate) struct SupervisedProcess {
    child: Child,
    reaped: bool,
}

impl SupervisedProcess {
    /// Spawns `cmd` with no stdin, stdout and stderr going to `log` (or discarded).
    pub(crate) fn spawn(mut cmd: Command, log: Option<&Path>) -> Result<Self, ExecutionFault> {
        cmd.stdin(Stdio::null());
        match log {
            Some(path) => {
                let out = File::create(path).map_err(|e| {
                    ExecutionFault::Connectivity(format!(
                        "cannot create log file {}: {e}",
                        path.display()
                    ))
                })?;
                let err = out.try_clone().map_err(|e| {
                    ExecutionFault::Connectivity(format!("cannot share log file handle: {e}"))
                })?;
                cmd.stdout(out).stderr(err);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::piped());
            }
        }
        let program = format!("{:?}", cmd.get_program());
        let child = cmd.spawn().map_err(|e| {
            ExecutionFault::Connectivity(format!("command {program} could not be started: {e}"))
        })?;
        Ok(SupervisedProcess {
            child,
            reaped: false,
        })
    }

    /// Waits for the process, killing it on timeout or forced cancellation.
    pub(crate) fn wait(
        mut self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExitStatus, ExecutionFault> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.reaped = true;
                    return Ok(status);
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(ExecutionFault::Connectivity(format!(
                        "cannot wait for process: {e}"
                    )))
                }
            }
            if cancel.is_forced() {
                self.kill();
                return Err(ExecutionFault::Cancelled);
            }
            if Instant::now() >= deadline {
                self.kill();
                return Err(ExecutionFault::Connectivity(format!(
                    "execution timed out after {timeout:?}"
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Waits and returns the captured stderr, for short helper commands.
    pub(crate) fn wait_with_stderr(
        mut self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<(ExitStatus, String), ExecutionFault> {
        let stderr = self.child.stderr.take();
        let status = self.wait(timeout, cancel)?;
        let mut text = String::new();
        if let Some(mut stderr) = stderr {
            let _ = std::io::Read::read_to_string(&mut stderr, &mut text);
        }
        Ok((status, text.trim().to_owned()))
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!("could not kill process {}: {e}", self.child.id());
        }
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        if !self.reaped {
            trace!("killing unreaped process {}", self.child.id());
            self.kill();
        }
    }
}

/// Runs a short helper command (mkdir, copy, cleanup) and maps failures to connectivity faults.
pub(crate) fn run_helper(cmd: Command, what: &str, timeout: Duration) -> Result<(), ExecutionFault> {
    let process = SupervisedProcess::spawn(cmd, None)?;
    let (status, stderr) = process.wait_with_stderr(timeout, &CancelToken::new())?;
    if status.success() {
        Ok(())
    } else {
        Err(ExecutionFault::Connectivity(format!(
            "{what} failed ({status}): {stderr}"
        )))
    }
}
