//! SSH transport built on the system `ssh` and `scp` binaries.
//!
//! Password authentication and key passphrases go through `sshpass -e` (the secret is passed in
//! the `SSHPASS` environment variable, never on the command line). `ssh` exits with 255 when the
//! connection itself fails; that status is always reported as a connectivity fault.

use std::{
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use tracing::{debug, instrument};

use super::{run_helper, CancelToken, ExecutionProvider, Session, SupervisedProcess};
use crate::{
    error::ExecutionFault,
    worker_pool::{Credentials, Worker},
};

const SSH_TRANSPORT_ERROR: i32 = 255;

/// Opens SSH sessions; each session works in `<remote_root>/<workspace>` on the worker.
#[derive(Debug, Clone)]
pub struct SshProvider {
    remote_root: String,
    connect_timeout: Duration,
    transfer_timeout: Duration,
}

impl SshProvider {
    /// Provider whose sessions live under `remote_root` on every worker.
    pub fn new(remote_root: impl Into<String>) -> SshProvider {
        SshProvider {
            remote_root: remote_root.into(),
            connect_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(300),
        }
    }

    /// Time allowed to establish a connection.
    pub fn with_connect_timeout(self, timeout: Duration) -> SshProvider {
        SshProvider {
            connect_timeout: timeout,
            ..self
        }
    }

    /// Time allowed for one push or pull.
    pub fn with_transfer_timeout(self, timeout: Duration) -> SshProvider {
        SshProvider {
            transfer_timeout: timeout,
            ..self
        }
    }
}

impl Default for SshProvider {
    fn default() -> Self {
        SshProvider::new("/tmp/contest-cluster")
    }
}

impl ExecutionProvider for SshProvider {
    #[instrument(skip(self), fields(worker = worker.hostname()))]
    fn connect(&self, worker: &Worker, workspace: &str) -> Result<Box<dyn Session>, ExecutionFault> {
        let session = SshSession {
            worker: worker.clone(),
            workspace: format!("{}/{}", self.remote_root, workspace),
            connect_timeout: self.connect_timeout,
            transfer_timeout: self.transfer_timeout,
        };
        let mkdir = session.ssh(&format!("mkdir -p {}", quote(&session.workspace)));
        run_helper(mkdir, "remote workspace creation", session.helper_timeout())?;
        debug!(workspace = session.workspace, "connected");
        Ok(Box::new(session))
    }
}

struct SshSession {
    worker: Worker,
    workspace: String,
    connect_timeout: Duration,
    transfer_timeout: Duration,
}

impl SshSession {
    fn helper_timeout(&self) -> Duration {
        self.connect_timeout * 3
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.worker.username(), self.worker.hostname())
    }

    fn remote_path(&self, relative: &str) -> String {
        format!("{}/{}", self.workspace, relative)
    }

    /// Base command for `program` (ssh or scp) with credentials and common options.
    fn base(&self, program: &str) -> Command {
        let (mut cmd, key) = match self.worker.credentials() {
            Credentials::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.env("SSHPASS", password).arg("-e").arg(program);
                (cmd, None)
            }
            Credentials::Key {
                path,
                passphrase: Some(passphrase),
            } => {
                let mut cmd = Command::new("sshpass");
                cmd.env("SSHPASS", passphrase)
                    .args(["-P", "passphrase", "-e"])
                    .arg(program);
                (cmd, Some(path.clone()))
            }
            Credentials::Key {
                path,
                passphrase: None,
            } => {
                let mut cmd = Command::new(program);
                cmd.args(["-o", "BatchMode=yes"]);
                (cmd, Some(path.clone()))
            }
        };
        if let Some(key) = key {
            cmd.arg("-i").arg(key);
        }
        let connect_timeout = format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1));
        cmd.args(["-o", "StrictHostKeyChecking=no", "-o", connect_timeout.as_str()]);
        cmd
    }

    fn ssh(&self, remote_command: &str) -> Command {
        let mut cmd = self.base("ssh");
        cmd.arg(self.destination()).arg(remote_command);
        cmd
    }

    /// scp does not create missing parents, so nested targets get a `mkdir -p` first.
    fn push_commands(&self, local: &Path, remote: &str) -> Vec<(Command, String)> {
        let mut commands = vec![];
        if let Some((parent, _)) = remote.rsplit_once('/') {
            let mkdir = self.ssh(&format!("mkdir -p {}", quote(&self.remote_path(parent))));
            commands.push((mkdir, format!("creation of remote directory {parent}")));
        }
        let mut scp = self.base("scp");
        scp.arg("-r")
            .arg(local)
            .arg(format!("{}:{}", self.destination(), self.remote_path(remote)));
        commands.push((scp, format!("push of {}", local.display())));
        commands
    }
}

impl Session for SshSession {
    fn push(&mut self, local: &Path, remote: &str) -> Result<(), ExecutionFault> {
        for (cmd, what) in self.push_commands(local, remote) {
            run_helper(cmd, &what, self.transfer_timeout)?;
        }
        Ok(())
    }

    fn execute(
        &mut self,
        command: &str,
        log: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<i32, ExecutionFault> {
        let remote = format!("cd {} && {}", quote(&self.workspace), command);
        let process = SupervisedProcess::spawn(self.ssh(&remote), Some(log))?;
        let status = process.wait(timeout, cancel)?;
        match status.code() {
            Some(SSH_TRANSPORT_ERROR) => Err(ExecutionFault::Connectivity(format!(
                "ssh transport error on {}",
                self.worker.hostname()
            ))),
            Some(code) => Ok(code),
            None => Err(ExecutionFault::Connectivity(format!(
                "remote execution on {} killed by a signal",
                self.worker.hostname()
            ))),
        }
    }

    fn pull(&mut self, remote: &str, local: &Path) -> Result<(), ExecutionFault> {
        let mut cmd = self.base("scp");
        cmd.arg(format!("{}:{}", self.destination(), self.remote_path(remote)))
            .arg(PathBuf::from(local));
        run_helper(cmd, &format!("pull of {remote}"), self.transfer_timeout)
    }

    fn disconnect(self: Box<Self>) -> Result<(), ExecutionFault> {
        let cleanup = self.ssh(&format!("rm -rf {}", quote(&self.workspace)));
        run_helper(cleanup, "remote cleanup", self.helper_timeout())
    }
}

/// Single-quotes `s` for a POSIX shell.
pub(crate) fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
