//! Runs matches on the coordinating host, in a scratch directory per session.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use tracing::debug;

use super::{CancelToken, ExecutionProvider, Session, SupervisedProcess};
use crate::{error::ExecutionFault, worker_pool::Worker};

/// Provider for single-machine contests. Every worker is treated as the local host.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Sessions are created under `root`.
    pub fn new(root: impl Into<PathBuf>) -> LocalProvider {
        LocalProvider { root: root.into() }
    }
}

impl ExecutionProvider for LocalProvider {
    fn connect(&self, worker: &Worker, workspace: &str) -> Result<Box<dyn Session>, ExecutionFault> {
        let dir = self.root.join(workspace);
        fs::create_dir_all(&dir).map_err(|e| {
            ExecutionFault::Connectivity(format!("cannot create {}: {e}", dir.display()))
        })?;
        debug!(worker = worker.hostname(), dir = %dir.display(), "local session");
        Ok(Box::new(LocalSession { dir }))
    }
}

struct LocalSession {
    dir: PathBuf,
}

fn copy_recursively(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)?;
    }
    Ok(())
}

impl Session for LocalSession {
    fn push(&mut self, local: &Path, remote: &str) -> Result<(), ExecutionFault> {
        copy_recursively(local, &self.dir.join(remote)).map_err(|e| {
            ExecutionFault::Connectivity(format!("push of {} failed: {e}", local.display()))
        })
    }

    fn execute(
        &mut self,
        command: &str,
        log: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<i32, ExecutionFault> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.dir);
        let status = SupervisedProcess::spawn(cmd, Some(log))?.wait(timeout, cancel)?;
        status.code().ok_or_else(|| {
            ExecutionFault::Connectivity("local execution killed by a signal".to_owned())
        })
    }

    fn pull(&mut self, remote: &str, local: &Path) -> Result<(), ExecutionFault> {
        copy_recursively(&self.dir.join(remote), local)
            .map_err(|e| ExecutionFault::Connectivity(format!("pull of {remote} failed: {e}")))
    }

    fn disconnect(self: Box<Self>) -> Result<(), ExecutionFault> {
        fs::remove_dir_all(&self.dir).map_err(|e| {
            ExecutionFault::Connectivity(format!("cannot remove {}: {e}", self.dir.display()))
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn full_session() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let input = scratch.path().join("team");
        fs::create_dir(&input).unwrap();
        fs::write(input.join("agent.py"), "print('hi')").unwrap();

        let provider = LocalProvider::new(root.path());
        let mut session = provider.connect(&Worker::localhost(), "m1").unwrap();
        session.push(&input, "red").unwrap();

        let log = scratch.path().join("m1.log");
        let code = session
            .execute(
                "cat red/agent.py && echo replay > game.replay",
                &log,
                Duration::from_secs(10),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(fs::read_to_string(&log).unwrap().trim(), "print('hi')");

        let replay = scratch.path().join("out.replay");
        session.pull("game.replay", &replay).unwrap();
        assert_eq!(fs::read_to_string(&replay).unwrap().trim(), "replay");

        session.disconnect().unwrap();
        assert!(!root.path().join("m1").exists());
    }
}
