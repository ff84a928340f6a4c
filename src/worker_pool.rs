//! Remote hosts and their match slots.
//!
//! The pool is the only state mutated by several in-flight matches at once, so every counter
//! lives behind one mutex. A slot is represented by a [`SlotGuard`]: dropping the guard gives the
//! slot back, whatever path the owning task takes (success, fault, timeout or panic).

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, trace};

use crate::error::ContestError;

/// How the coordinator authenticates on a worker. Set once at startup.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Password authentication.
    Password(String),
    /// Key-based authentication.
    Key {
        /// Private key file.
        path: PathBuf,
        /// Passphrase of the private key, if it has one.
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => write!(f, "Password(***)"),
            Credentials::Key { path, passphrase } => write!(
                f,
                "Key({}, passphrase: {})",
                path.display(),
                if passphrase.is_some() { "***" } else { "none" }
            ),
        }
    }
}

/// A remote host able to run matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    hostname: String,
    username: String,
    credentials: Credentials,
    capacity: usize,
}

impl Worker {
    /// Describes a worker. `capacity` is the number of concurrent match slots.
    pub fn new(
        hostname: impl Into<String>,
        username: impl Into<String>,
        credentials: Credentials,
        capacity: usize,
    ) -> Worker {
        Worker {
            hostname: hostname.into(),
            username: username.into(),
            credentials,
            capacity,
        }
    }

    /// The coordinating machine itself, one slot per physical CPU.
    pub fn localhost() -> Worker {
        Worker::new(
            "localhost",
            std::env::var("USER").unwrap_or_default(),
            Credentials::Password(String::new()),
            num_cpus::get_physical().max(1),
        )
    }

    /// Host name (also the worker identity inside the pool).
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Login user.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Authentication material.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Number of concurrent match slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Display for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} ({} slots)", self.username, self.hostname, self.capacity)
    }
}

#[derive(Debug, Deserialize)]
struct WorkersFile {
    workers: Vec<WorkerEntry>,
}

#[derive(Debug, Deserialize)]
struct WorkerEntry {
    hostname: String,
    username: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    private_key_file: Option<PathBuf>,
    #[serde(default)]
    private_key_password: Option<String>,
    no_cpu: usize,
}

impl TryFrom<WorkerEntry> for Worker {
    type Error = ContestError;

    fn try_from(entry: WorkerEntry) -> Result<Self, Self::Error> {
        if entry.no_cpu == 0 {
            return Err(ContestError::config(format!(
                "worker '{}' declares no CPU",
                entry.hostname
            )));
        }
        let credentials = match (entry.private_key_file, entry.password) {
            (Some(path), _) => Credentials::Key {
                path,
                passphrase: entry.private_key_password.filter(|p| !p.is_empty()),
            },
            (None, Some(password)) => Credentials::Password(password),
            (None, None) => {
                return Err(ContestError::config(format!(
                    "worker '{}' has neither password nor private key",
                    entry.hostname
                )))
            }
        };
        Ok(Worker::new(
            entry.hostname,
            entry.username,
            credentials,
            entry.no_cpu,
        ))
    }
}

/// Reads a worker roster file: `{"workers": [{"hostname", "username", "password",
/// "private_key_file", "private_key_password", "no_cpu"}, ...]}`.
pub fn load_workers(path: &Path) -> anyhow::Result<Vec<Worker>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read workers file '{}'", path.display()))?;
    let file: WorkersFile = serde_json::from_str(&content)
        .with_context(|| format!("malformed workers file '{}'", path.display()))?;
    let workers = file
        .workers
        .into_iter()
        .map(Worker::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    if workers.is_empty() {
        return Err(ContestError::config("workers file lists no worker").into());
    }
    info!(workers = ?workers.iter().map(Worker::to_string).collect::<Vec<_>>());
    Ok(workers)
}

#[derive(Debug)]
struct PoolState {
    in_use: Vec<usize>,
}

#[derive(Debug)]
struct PoolInner {
    workers: Vec<Worker>,
    state: Mutex<PoolState>,
    released: Condvar,
}

/// The set of workers and their live capacity. Cheap to clone (shared state).
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Pool over `workers`. Duplicate host names are rejected.
    pub fn new(workers: Vec<Worker>) -> Result<WorkerPool, ContestError> {
        if workers.is_empty() {
            return Err(ContestError::config("worker pool is empty"));
        }
        for (i, worker) in workers.iter().enumerate() {
            if worker.capacity == 0 {
                return Err(ContestError::config(format!(
                    "worker '{}' has no capacity",
                    worker.hostname
                )));
            }
            if workers[..i].iter().any(|w| w.hostname == worker.hostname) {
                return Err(ContestError::config(format!(
                    "worker '{}' declared twice",
                    worker.hostname
                )));
            }
        }
        let in_use = vec![0; workers.len()];
        Ok(WorkerPool {
            inner: Arc::new(PoolInner {
                workers,
                state: Mutex::new(PoolState { in_use }),
                released: Condvar::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // counters stay consistent even if a holder panicked: every update is a single add/sub
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes a slot on the least loaded worker, if any is free.
    pub fn acquire_slot(&self) -> Option<SlotGuard> {
        self.acquire_slot_avoiding(None)
    }

    /// Like [`acquire_slot`](Self::acquire_slot) but prefers any worker other than `avoid`;
    /// falls back to `avoid` only when nothing else is free.
    pub fn acquire_slot_avoiding(&self, avoid: Option<&str>) -> Option<SlotGuard> {
        let mut state = self.lock();
        let free = |i: usize, state: &PoolState| state.in_use[i] < self.inner.workers[i].capacity;

        let pick = |state: &PoolState, allow_avoided: bool| -> Option<usize> {
            (0..self.inner.workers.len())
                .filter(|&i| free(i, state))
                .filter(|&i| allow_avoided || Some(self.inner.workers[i].hostname.as_str()) != avoid)
                // least loaded relative to capacity, then declaration order
                .min_by(|&a, &b| {
                    let load_a = state.in_use[a] * self.inner.workers[b].capacity;
                    let load_b = state.in_use[b] * self.inner.workers[a].capacity;
                    load_a.cmp(&load_b).then(a.cmp(&b))
                })
        };

        let index = pick(&*state, false).or_else(|| pick(&*state, true))?;
        state.in_use[index] += 1;
        trace!(
            worker = self.inner.workers[index].hostname,
            in_use = state.in_use[index],
            "slot acquired"
        );
        Some(SlotGuard {
            pool: self.clone(),
            index,
        })
    }

    /// Gives a slot back. Equivalent to dropping the guard.
    pub fn release_slot(&self, slot: SlotGuard) {
        drop(slot);
    }

    fn release_index(&self, index: usize) {
        let mut state = self.lock();
        state.in_use[index] = state.in_use[index].saturating_sub(1);
        trace!(
            worker = self.inner.workers[index].hostname,
            in_use = state.in_use[index],
            "slot released"
        );
        drop(state);
        self.inner.released.notify_all();
    }

    /// Blocks until some slot is released or `timeout` elapses. Returns true if a slot is free.
    pub fn wait_for_release(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .inner
            .released
            .wait_timeout_while(state, timeout, |state| !self.has_free_slot(state))
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.has_free_slot(&state)
    }

    fn has_free_slot(&self, state: &PoolState) -> bool {
        state
            .in_use
            .iter()
            .zip(&self.inner.workers)
            .any(|(used, worker)| *used < worker.capacity)
    }

    /// Slots currently held on `hostname`.
    pub fn in_use(&self, hostname: &str) -> usize {
        let state = self.lock();
        self.inner
            .workers
            .iter()
            .position(|w| w.hostname == hostname)
            .map(|i| state.in_use[i])
            .unwrap_or(0)
    }

    /// Free slots over the whole pool.
    pub fn available(&self) -> usize {
        let state = self.lock();
        state
            .in_use
            .iter()
            .zip(&self.inner.workers)
            .map(|(used, worker)| worker.capacity - used)
            .sum()
    }

    /// Sum of all capacities.
    pub fn total_capacity(&self) -> usize {
        self.inner.workers.iter().map(Worker::capacity).sum()
    }

    /// Declared workers.
    pub fn workers(&self) -> &[Worker] {
        &self.inner.workers
    }
}

/// A held slot on one worker. The slot is released when the guard is dropped.
#[derive(Debug)]
pub struct SlotGuard {
    pool: WorkerPool,
    index: usize,
}

impl SlotGuard {
    /// Worker owning the slot.
    pub fn worker(&self) -> &Worker {
        &self.pool.inner.workers[self.index]
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release_index(self.index);
    }
}
