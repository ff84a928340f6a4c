//! In-memory execution provider whose behaviour is scripted per match.

use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use contest_cluster::prelude::*;

/// What the fake engine does for one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Behaviour {
    /// Red-perspective score.
    Score(i32),
    /// The red agent crashes.
    RedCrash,
    /// The host cannot be reached.
    Unreachable,
    /// Unreachable for the first `n` attempts, then a red win.
    FlakyThenRedWin(usize),
    /// Red wins by one point after the given number of milliseconds.
    Slow(u64),
    /// Never finishes.
    Hang,
    /// The session panics.
    Panic,
}

#[derive(Default)]
struct HostLoad {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Default)]
struct Shared {
    script: HashMap<String, Behaviour>,
    attempts: Mutex<HashMap<String, usize>>,
    /// (match file stem, host) of every connection attempt, in order.
    connections: Mutex<Vec<(String, String)>>,
    executions: Mutex<Vec<String>>,
    load: Mutex<HashMap<String, Arc<HostLoad>>>,
}

/// Provider running the script. Unscripted matches are won by red by one point.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    shared: Arc<Shared>,
    delay: Duration,
}

#[allow(dead_code)]
impl ScriptedProvider {
    pub fn new(script: HashMap<String, Behaviour>) -> ScriptedProvider {
        ScriptedProvider {
            shared: Arc::new(Shared {
                script,
                ..Default::default()
            }),
            delay: Duration::from_millis(20),
        }
    }

    pub fn executions(&self) -> Vec<String> {
        self.shared.executions.lock().unwrap().clone()
    }

    pub fn connections(&self) -> Vec<(String, String)> {
        self.shared.connections.lock().unwrap().clone()
    }

    pub fn peak_load(&self, host: &str) -> usize {
        self.shared
            .load
            .lock()
            .unwrap()
            .get(host)
            .map(|l| l.peak.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn current_load(&self, host: &str) -> usize {
        self.shared
            .load
            .lock()
            .unwrap()
            .get(host)
            .map(|l| l.current.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn load(&self, host: &str) -> Arc<HostLoad> {
        Arc::clone(
            self.shared
                .load
                .lock()
                .unwrap()
                .entry(host.to_owned())
                .or_default(),
        )
    }
}

/// Match file stem out of a workspace named `<prefix>_<stem>_a<attempt>`.
fn stem_of(workspace: &str) -> String {
    let without_attempt = workspace.rsplit_once("_a").map_or(workspace, |(s, _)| s);
    without_attempt
        .split_once('_')
        .map_or(without_attempt, |(_, s)| s)
        .to_owned()
}

impl ExecutionProvider for ScriptedProvider {
    fn connect(&self, worker: &Worker, workspace: &str) -> Result<Box<dyn Session>, ExecutionFault> {
        let stem = stem_of(workspace);
        self.shared
            .connections
            .lock()
            .unwrap()
            .push((stem.clone(), worker.hostname().to_owned()));
        let attempt = {
            let mut attempts = self.shared.attempts.lock().unwrap();
            let n = attempts.entry(stem.clone()).or_default();
            *n += 1;
            *n
        };
        let behaviour = self
            .shared
            .script
            .get(&stem)
            .copied()
            .unwrap_or(Behaviour::Score(1));
        match behaviour {
            Behaviour::Unreachable => {
                return Err(ExecutionFault::Connectivity(format!(
                    "{} unreachable",
                    worker.hostname()
                )))
            }
            Behaviour::FlakyThenRedWin(n) if attempt <= n => {
                return Err(ExecutionFault::Connectivity("connection reset".into()))
            }
            _ => {}
        }

        let load = self.load(worker.hostname());
        let now = load.current.fetch_add(1, Ordering::SeqCst) + 1;
        load.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            provider: self.clone(),
            stem,
            behaviour,
            load,
        }))
    }
}

struct ScriptedSession {
    provider: ScriptedProvider,
    stem: String,
    behaviour: Behaviour,
    load: Arc<HostLoad>,
}

impl Session for ScriptedSession {
    fn push(&mut self, _local: &Path, _remote: &str) -> Result<(), ExecutionFault> {
        Ok(())
    }

    fn execute(
        &mut self,
        _command: &str,
        log: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<i32, ExecutionFault> {
        self.provider
            .shared
            .executions
            .lock()
            .unwrap()
            .push(self.stem.clone());
        thread::sleep(self.provider.delay);
        let text = match self.behaviour {
            Behaviour::Score(0) => "Tie game!".to_owned(),
            Behaviour::Score(s) if s > 0 => format!("The Red team wins by {s} points."),
            Behaviour::Score(s) => format!("The Blue team wins by {} points.", -s),
            Behaviour::FlakyThenRedWin(_) => "The Red team wins by 2 points.".to_owned(),
            Behaviour::Slow(ms) => {
                thread::sleep(Duration::from_millis(ms));
                "The Red team wins by 1 points.".to_owned()
            }
            Behaviour::RedCrash => "Red agent crashed: ZeroDivisionError".to_owned(),
            Behaviour::Unreachable => unreachable!(),
            Behaviour::Panic => panic!("scripted panic"),
            Behaviour::Hang => {
                let started = Instant::now();
                loop {
                    if cancel.is_forced() {
                        return Err(ExecutionFault::Cancelled);
                    }
                    if started.elapsed() > timeout {
                        return Err(ExecutionFault::Connectivity("timed out".into()));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        };
        fs::write(log, text).map_err(|e| ExecutionFault::Connectivity(e.to_string()))?;
        Ok(0)
    }

    fn pull(&mut self, _remote: &str, local: &Path) -> Result<(), ExecutionFault> {
        fs::write(local, format!("replay of {}", self.stem))
            .map_err(|e| ExecutionFault::Connectivity(e.to_string()))
    }

    fn disconnect(self: Box<Self>) -> Result<(), ExecutionFault> {
        self.load.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
